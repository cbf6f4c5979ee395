//! Renders an instance's log directory for humans (or as raw JSON).

use std::path::Path;

use super::protocol::{self, ConversationMessage, Role};
use crate::error::OverwatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Transcript with one role-prefixed paragraph per message.
    #[default]
    Readable,
    /// `final_result.json` pretty-printed as-is.
    Json,
}

/// Prefer `final_result.json`; fall back to `realtime_context.txt`.
///
/// `tail_lines` keeps only the last N lines of the transcript or context
/// (ignored for [`LogFormat::Json`]). `Ok(None)` when neither file exists.
pub async fn read_logs(
    log_dir: &Path,
    format: LogFormat,
    tail_lines: Option<usize>,
) -> Result<Option<String>, OverwatchError> {
    let final_path = log_dir.join(protocol::FINAL_RESULT_FILE);
    match tokio::fs::read_to_string(&final_path).await {
        Ok(raw) => return render_final_result(&raw, format, tail_lines).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    match tokio::fs::read_to_string(log_dir.join(protocol::REALTIME_CONTEXT_FILE)).await {
        Ok(context) => Ok(Some(tail(&context, tail_lines))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn render_final_result(
    raw: &str,
    format: LogFormat,
    tail_lines: Option<usize>,
) -> Result<String, OverwatchError> {
    if format == LogFormat::Json {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        return Ok(serde_json::to_string_pretty(&value)?);
    }

    let result: protocol::FinalResult = serde_json::from_str(raw)?;
    let mut sections = Vec::new();
    if !result.conversation.is_empty() {
        let transcript = result
            .conversation
            .iter()
            .map(render_message)
            .collect::<Vec<_>>()
            .join("\n\n");
        sections.push(tail(&transcript, tail_lines));
    }
    sections.push(format!("Status: {}", result.status));
    Ok(sections.join("\n\n"))
}

fn render_message(msg: &ConversationMessage) -> String {
    match (msg.role, msg.event_type.as_deref()) {
        (Role::User, _) => format!("USER: {}", msg.content),
        (Role::Assistant, _) => format!("ASSISTANT: {}", msg.content),
        (Role::System, Some(event)) => format!("SYSTEM ({event}): {}", msg.content),
        (Role::System, None) => format!("SYSTEM: {}", msg.content),
        (Role::Other, _) => format!("OTHER: {}", msg.content),
    }
}

fn tail(text: &str, lines: Option<usize>) -> String {
    match lines {
        Some(n) if n > 0 => {
            let all: Vec<&str> = text.split('\n').collect();
            all[all.len().saturating_sub(n)..].join("\n")
        }
        _ => text.to_string(),
    }
}

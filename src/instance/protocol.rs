//! File handshake between the supervisor and a worker.
//!
//! Every instance gets a log directory (its workspace). The supervisor writes
//! `followup_input.json` and `custom_prompt_<id>.md`; the worker writes
//! `status.json`, `final_result.json` and `realtime_context.txt`. Shapes must
//! stay compatible with an unmodified worker.
//!
//! There is no locking against the worker reading a followup while it is
//! being written; the worker polls and re-reads.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::OverwatchError;

pub const FOLLOWUP_FILE: &str = "followup_input.json";
pub const STATUS_FILE: &str = "status.json";
pub const FINAL_RESULT_FILE: &str = "final_result.json";
pub const REALTIME_CONTEXT_FILE: &str = "realtime_context.txt";

/// Worker-reported status meaning "paused, send me a followup".
pub const WAITING_FOR_FOLLOWUP: &str = "waiting_for_followup";

pub fn custom_prompt_path(workspace: &Path, instance_id: &str) -> PathBuf {
    workspace.join(format!("custom_prompt_{instance_id}.md"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowupMessage {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl FollowupMessage {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Contents of `status.json`. Only `status` is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StatusRecord {
    pub fn is_waiting_for_followup(&self) -> bool {
        self.status == WAITING_FOR_FOLLOWUP
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

/// Contents of `final_result.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    #[serde(default)]
    pub conversation: Vec<ConversationMessage>,
    #[serde(default = "unknown_status")]
    pub status: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn unknown_status() -> String {
    "unknown".to_string()
}

impl FinalResult {
    /// Content of the last assistant message in document order.
    pub fn last_assistant_message(&self) -> Option<&str> {
        self.conversation
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }
}

/// Write `followup_input.json`, creating the log directory if needed.
pub async fn write_followup(
    log_dir: &Path,
    followup: &FollowupMessage,
) -> Result<PathBuf, OverwatchError> {
    tokio::fs::create_dir_all(log_dir).await?;
    let path = log_dir.join(FOLLOWUP_FILE);
    let body = serde_json::to_string_pretty(followup)?;
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

pub async fn read_status(log_dir: &Path) -> Result<Option<StatusRecord>, OverwatchError> {
    read_json(&log_dir.join(STATUS_FILE)).await
}

pub async fn read_final_result(log_dir: &Path) -> Result<Option<FinalResult>, OverwatchError> {
    read_json(&log_dir.join(FINAL_RESULT_FILE)).await
}

/// Missing file → `Ok(None)`; unreadable or malformed → error.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, OverwatchError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

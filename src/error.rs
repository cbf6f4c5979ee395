use std::path::PathBuf;

use thiserror::Error;

use crate::anthropic::AnthropicError;
use crate::triage::TriagePhase;

#[derive(Debug, Error)]
pub enum OverwatchError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Workspace not found: {}", .0.display())]
    WorkspaceNotFound(PathBuf),

    #[error("Anthropic API error: {0}")]
    Anthropic(#[from] AnthropicError),

    #[error("Triage error: {0}")]
    Triage(#[from] TriageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Rejections raised by the triage state machine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TriageError {
    /// The action does not belong to the phase the case is in (including any
    /// action on a terminal case).
    #[error("cannot {action} while case is in {phase}")]
    InvalidState {
        action: &'static str,
        phase: TriagePhase,
    },

    #[error("CVSS score {0} is outside 0.0..=10.0")]
    InvalidCvssScore(f32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_display() {
        let err = TriageError::InvalidState {
            action: "finalize",
            phase: TriagePhase::Rejected,
        };
        assert_eq!(err.to_string(), "cannot finalize while case is in REJECTED");
    }

    #[test]
    fn triage_error_converts_into_crate_error() {
        let err: OverwatchError = TriageError::InvalidCvssScore(11.0).into();
        assert_eq!(
            err.to_string(),
            "Triage error: CVSS score 11 is outside 0.0..=10.0"
        );
    }
}

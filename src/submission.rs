//! Where validated findings go once triage finalizes them.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use crate::triage::{Severity, TriageCase, TriageState};

pub const SUBMISSION_LOG_FILE: &str = "vulnerability_submissions.log";

/// A finalized finding, flattened for the receiving side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub case_id: String,
    pub title: String,
    pub asset: String,
    pub vuln_type: String,
    pub description: String,
    pub repro_steps: String,
    pub impact: String,
    pub severity: Severity,
    pub cvss_score: f32,
    pub cvss_vector: String,
    pub severity_reasoning: String,
    pub evidence: String,
    pub additional_findings: String,
}

impl SubmissionRecord {
    /// `None` unless the case has reached SUBMITTED.
    pub fn from_case(case: &TriageCase) -> Option<Self> {
        let TriageState::Submitted {
            reproduction,
            assessment,
            ..
        } = &case.state
        else {
            return None;
        };
        let report = &case.report;
        Some(Self {
            case_id: case.id.clone(),
            title: report.title.clone(),
            asset: report.asset.clone(),
            vuln_type: report.vuln_type.clone(),
            description: report.description.clone(),
            repro_steps: report.repro_steps.clone(),
            impact: report.impact.clone(),
            severity: assessment.severity,
            cvss_score: assessment.cvss_score,
            cvss_vector: assessment.cvss_vector.clone(),
            severity_reasoning: assessment.reasoning.clone(),
            evidence: reproduction.evidence.clone(),
            additional_findings: reproduction.additional_findings.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub score: Option<f32>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

impl SubmissionResult {
    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            score: None,
            details: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            score: None,
            details: None,
        }
    }
}

/// Receives finalized findings. Failures are reported in the result, never raised.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, record: &SubmissionRecord) -> SubmissionResult;
}

#[derive(Debug, Serialize)]
struct LogEntry<'a> {
    timestamp: DateTime<Utc>,
    submission: &'a SubmissionRecord,
    result: &'a SubmissionResult,
}

/// Appends one JSON line per submission to `<session>/vulnerability_submissions.log`.
#[derive(Debug, Clone)]
pub struct FileSubmitter {
    log_path: PathBuf,
}

impl FileSubmitter {
    pub fn new(session_dir: &Path) -> Self {
        Self {
            log_path: session_dir.join(SUBMISSION_LOG_FILE),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await
    }
}

#[async_trait]
impl Submitter for FileSubmitter {
    async fn submit(&self, record: &SubmissionRecord) -> SubmissionResult {
        let result = SubmissionResult::accepted(format!(
            "recorded {} ({}, CVSS {:.1})",
            record.title, record.severity, record.cvss_score
        ));
        let entry = LogEntry {
            timestamp: Utc::now(),
            submission: record,
            result: &result,
        };

        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "failed to serialize submission");
                return SubmissionResult::failed(format!("serialize submission: {e}"));
            }
        };
        if let Err(e) = self.append(&line).await {
            error!(path = %self.log_path.display(), error = %e, "failed to log submission");
            return SubmissionResult::failed(format!("write {}: {e}", self.log_path.display()));
        }

        info!(case_id = %record.case_id, path = %self.log_path.display(), "submission recorded");
        result
    }
}

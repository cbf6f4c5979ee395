use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use super::reviewer::TriageReviewer;
use super::state::{SeverityAssessment, TriageCase, TriagePhase, TriageState};
use crate::submission::{SubmissionRecord, SubmissionResult, Submitter};

/// Where a case ended up after [`TriageEngine::run`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriageOutcome {
    pub case_id: String,
    pub phase: TriagePhase,
    /// Present only when this call finalized the case.
    pub submission: Option<SubmissionResult>,
}

/// Drives cases through the three phases with a reviewer and hands finalized
/// findings to a submitter.
pub struct TriageEngine {
    reviewer: Arc<dyn TriageReviewer>,
    submitter: Arc<dyn Submitter>,
}

impl TriageEngine {
    pub fn new(reviewer: Arc<dyn TriageReviewer>, submitter: Arc<dyn Submitter>) -> Self {
        Self {
            reviewer,
            submitter,
        }
    }

    /// Run `case` from wherever it is to a terminal phase.
    ///
    /// Reviewer errors abort the run and leave the case in the phase that
    /// failed, so it can be resumed. A case that is already terminal is
    /// returned as-is without contacting the reviewer.
    pub async fn run(&self, case: &mut TriageCase) -> Result<TriageOutcome> {
        loop {
            match &case.state {
                TriageState::InitialReview => {
                    let decision = self
                        .reviewer
                        .initial_review(&case.report)
                        .await
                        .context("initial review failed")?;
                    let phase = case.apply(decision.into())?;
                    info!(case_id = %case.id, %phase, "phase 1 complete");
                }
                TriageState::Validation { review } => {
                    let decision = self
                        .reviewer
                        .validate(&case.report, review)
                        .await
                        .context("validation failed")?;
                    let phase = case.apply(decision.into())?;
                    info!(case_id = %case.id, %phase, "phase 2 complete");
                }
                TriageState::SeverityAssessment { reproduction, .. } => {
                    let assessment = self
                        .reviewer
                        .assess_severity(&case.report, reproduction)
                        .await
                        .context("severity assessment failed")?;
                    return self.finalize(case, assessment).await;
                }
                TriageState::Rejected { .. }
                | TriageState::NotReproduced { .. }
                | TriageState::Submitted { .. } => {
                    return Ok(TriageOutcome {
                        case_id: case.id.clone(),
                        phase: case.phase(),
                        submission: None,
                    });
                }
            }
        }
    }

    /// Apply phase 3 and submit. The transition happens before the side
    /// effect, so a case can only ever be submitted once; a failed submission
    /// leaves the case SUBMITTED with `success == false` in the result.
    pub async fn finalize(
        &self,
        case: &mut TriageCase,
        assessment: SeverityAssessment,
    ) -> Result<TriageOutcome> {
        case.finalize(assessment)?;
        let record = SubmissionRecord::from_case(case)
            .context("finalized case did not reach SUBMITTED")?;

        let result = self.submitter.submit(&record).await;
        if result.success {
            info!(case_id = %case.id, severity = %record.severity, cvss = record.cvss_score, "finding submitted");
        } else {
            warn!(case_id = %case.id, message = %result.message, "submission failed");
        }

        Ok(TriageOutcome {
            case_id: case.id.clone(),
            phase: case.phase(),
            submission: Some(result),
        })
    }
}

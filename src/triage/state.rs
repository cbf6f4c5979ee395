use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OverwatchError, TriageError};

/// A vulnerability report as submitted for triage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityReport {
    pub title: String,
    pub asset: String,
    /// Severity claimed by the reporter; triage assigns its own.
    #[serde(default)]
    pub severity: String,
    #[serde(default, alias = "type")]
    pub vuln_type: String,
    pub description: String,
    #[serde(default)]
    pub repro_steps: String,
    #[serde(default)]
    pub impact: String,
}

impl VulnerabilityReport {
    pub async fn load(path: &Path) -> Result<Self, OverwatchError> {
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Phase a case is in. Display uses the wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriagePhase {
    #[serde(rename = "PHASE1_REVIEW")]
    InitialReview,
    #[serde(rename = "PHASE2_VALIDATION")]
    Validation,
    #[serde(rename = "PHASE3_SEVERITY")]
    SeverityAssessment,
    Rejected,
    NotReproduced,
    Submitted,
}

impl TriagePhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TriagePhase::Rejected | TriagePhase::NotReproduced | TriagePhase::Submitted
        )
    }
}

impl fmt::Display for TriagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriagePhase::InitialReview => write!(f, "PHASE1_REVIEW"),
            TriagePhase::Validation => write!(f, "PHASE2_VALIDATION"),
            TriagePhase::SeverityAssessment => write!(f, "PHASE3_SEVERITY"),
            TriagePhase::Rejected => write!(f, "REJECTED"),
            TriagePhase::NotReproduced => write!(f, "NOT_REPRODUCED"),
            TriagePhase::Submitted => write!(f, "SUBMITTED"),
        }
    }
}

/// Outcome of phase 1 when the report moves on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialReview {
    pub reasoning: String,
    pub notes: String,
}

/// Outcome of phase 2 when the finding was reproduced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reproduction {
    pub evidence: String,
    pub additional_findings: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    #[serde(alias = "critical", alias = "CRITICAL")]
    Critical,
    #[serde(alias = "high", alias = "HIGH")]
    High,
    #[serde(alias = "medium", alias = "MEDIUM")]
    Medium,
    #[serde(alias = "low", alias = "LOW")]
    Low,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Critical => write!(f, "Critical"),
            Severity::High => write!(f, "High"),
            Severity::Medium => write!(f, "Medium"),
            Severity::Low => write!(f, "Low"),
        }
    }
}

/// Outcome of phase 3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityAssessment {
    pub severity: Severity,
    pub cvss_score: f32,
    pub cvss_vector: String,
    pub reasoning: String,
}

/// Where a case stands, carrying everything earlier phases established.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase")]
pub enum TriageState {
    #[serde(rename = "PHASE1_REVIEW")]
    InitialReview,
    #[serde(rename = "PHASE2_VALIDATION")]
    Validation { review: InitialReview },
    #[serde(rename = "PHASE3_SEVERITY")]
    SeverityAssessment {
        review: InitialReview,
        reproduction: Reproduction,
    },
    #[serde(rename = "REJECTED")]
    Rejected { reasoning: String },
    #[serde(rename = "NOT_REPRODUCED")]
    NotReproduced {
        review: InitialReview,
        feedback: String,
    },
    #[serde(rename = "SUBMITTED")]
    Submitted {
        review: InitialReview,
        reproduction: Reproduction,
        assessment: SeverityAssessment,
    },
}

impl TriageState {
    pub fn phase(&self) -> TriagePhase {
        match self {
            TriageState::InitialReview => TriagePhase::InitialReview,
            TriageState::Validation { .. } => TriagePhase::Validation,
            TriageState::SeverityAssessment { .. } => TriagePhase::SeverityAssessment,
            TriageState::Rejected { .. } => TriagePhase::Rejected,
            TriageState::NotReproduced { .. } => TriagePhase::NotReproduced,
            TriageState::Submitted { .. } => TriagePhase::Submitted,
        }
    }
}

/// A phase result applied to a case.
#[derive(Debug, Clone, PartialEq)]
pub enum TriageAction {
    Proceed(InitialReview),
    Reject { reasoning: String },
    Reproduced(Reproduction),
    NotReproduced { feedback: String },
    Finalize(SeverityAssessment),
}

impl TriageAction {
    fn name(&self) -> &'static str {
        match self {
            TriageAction::Proceed(_) => "proceed",
            TriageAction::Reject { .. } => "reject",
            TriageAction::Reproduced(_) => "mark reproduced",
            TriageAction::NotReproduced { .. } => "mark not reproduced",
            TriageAction::Finalize(_) => "finalize",
        }
    }
}

/// Transition function for triage cases.
pub struct TriageStateMachine;

impl TriageStateMachine {
    /// Compute the state that follows `state` under `action`.
    ///
    /// Every (state, action) pair has an answer: the five forward edges
    /// produce the next state, everything else (including any action on a
    /// terminal state) is [`TriageError::InvalidState`]. `Finalize` also
    /// rejects CVSS scores that are not finite or fall outside 0..=10.
    pub fn next(state: &TriageState, action: TriageAction) -> Result<TriageState, TriageError> {
        match (state, action) {
            (TriageState::InitialReview, TriageAction::Proceed(review)) => {
                Ok(TriageState::Validation { review })
            }
            (TriageState::InitialReview, TriageAction::Reject { reasoning }) => {
                Ok(TriageState::Rejected { reasoning })
            }
            (TriageState::Validation { review }, TriageAction::Reproduced(reproduction)) => {
                Ok(TriageState::SeverityAssessment {
                    review: review.clone(),
                    reproduction,
                })
            }
            (TriageState::Validation { review }, TriageAction::NotReproduced { feedback }) => {
                Ok(TriageState::NotReproduced {
                    review: review.clone(),
                    feedback,
                })
            }
            (
                TriageState::SeverityAssessment {
                    review,
                    reproduction,
                },
                TriageAction::Finalize(assessment),
            ) => {
                let score = assessment.cvss_score;
                if !score.is_finite() || !(0.0..=10.0).contains(&score) {
                    return Err(TriageError::InvalidCvssScore(score));
                }
                Ok(TriageState::Submitted {
                    review: review.clone(),
                    reproduction: reproduction.clone(),
                    assessment,
                })
            }
            (state, action) => Err(TriageError::InvalidState {
                action: action.name(),
                phase: state.phase(),
            }),
        }
    }
}

/// One report moving through triage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageCase {
    pub id: String,
    pub report: VulnerabilityReport,
    pub state: TriageState,
    /// Phases already left, oldest first.
    pub history: Vec<TriagePhase>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TriageCase {
    pub fn new(report: VulnerabilityReport) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            report,
            state: TriageState::InitialReview,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn phase(&self) -> TriagePhase {
        self.state.phase()
    }

    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    /// Apply `action`; on error the case is left untouched.
    pub fn apply(&mut self, action: TriageAction) -> Result<TriagePhase, TriageError> {
        let next = TriageStateMachine::next(&self.state, action)?;
        self.history.push(self.phase());
        self.state = next;
        self.updated_at = Utc::now();
        Ok(self.phase())
    }

    pub fn proceed(
        &mut self,
        reasoning: impl Into<String>,
        notes: impl Into<String>,
    ) -> Result<TriagePhase, TriageError> {
        self.apply(TriageAction::Proceed(InitialReview {
            reasoning: reasoning.into(),
            notes: notes.into(),
        }))
    }

    pub fn reject(&mut self, reasoning: impl Into<String>) -> Result<TriagePhase, TriageError> {
        self.apply(TriageAction::Reject {
            reasoning: reasoning.into(),
        })
    }

    pub fn reproduced(
        &mut self,
        evidence: impl Into<String>,
        additional_findings: impl Into<String>,
    ) -> Result<TriagePhase, TriageError> {
        self.apply(TriageAction::Reproduced(Reproduction {
            evidence: evidence.into(),
            additional_findings: additional_findings.into(),
        }))
    }

    pub fn not_reproduced(
        &mut self,
        feedback: impl Into<String>,
    ) -> Result<TriagePhase, TriageError> {
        self.apply(TriageAction::NotReproduced {
            feedback: feedback.into(),
        })
    }

    pub fn finalize(&mut self, assessment: SeverityAssessment) -> Result<TriagePhase, TriageError> {
        self.apply(TriageAction::Finalize(assessment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn report_loads_with_type_alias_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        std::fs::write(
            &path,
            r#"{"title": "Reflected XSS", "asset": "app.example.com", "type": "xss", "description": "q param"}"#,
        )
        .unwrap();

        let report = VulnerabilityReport::load(&path).await.unwrap();
        assert_eq!(report.vuln_type, "xss");
        assert!(report.repro_steps.is_empty());
    }

    #[tokio::test]
    async fn missing_report_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = VulnerabilityReport::load(&dir.path().join("nope.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, OverwatchError::Io(_)));
    }

    fn report() -> VulnerabilityReport {
        VulnerabilityReport {
            title: "SQL injection in login".into(),
            asset: "app.example.test".into(),
            severity: "Critical".into(),
            vuln_type: "sqli".into(),
            description: "The username parameter is concatenated into a query".into(),
            repro_steps: "POST /login with username=' OR 1=1--".into(),
            impact: "Authentication bypass".into(),
        }
    }

    fn assessment(score: f32) -> SeverityAssessment {
        SeverityAssessment {
            severity: Severity::High,
            cvss_score: score,
            cvss_vector: "AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:N".into(),
            reasoning: "Unauthenticated bypass of the login".into(),
        }
    }

    #[test]
    fn happy_path_walks_all_phases() {
        let mut case = TriageCase::new(report());
        assert_eq!(case.phase(), TriagePhase::InitialReview);

        assert_eq!(
            case.proceed("in scope, clear steps", "focus on login").unwrap(),
            TriagePhase::Validation
        );
        assert_eq!(
            case.reproduced("got a session as admin", "also affects /api/login")
                .unwrap(),
            TriagePhase::SeverityAssessment
        );
        assert_eq!(case.finalize(assessment(7.5)).unwrap(), TriagePhase::Submitted);

        assert!(case.is_terminal());
        assert_eq!(
            case.history,
            vec![
                TriagePhase::InitialReview,
                TriagePhase::Validation,
                TriagePhase::SeverityAssessment
            ]
        );
        let TriageState::Submitted {
            review,
            reproduction,
            assessment,
        } = &case.state
        else {
            panic!("expected submitted, got {:?}", case.state);
        };
        assert_eq!(review.notes, "focus on login");
        assert_eq!(reproduction.additional_findings, "also affects /api/login");
        assert_eq!(assessment.severity, Severity::High);
    }

    #[test]
    fn second_finalize_is_rejected() {
        let mut case = TriageCase::new(report());
        case.proceed("ok", "").unwrap();
        case.reproduced("ok", "").unwrap();
        case.finalize(assessment(7.5)).unwrap();

        let err = case.finalize(assessment(7.5)).unwrap_err();
        assert_eq!(
            err,
            TriageError::InvalidState {
                action: "finalize",
                phase: TriagePhase::Submitted
            }
        );
        assert_eq!(case.history.len(), 3);
    }

    #[test]
    fn rejected_case_accepts_nothing_further() {
        let mut case = TriageCase::new(report());
        case.reject("asset is out of scope").unwrap();
        assert_eq!(case.phase(), TriagePhase::Rejected);

        assert!(case.reproduced("e", "").is_err());
        assert!(case.not_reproduced("f").is_err());
        assert!(case.finalize(assessment(5.0)).is_err());
        assert!(case.proceed("r", "n").is_err());
        assert_eq!(
            case.state,
            TriageState::Rejected {
                reasoning: "asset is out of scope".into()
            }
        );
    }

    #[test]
    fn not_reproduced_is_terminal_and_keeps_the_review() {
        let mut case = TriageCase::new(report());
        case.proceed("worth a look", "n").unwrap();
        case.not_reproduced("the payload returns a 403").unwrap();

        assert!(case.is_terminal());
        assert!(matches!(
            &case.state,
            TriageState::NotReproduced { review, feedback }
                if review.reasoning == "worth a look" && feedback == "the payload returns a 403"
        ));
        assert!(case.finalize(assessment(5.0)).is_err());
    }

    #[test]
    fn phases_cannot_be_skipped() {
        let mut case = TriageCase::new(report());
        let err = case.finalize(assessment(9.8)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot finalize while case is in PHASE1_REVIEW"
        );
        assert!(case.reproduced("e", "").is_err());
        assert_eq!(case.phase(), TriagePhase::InitialReview);
        assert!(case.history.is_empty());

        case.proceed("r", "n").unwrap();
        assert!(case.proceed("again", "n").is_err());
        assert!(case.reject("too late").is_err());
    }

    #[test]
    fn invalid_cvss_scores_leave_the_case_in_phase_three() {
        let mut case = TriageCase::new(report());
        case.proceed("r", "n").unwrap();
        case.reproduced("e", "").unwrap();

        for score in [10.5, -0.1, f32::NAN, f32::INFINITY] {
            assert!(matches!(
                case.finalize(assessment(score)),
                Err(TriageError::InvalidCvssScore(_))
            ));
        }
        assert_eq!(case.phase(), TriagePhase::SeverityAssessment);

        case.finalize(assessment(10.0)).unwrap();
        assert_eq!(case.phase(), TriagePhase::Submitted);
    }

    #[test]
    fn state_serializes_with_wire_phase_tag() {
        let state = TriageState::Rejected {
            reasoning: "dup".into(),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["phase"], "REJECTED");
        assert_eq!(
            serde_json::to_value(TriagePhase::SeverityAssessment).unwrap(),
            "PHASE3_SEVERITY"
        );
    }

    #[test]
    fn report_accepts_type_alias_and_missing_optionals() {
        let report: VulnerabilityReport = serde_json::from_str(
            r#"{"title": "t", "asset": "a", "description": "d", "type": "xss"}"#,
        )
        .unwrap();
        assert_eq!(report.vuln_type, "xss");
        assert!(report.repro_steps.is_empty());
    }

    #[test]
    fn severity_accepts_common_spellings() {
        for raw in [r#""High""#, r#""high""#, r#""HIGH""#] {
            assert_eq!(serde_json::from_str::<Severity>(raw).unwrap(), Severity::High);
        }
    }
}

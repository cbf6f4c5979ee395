//! Three-phase review of reported findings: initial review, validation,
//! severity assessment.

mod engine;
mod reviewer;
mod state;

pub use engine::{TriageEngine, TriageOutcome};
pub use reviewer::{InitialDecision, LlmTriageReviewer, TriageReviewer, ValidationDecision};
pub use state::{
    InitialReview, Reproduction, Severity, SeverityAssessment, TriageAction, TriageCase,
    TriagePhase, TriageState, TriageStateMachine, VulnerabilityReport,
};

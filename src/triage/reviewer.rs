use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};
use uuid::Uuid;

use super::state::{InitialReview, Reproduction, SeverityAssessment, TriageAction, VulnerabilityReport};
use crate::anthropic::{MessageSender, MessagesRequest};
use crate::instance::{InstanceManager, LogFormat, SpawnRequest, WaitOutcome, WaitTarget};

/// Phase 1 verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum InitialDecision {
    Proceed(InitialReview),
    Reject { reasoning: String },
}

/// Phase 2 verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationDecision {
    Reproduced(Reproduction),
    NotReproduced { feedback: String },
}

impl From<InitialDecision> for TriageAction {
    fn from(decision: InitialDecision) -> Self {
        match decision {
            InitialDecision::Proceed(review) => TriageAction::Proceed(review),
            InitialDecision::Reject { reasoning } => TriageAction::Reject { reasoning },
        }
    }
}

impl From<ValidationDecision> for TriageAction {
    fn from(decision: ValidationDecision) -> Self {
        match decision {
            ValidationDecision::Reproduced(reproduction) => TriageAction::Reproduced(reproduction),
            ValidationDecision::NotReproduced { feedback } => {
                TriageAction::NotReproduced { feedback }
            }
        }
    }
}

/// The analysis behind each triage phase.
#[async_trait]
pub trait TriageReviewer: Send + Sync {
    async fn initial_review(&self, report: &VulnerabilityReport) -> Result<InitialDecision>;

    async fn validate(
        &self,
        report: &VulnerabilityReport,
        review: &InitialReview,
    ) -> Result<ValidationDecision>;

    async fn assess_severity(
        &self,
        report: &VulnerabilityReport,
        reproduction: &Reproduction,
    ) -> Result<SeverityAssessment>;
}

const SYSTEM_PROMPT: &str = "You triage vulnerability reports from an authorized penetration test. \
     You are skeptical, precise and reply only with the JSON object requested.";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum ReviewVerdict {
    Proceed,
    Reject,
}

#[derive(Debug, Deserialize)]
struct ReviewReply {
    decision: ReviewVerdict,
    reasoning: String,
    #[serde(default)]
    notes: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum ValidationVerdict {
    Reproduced,
    NotReproduced,
}

#[derive(Debug, Deserialize)]
struct ValidationReply {
    decision: ValidationVerdict,
    #[serde(default)]
    evidence: String,
    #[serde(default)]
    additional_findings: String,
    #[serde(default)]
    feedback: String,
}

/// Reproduction sub-instances for phase 2.
#[derive(Clone)]
struct Reproducer {
    manager: InstanceManager,
    budget: Duration,
}

/// [`TriageReviewer`] that asks a model for each verdict, optionally backing
/// phase 2 with a worker instance that tries to reproduce the finding.
pub struct LlmTriageReviewer {
    client: Arc<dyn MessageSender>,
    model: String,
    scope: Option<String>,
    reproducer: Option<Reproducer>,
}

impl LlmTriageReviewer {
    pub fn new(client: Arc<dyn MessageSender>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            scope: None,
            reproducer: None,
        }
    }

    /// Testing scope the report is checked against in phase 1.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_reproduction(mut self, manager: InstanceManager, budget: Duration) -> Self {
        self.reproducer = Some(Reproducer { manager, budget });
        self
    }

    async fn ask<T: DeserializeOwned>(&self, prompt: String) -> Result<T> {
        let req = MessagesRequest::user(&self.model, 2048, prompt)
            .with_system(SYSTEM_PROMPT)
            .with_temperature(0.0);
        let response = self.client.send_message(&req).await?;
        let text = response.text();
        let json = extract_json(&text).ok_or_else(|| anyhow!("no JSON object in reply: {text:?}"))?;
        serde_json::from_str(json).with_context(|| format!("unexpected reply shape: {json}"))
    }

    /// Spawn a worker on the repro steps, wait for its first answer (or its
    /// end), collect the transcript and terminate it.
    async fn attempt_reproduction(&self, report: &VulnerabilityReport) -> Option<String> {
        let reproducer = self.reproducer.as_ref()?;
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let id = format!("triage-repro-{suffix}");

        let request = SpawnRequest::new(&id, reproduction_task(report), &id, reproducer.budget);
        if !reproducer.manager.spawn(request).await {
            warn!(instance_id = %id, "could not start reproduction instance");
            return None;
        }
        info!(instance_id = %id, "started reproduction instance");

        let outcome = reproducer
            .manager
            .wait_for_instance(&id, reproducer.budget, WaitTarget::Response)
            .await;
        let transcript = reproducer
            .manager
            .read_logs(&id, LogFormat::Readable, Some(200))
            .await;
        reproducer.manager.terminate(&id).await;

        let summary = match outcome {
            WaitOutcome::Response(text) => format!("Worker's answer:\n{text}"),
            WaitOutcome::Finished(status) => format!("Worker ended with status {status}."),
            WaitOutcome::TimedOut => "Worker did not answer within its budget.".to_string(),
            WaitOutcome::NotFound => "Worker disappeared before answering.".to_string(),
        };
        Some(match transcript {
            Some(transcript) => format!("{summary}\n\nTranscript tail:\n{transcript}"),
            None => summary,
        })
    }
}

#[async_trait]
impl TriageReviewer for LlmTriageReviewer {
    async fn initial_review(&self, report: &VulnerabilityReport) -> Result<InitialDecision> {
        let reply: ReviewReply = self
            .ask(initial_review_prompt(report, self.scope.as_deref()))
            .await
            .context("phase 1 review")?;
        Ok(match reply.decision {
            ReviewVerdict::Proceed => InitialDecision::Proceed(InitialReview {
                reasoning: reply.reasoning,
                notes: reply.notes,
            }),
            ReviewVerdict::Reject => InitialDecision::Reject {
                reasoning: reply.reasoning,
            },
        })
    }

    async fn validate(
        &self,
        report: &VulnerabilityReport,
        review: &InitialReview,
    ) -> Result<ValidationDecision> {
        let attempt = self.attempt_reproduction(report).await;
        let reply: ValidationReply = self
            .ask(validation_prompt(report, review, attempt.as_deref()))
            .await
            .context("phase 2 validation")?;
        Ok(match reply.decision {
            ValidationVerdict::Reproduced => ValidationDecision::Reproduced(Reproduction {
                evidence: reply.evidence,
                additional_findings: reply.additional_findings,
            }),
            ValidationVerdict::NotReproduced => ValidationDecision::NotReproduced {
                feedback: if reply.feedback.is_empty() {
                    reply.evidence
                } else {
                    reply.feedback
                },
            },
        })
    }

    async fn assess_severity(
        &self,
        report: &VulnerabilityReport,
        reproduction: &Reproduction,
    ) -> Result<SeverityAssessment> {
        self.ask(severity_prompt(report, reproduction))
            .await
            .context("phase 3 severity")
    }
}

/// Slice from the first `{` to the last `}`; models like to wrap JSON in prose or fences.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

fn report_block(report: &VulnerabilityReport) -> String {
    format!(
        "- Title: {}\n- Asset: {}\n- Reported severity: {}\n- Type: {}\n- Description: {}\n\n\
         Reproduction steps:\n```\n{}\n```\n\nClaimed impact:\n{}",
        report.title,
        report.asset,
        report.severity,
        report.vuln_type,
        report.description,
        report.repro_steps,
        report.impact
    )
}

fn initial_review_prompt(report: &VulnerabilityReport, scope: Option<&str>) -> String {
    format!(
        "PHASE 1: INITIAL REVIEW\n\n\
         Vulnerability report:\n{}\n\n\
         Testing scope:\n{}\n\n\
         Check that the asset is in scope, the steps are complete and actionable, the issue is \
         a genuine vulnerability and the claimed impact is realistic. Decide whether it is worth \
         reproducing.\n\n\
         Reply with JSON: {{\"decision\": \"PROCEED\" | \"REJECT\", \"reasoning\": string, \
         \"notes\": string}}",
        report_block(report),
        scope.unwrap_or("not specified")
    )
}

fn validation_prompt(
    report: &VulnerabilityReport,
    review: &InitialReview,
    attempt: Option<&str>,
) -> String {
    let attempt = attempt.unwrap_or(
        "No reproduction worker was available. Judge from the report alone and only answer \
         REPRODUCED if the steps are unambiguous.",
    );
    format!(
        "PHASE 2: VALIDATION\n\n\
         Vulnerability report:\n{}\n\n\
         Phase 1 reasoning: {}\nPhase 1 notes: {}\n\n\
         Reproduction attempt:\n{attempt}\n\n\
         Reply with JSON: {{\"decision\": \"REPRODUCED\" | \"NOT_REPRODUCED\", \"evidence\": \
         string, \"additional_findings\": string, \"feedback\": string}}",
        report_block(report),
        review.reasoning,
        review.notes
    )
}

fn severity_prompt(report: &VulnerabilityReport, reproduction: &Reproduction) -> String {
    format!(
        "PHASE 3: SEVERITY ASSESSMENT\n\n\
         Vulnerability report:\n{}\n\n\
         Reproduction evidence:\n{}\n\nAdditional findings:\n{}\n\n\
         Classify with CVSS v3.1: Critical 9.0-10.0, High 7.0-8.9, Medium 4.0-6.9, Low 0.1-3.9.\n\n\
         Reply with JSON: {{\"severity\": \"Critical\" | \"High\" | \"Medium\" | \"Low\", \
         \"cvss_score\": number, \"cvss_vector\": string, \"reasoning\": string}}",
        report_block(report),
        reproduction.evidence,
        reproduction.additional_findings
    )
}

fn reproduction_task(report: &VulnerabilityReport) -> String {
    format!(
        "Reproduce this reported vulnerability on {}. Title: {}. Steps:\n{}\n\n\
         Do not go beyond what is needed to confirm it. When done, report whether it \
         reproduced and include the exact requests, commands and responses as evidence.",
        report.asset, report.title, report.repro_steps
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{ManagerSettings, WorkerLauncher};
    use crate::router::TaskRouter;
    use crate::testing::{MockClient, ScriptedLauncher};
    use crate::triage::Severity;

    fn report() -> VulnerabilityReport {
        VulnerabilityReport {
            title: "Stored XSS in comments".into(),
            asset: "blog.example.test".into(),
            severity: "High".into(),
            vuln_type: "xss".into(),
            description: "Comment body is rendered unescaped".into(),
            repro_steps: "Post <script>alert(1)</script> as a comment".into(),
            impact: "Session theft".into(),
        }
    }

    fn review() -> InitialReview {
        InitialReview {
            reasoning: "in scope".into(),
            notes: "check CSP".into(),
        }
    }

    #[tokio::test]
    async fn initial_review_parses_fenced_json() {
        let client = Arc::new(MockClient::ok(
            "Here you go:\n```json\n{\"decision\": \"PROCEED\", \"reasoning\": \"clear steps\", \"notes\": \"n\"}\n```",
        ));
        let reviewer = LlmTriageReviewer::new(client.clone(), "sonnet").with_scope("*.example.test");

        let decision = reviewer.initial_review(&report()).await.unwrap();
        assert_eq!(
            decision,
            InitialDecision::Proceed(InitialReview {
                reasoning: "clear steps".into(),
                notes: "n".into()
            })
        );
        let prompt = &client.requests.lock().unwrap()[0].messages[0].content;
        assert!(prompt.contains("*.example.test"));
        assert!(prompt.contains("Stored XSS in comments"));
    }

    #[tokio::test]
    async fn reject_verdict_maps_to_reject() {
        let client = Arc::new(MockClient::ok(
            r#"{"decision": "REJECT", "reasoning": "out of scope"}"#,
        ));
        let reviewer = LlmTriageReviewer::new(client, "sonnet");
        assert_eq!(
            reviewer.initial_review(&report()).await.unwrap(),
            InitialDecision::Reject {
                reasoning: "out of scope".into()
            }
        );
    }

    #[tokio::test]
    async fn unknown_verdict_is_an_error() {
        let client = Arc::new(MockClient::ok(r#"{"decision": "MAYBE", "reasoning": "?"}"#));
        let reviewer = LlmTriageReviewer::new(client, "sonnet");
        assert!(reviewer.initial_review(&report()).await.is_err());
    }

    #[tokio::test]
    async fn not_reproduced_falls_back_to_evidence_for_feedback() {
        let client = Arc::new(MockClient::ok(
            r#"{"decision": "NOT_REPRODUCED", "evidence": "payload was escaped"}"#,
        ));
        let reviewer = LlmTriageReviewer::new(client.clone(), "sonnet");

        let decision = reviewer.validate(&report(), &review()).await.unwrap();
        assert_eq!(
            decision,
            ValidationDecision::NotReproduced {
                feedback: "payload was escaped".into()
            }
        );
        let prompt = &client.requests.lock().unwrap()[0].messages[0].content;
        assert!(prompt.contains("No reproduction worker was available"));
    }

    #[tokio::test]
    async fn validation_runs_and_cleans_up_a_reproduction_instance() {
        let session = tempfile::tempdir().unwrap();
        let launcher = Arc::new(ScriptedLauncher::default());
        let settings = ManagerSettings {
            session_dir: session.path().to_path_buf(),
            kill_grace: Duration::from_millis(20),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let manager = InstanceManager::new(
            settings,
            launcher.clone() as Arc<dyn WorkerLauncher>,
            TaskRouter::offline(),
            None,
        )
        .unwrap();

        let client = Arc::new(MockClient::ok(
            r#"{"decision": "REPRODUCED", "evidence": "alert fired", "additional_findings": "also in profile bio"}"#,
        ));
        let reviewer = LlmTriageReviewer::new(client.clone(), "sonnet")
            .with_reproduction(manager.clone(), Duration::from_millis(50));

        let decision = reviewer.validate(&report(), &review()).await.unwrap();
        assert_eq!(
            decision,
            ValidationDecision::Reproduced(Reproduction {
                evidence: "alert fired".into(),
                additional_findings: "also in profile bio".into()
            })
        );

        assert_eq!(launcher.launches(), 1);
        assert!(launcher.command(0).args.last().unwrap().contains("<script>alert(1)</script>"));
        assert!(manager.list_active().await.is_empty());
        let prompt = &client.requests.lock().unwrap()[0].messages[0].content;
        assert!(!prompt.contains("No reproduction worker was available"));
        assert!(prompt.contains("Reproduction attempt:\nWorker "));
    }

    #[tokio::test]
    async fn severity_reply_deserializes_directly() {
        let client = Arc::new(MockClient::ok(
            r#"{"severity": "high", "cvss_score": 7.1, "cvss_vector": "AV:N/AC:L/PR:N/UI:R/S:U/C:H/I:L/A:N", "reasoning": "needs a click"}"#,
        ));
        let reviewer = LlmTriageReviewer::new(client, "sonnet");
        let reproduction = Reproduction {
            evidence: "e".into(),
            additional_findings: String::new(),
        };

        let assessment = reviewer
            .assess_severity(&report(), &reproduction)
            .await
            .unwrap();
        assert_eq!(assessment.severity, Severity::High);
        assert!((assessment.cvss_score - 7.1).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn api_failure_is_an_error() {
        let reviewer = LlmTriageReviewer::new(Arc::new(MockClient::err(500)), "sonnet");
        assert!(reviewer.initial_review(&report()).await.is_err());
    }

    #[test]
    fn extract_json_finds_the_outer_object() {
        assert_eq!(extract_json("x {\"a\": {\"b\": 1}} y"), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(extract_json("no json"), None);
        assert_eq!(extract_json("} backwards {"), None);
    }
}

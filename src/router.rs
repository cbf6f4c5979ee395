use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::anthropic::{MessageSender, MessagesRequest};

/// Behavioral profile a worker runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Specialist {
    ActiveDirectory,
    ClientSideWeb,
    Enumeration,
    LinuxPrivesc,
    Shelling,
    WebEnumeration,
    Web,
    WindowsPrivesc,
    /// Fallback profile; never offered to the classifier.
    #[default]
    Generalist,
}

impl Specialist {
    /// Profiles the classifier may choose from, in rubric order.
    pub const ROUTABLE: [Specialist; 8] = [
        Specialist::ActiveDirectory,
        Specialist::ClientSideWeb,
        Specialist::Enumeration,
        Specialist::LinuxPrivesc,
        Specialist::Shelling,
        Specialist::WebEnumeration,
        Specialist::Web,
        Specialist::WindowsPrivesc,
    ];

    /// Wire identifier passed to `--mode`.
    pub fn id(self) -> &'static str {
        match self {
            Specialist::ActiveDirectory => "active-directory",
            Specialist::ClientSideWeb => "client-side-web",
            Specialist::Enumeration => "enumeration",
            Specialist::LinuxPrivesc => "linux-privesc",
            Specialist::Shelling => "shelling",
            Specialist::WebEnumeration => "web-enumeration",
            Specialist::Web => "web",
            Specialist::WindowsPrivesc => "windows-privesc",
            Specialist::Generalist => "generalist",
        }
    }

    fn rubric(self) -> &'static str {
        match self {
            Specialist::ActiveDirectory => {
                "Active Directory work: LDAP queries, Kerberos attacks, domain mapping, group \
                 memberships, SPNs, delegation and signing policies"
            }
            Specialist::ClientSideWeb => {
                "Client-side web flaws: XSS, CSRF, XS-Leaks, CSS injection, DOM manipulation, \
                 browser-based credential theft"
            }
            Specialist::Enumeration => {
                "Network and service enumeration: port scanning, service and OS detection, \
                 network mapping, vulnerability scanning"
            }
            Specialist::LinuxPrivesc => {
                "Linux privilege escalation from an existing foothold: sudo rules, SUID/SGID \
                 binaries, kernel exploits, container escapes, cron jobs, file permissions"
            }
            Specialist::Shelling => {
                "Getting and keeping a shell: payload generation and delivery, reverse shells, \
                 TTY upgrades, pivoting, connection reliability"
            }
            Specialist::WebEnumeration => {
                "Web reconnaissance: directory and file brute-forcing, API endpoint discovery, \
                 crawling, finding sensitive endpoints"
            }
            Specialist::Web => {
                "Server-side web flaws: SQL and NoSQL injection, IDOR, file upload, LFI/RFI, \
                 command injection, server-side template injection"
            }
            Specialist::WindowsPrivesc => {
                "Windows privilege escalation from an existing foothold: Potato attacks, service \
                 misconfigurations, scheduled tasks, LSASS dumping, DLL hijacking"
            }
            Specialist::Generalist => "General-purpose testing with no specific focus",
        }
    }
}

impl fmt::Display for Specialist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Specialist {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Specialist::ROUTABLE
            .into_iter()
            .chain([Specialist::Generalist])
            .find(|sp| sp.id() == s)
            .ok_or_else(|| anyhow!("unknown specialist: {s}"))
    }
}

/// Outcome of a routing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoutingResult {
    pub specialist: Specialist,
}

/// Strict classifier reply: exactly one key.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LlmClassification {
    specialist: String,
}

/// Routes a free-text task to one specialist with a single classifier call.
pub struct TaskRouter {
    client: Option<Arc<dyn MessageSender>>,
    model: String,
}

impl TaskRouter {
    pub fn new(client: Arc<dyn MessageSender>, model: impl Into<String>) -> Self {
        Self {
            client: Some(client),
            model: model.into(),
        }
    }

    /// A router with no classifier; every task gets the default specialist.
    pub fn offline() -> Self {
        Self {
            client: None,
            model: String::new(),
        }
    }

    /// Pick a specialist for `task`. Never fails: any problem with the
    /// classifier resolves to [`Specialist::Generalist`].
    pub async fn route(&self, task: &str) -> RoutingResult {
        let specialist = match self.classify(task).await {
            Ok(specialist) => {
                info!(%specialist, "router selected specialist");
                specialist
            }
            Err(e) => {
                warn!(error = %e, "routing failed, using default specialist");
                Specialist::default()
            }
        };
        RoutingResult { specialist }
    }

    async fn classify(&self, task: &str) -> anyhow::Result<Specialist> {
        let Some(client) = &self.client else {
            bail!("no classifier configured");
        };

        let req = MessagesRequest::user(&self.model, 64, routing_prompt(task)).with_temperature(0.0);
        let response = client.send_message(&req).await?;
        parse_classification(&response.text())
    }
}

fn parse_classification(text: &str) -> anyhow::Result<Specialist> {
    let classification: LlmClassification = serde_json::from_str(text.trim())
        .map_err(|e| anyhow!("failed to parse router reply {text:?}: {e}"))?;
    let specialist: Specialist = classification.specialist.parse()?;
    if specialist == Specialist::Generalist {
        bail!("classifier returned a profile outside the routable set");
    }
    Ok(specialist)
}

fn routing_prompt(task: &str) -> String {
    let rubric = Specialist::ROUTABLE
        .iter()
        .map(|s| format!("- {}: {}", s.id(), s.rubric()))
        .collect::<Vec<_>>()
        .join("\n");
    let ids = Specialist::ROUTABLE
        .iter()
        .map(|s| s.id())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "You route security testing tasks to the specialist best suited to run them.\n\
         \n\
         Specialists:\n\
         {rubric}\n\
         \n\
         Weigh the platform involved (Windows, Linux, Active Directory, web), the attack phase \
         (reconnaissance, exploitation, post-exploitation), the vulnerability classes named and \
         the access level the task assumes.\n\
         \n\
         Task: {task}\n\
         \n\
         Respond with ONLY a JSON object of the form {{\"specialist\": \"<name>\"}}.\n\
         The name must be exactly one of: {ids}"
    )
}

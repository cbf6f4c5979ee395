//! Interface de terminal do Overwatch: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`Progress`] acompanha visualmente uma instância
//! ou um caso de triagem no terminal.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::instance::InstanceStatus;
use crate::router::RoutingResult;
use crate::triage::{TriageCase, TriageOutcome, TriagePhase, TriageState};

/// Indicador visual de progresso no terminal.
///
/// Exibe um spinner animado enquanto algo roda e mensagens coloridas para
/// sucesso (verde), falha (vermelho) e avisos (amarelo).
pub struct Progress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl Progress {
    /// Inicia o spinner com a mensagem inicial.
    pub fn start(message: impl Into<String>) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg} {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(message.into());
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Atualiza a mensagem do spinner.
    pub fn set_message(&self, message: impl Into<String>) {
        self.pb.set_message(message.into());
    }

    /// Imprime a resposta de um worker acima do spinner.
    pub fn response(&self, instance_id: &str, text: &str) {
        self.pb.println(format!(
            "  {} {}\n{}",
            self.green.apply_to("◆"),
            self.dim.apply_to(instance_id),
            indent(text)
        ));
    }

    /// Registra uma mensagem de followup enviada.
    pub fn followup(&self, message: &str) {
        self.pb.println(format!("  {} {message}", self.yellow.apply_to("→")));
    }

    /// Exibe um aviso sem interromper o spinner.
    pub fn warn(&self, message: &str) {
        self.pb.println(format!("  {} {message}", self.yellow.apply_to("!")));
    }

    /// Finaliza o spinner e exibe o status terminal da instância.
    pub fn finish_instance(&self, instance_id: &str, status: Option<InstanceStatus>) {
        self.pb.finish_and_clear();
        match status {
            Some(InstanceStatus::Completed) => {
                println!("  {} {instance_id} completed", self.green.apply_to("✓"));
            }
            Some(InstanceStatus::Terminated) => {
                println!("  {} {instance_id} terminated", self.yellow.apply_to("■"));
            }
            Some(status) => {
                println!("  {} {instance_id} ended: {status}", self.red.apply_to("✗"));
            }
            None => {
                println!("  {} {instance_id} is unknown", self.red.apply_to("✗"));
            }
        }
    }

    /// Finaliza o spinner e resume o caso de triagem.
    pub fn finish_triage(&self, case: &TriageCase, outcome: &TriageOutcome) {
        self.pb.finish_and_clear();
        let style = match outcome.phase {
            TriagePhase::Submitted => &self.green,
            TriagePhase::Rejected | TriagePhase::NotReproduced => &self.yellow,
            _ => &self.red,
        };
        println!("  {} {}", style.apply_to(outcome.phase), case.report.title);

        match &case.state {
            TriageState::Rejected { reasoning } => println!("{}", indent(reasoning)),
            TriageState::NotReproduced { feedback, .. } => println!("{}", indent(feedback)),
            TriageState::Submitted { assessment, .. } => {
                println!(
                    "    {} (CVSS {:.1}, {})",
                    assessment.severity, assessment.cvss_score, assessment.cvss_vector
                );
            }
            _ => {}
        }
        if let Some(submission) = &outcome.submission {
            let mark = if submission.success {
                self.green.apply_to("✓")
            } else {
                self.red.apply_to("✗")
            };
            println!("  {mark} submission: {}", submission.message);
        }
    }

    /// Finaliza o spinner exibindo um erro.
    pub fn fail(&self, message: &str) {
        self.pb.finish_and_clear();
        println!("  {} {message}", self.red.apply_to("✗"));
    }
}

/// Imprime o resultado do roteamento.
pub fn print_route(task: &str, result: &RoutingResult) {
    let bold = Style::new().cyan().bold();
    println!("  {} → {}", task, bold.apply_to(result.specialist));
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

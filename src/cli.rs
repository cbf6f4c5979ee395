//! Interface de linha de comando do Overwatch baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, route, triage,
//! logs) e flags globais (--config, --session-dir, --model, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{CONFIG_FILE, ModelTier};
use crate::router::Specialist;

/// Overwatch, supervisor de workers de teste de segurança de longa duração.
#[derive(Debug, Parser)]
#[command(name = "overwatch", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Arquivo de configuração TOML.
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    pub config: PathBuf,

    /// Diretório da sessão (sobrescreve `session_dir` do arquivo).
    #[arg(long, global = true)]
    pub session_dir: Option<PathBuf>,

    /// Nível de modelo para geração de instruções e triagem.
    #[arg(long, global = true)]
    pub model: Option<ModelTier>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Inicia uma instância e a supervisiona até o fim.
    Run {
        /// Tarefa entregue ao worker.
        task: String,

        /// Identificador da instância (gerado se omitido).
        #[arg(long)]
        id: Option<String>,

        /// Nome do workspace dentro de `<session>/workspaces` (padrão: o id).
        #[arg(long)]
        workspace: Option<String>,

        /// Orçamento de tempo em minutos.
        #[arg(long, default_value_t = 30)]
        duration_minutes: u64,

        /// Especialista fixo; sem ele o roteador decide.
        #[arg(long)]
        specialist: Option<Specialist>,

        /// Mensagens enviadas, em ordem, a cada pausa do worker.
        #[arg(long = "followup")]
        followups: Vec<String>,
    },

    /// Mostra qual especialista o roteador escolheria para a tarefa.
    Route {
        /// Tarefa a classificar.
        task: String,
    },

    /// Passa um relatório de vulnerabilidade pelas três fases de triagem.
    Triage {
        /// Arquivo JSON com o relatório.
        report: PathBuf,

        /// Escopo do teste usado na revisão inicial.
        #[arg(long)]
        scope: Option<String>,

        /// Não inicia instância de reprodução na fase 2.
        #[arg(long, default_value_t = false)]
        no_reproduction: bool,
    },

    /// Lê os logs de um workspace da sessão.
    Logs {
        /// Nome do workspace.
        workspace: String,

        /// Mostra `final_result.json` bruto.
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Apenas as últimas N linhas.
        #[arg(long)]
        tail: Option<usize>,
    },
}

//! Configuração do Overwatch carregada a partir de `overwatch.toml`.
//!
//! A struct [`OverwatchConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `ANTHROPIC_API_KEY` e `SUBAGENT_MODEL` têm
//! precedência sobre o arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::Deserialize;

use crate::error::OverwatchError;
use crate::instance::ManagerSettings;

pub const CONFIG_FILE: &str = "overwatch.toml";

/// Nível de modelo usado pelos colaboradores que falam com a API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Modelo rápido e econômico; bom para classificação.
    Haiku,
    /// Modelo equilibrado.
    Sonnet,
    /// Modelo mais capaz.
    Opus,
}

impl ModelTier {
    /// Identificador do modelo na API Anthropic.
    pub fn api_id(self) -> &'static str {
        match self {
            ModelTier::Haiku => "claude-haiku-4-5-20251001",
            ModelTier::Sonnet => "claude-sonnet-4-5-20250929",
            ModelTier::Opus => "claude-opus-4-6",
        }
    }
}

/// Configuração de nível superior carregada de `overwatch.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct OverwatchConfig {
    /// Chave da API Anthropic. Vazia desativa roteamento por LLM.
    #[serde(default)]
    pub api_key: String,

    /// URL alternativa do endpoint de mensagens (proxy).
    #[serde(default)]
    pub api_base_url: Option<String>,

    /// Diretório raiz da sessão; workspaces ficam em `<session_dir>/workspaces`.
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,

    /// Binário do worker.
    #[serde(default = "default_worker_binary")]
    pub worker_binary: String,

    /// Subcomando passado antes das flags do worker.
    #[serde(default = "default_worker_subcommand")]
    pub worker_subcommand: Option<String>,

    /// Modelo repassado ao worker via `--model`.
    #[serde(default)]
    pub subagent_model: Option<String>,

    /// Gera instruções personalizadas em vez de rotear para um especialista.
    #[serde(default)]
    pub use_prompt_generation: bool,

    #[serde(default = "default_router_model")]
    pub router_model: ModelTier,

    #[serde(default = "default_generator_model")]
    pub generator_model: ModelTier,

    #[serde(default = "default_triage_model")]
    pub triage_model: ModelTier,

    /// Espera máxima após SIGKILL antes de registrar o processo como vazado.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Intervalo de polling dos arquivos de status.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Orçamento da instância de reprodução usada na fase 2 da triagem.
    #[serde(default = "default_reproduction_minutes")]
    pub reproduction_minutes: u64,
}

fn default_session_dir() -> PathBuf {
    PathBuf::from("session")
}

fn default_worker_binary() -> String {
    "codex".to_string()
}

fn default_worker_subcommand() -> Option<String> {
    Some("exec".to_string())
}

fn default_router_model() -> ModelTier {
    ModelTier::Haiku
}

fn default_generator_model() -> ModelTier {
    ModelTier::Opus
}

fn default_triage_model() -> ModelTier {
    ModelTier::Sonnet
}

fn default_kill_grace_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_reproduction_minutes() -> u64 {
    30
}

impl Default for OverwatchConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base_url: None,
            session_dir: default_session_dir(),
            worker_binary: default_worker_binary(),
            worker_subcommand: default_worker_subcommand(),
            subagent_model: None,
            use_prompt_generation: false,
            router_model: default_router_model(),
            generator_model: default_generator_model(),
            triage_model: default_triage_model(),
            kill_grace_ms: default_kill_grace_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            reproduction_minutes: default_reproduction_minutes(),
        }
    }
}

impl OverwatchConfig {
    /// Carrega o arquivo indicado (normalmente [`CONFIG_FILE`]) e aplica o ambiente.
    pub fn load(path: &Path) -> Result<Self, OverwatchError> {
        let mut config = Self::load_from(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Lê um arquivo específico; usa valores padrão se ele não existir.
    pub fn load_from(path: &Path) -> Result<Self, OverwatchError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str::<OverwatchConfig>(&contents)?)
    }

    /// Sobrescreve campos a partir do ambiente. Valores vazios são ignorados.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("ANTHROPIC_API_KEY").filter(|v| !v.is_empty()) {
            self.api_key = key;
        }
        if let Some(model) = lookup("SUBAGENT_MODEL").filter(|v| !v.is_empty()) {
            self.subagent_model = Some(model);
        }
    }

    /// Aplica as flags da linha de comando, que vencem arquivo e ambiente.
    ///
    /// `--model` troca o modelo da geração de instruções e da triagem; o
    /// roteador continua no modelo configurado.
    pub fn apply_overrides(&mut self, session_dir: Option<PathBuf>, model: Option<ModelTier>) {
        if let Some(dir) = session_dir {
            self.session_dir = dir;
        }
        if let Some(tier) = model {
            self.generator_model = tier;
            self.triage_model = tier;
        }
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn validate(&self) -> Result<(), OverwatchError> {
        if self.worker_binary.trim().is_empty() {
            return Err(OverwatchError::Config("worker_binary must not be empty".into()));
        }
        if self.use_prompt_generation && !self.has_api_key() {
            return Err(OverwatchError::Config(
                "use_prompt_generation requires an API key".into(),
            ));
        }
        Ok(())
    }

    /// Orçamento de uma instância de reprodução na triagem.
    pub fn reproduction_budget(&self) -> Duration {
        minutes(self.reproduction_minutes)
    }

    /// Parâmetros do gerenciador de instâncias derivados desta configuração.
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            session_dir: self.session_dir.clone(),
            worker_binary: self.worker_binary.clone(),
            worker_subcommand: self.worker_subcommand.clone(),
            subagent_model: self.subagent_model.clone(),
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

/// Converte minutos em [`Duration`], saturando em vez de estourar.
pub fn minutes(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(60))
}

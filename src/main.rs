use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};
use uuid::Uuid;

use overwatch::anthropic::{AnthropicClient, MessageSender};
use overwatch::cli::{Cli, Command};
use overwatch::config::{OverwatchConfig, minutes};
use overwatch::instance::{
    InstanceManager, InstanceStatus, LogFormat, ProcessLauncher, SpawnRequest, WaitOutcome,
    WaitTarget, log_reader, protocol,
};
use overwatch::prompt_generator::{LlmPromptGenerator, PromptGenerator};
use overwatch::router::TaskRouter;
use overwatch::submission::FileSubmitter;
use overwatch::triage::{LlmTriageReviewer, TriageCase, TriageEngine, VulnerabilityReport};
use overwatch::{OverwatchError, logging, ui};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut config = OverwatchConfig::load(&cli.config)?;
    config.apply_overrides(cli.session_dir.clone(), cli.model);
    config.validate()?;

    match cli.command {
        Command::Run {
            task,
            id,
            workspace,
            duration_minutes,
            specialist,
            followups,
        } => {
            let id = id.unwrap_or_else(|| format!("instance-{}", short_id()));
            let workspace = workspace.unwrap_or_else(|| id.clone());
            let request = SpawnRequest::new(
                &id,
                task,
                workspace,
                minutes(duration_minutes),
            )
            .with_specialist(specialist.unwrap_or_default());
            run_instance(&config, request, followups).await
        }
        Command::Route { task } => {
            let router = build_router(&config, anthropic_client(&config)?);
            let result = router.route(&task).await;
            ui::print_route(&task, &result);
            Ok(())
        }
        Command::Triage {
            report,
            scope,
            no_reproduction,
        } => triage_report(&config, &report, scope, !no_reproduction).await,
        Command::Logs {
            workspace,
            json,
            tail,
        } => {
            let log_dir = config.session_dir.join("workspaces").join(&workspace);
            if !log_dir.is_dir() {
                return Err(OverwatchError::WorkspaceNotFound(log_dir).into());
            }
            let format = if json { LogFormat::Json } else { LogFormat::Readable };
            match log_reader::read_logs(&log_dir, format, tail).await? {
                Some(text) => println!("{text}"),
                None => println!("No readable logs in {}", log_dir.display()),
            }
            Ok(())
        }
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string().chars().take(8).collect()
}

fn anthropic_client(config: &OverwatchConfig) -> Result<Option<Arc<dyn MessageSender>>> {
    if !config.has_api_key() {
        warn!("no API key configured, routing falls back to the generalist profile");
        return Ok(None);
    }
    let client = match &config.api_base_url {
        Some(url) => AnthropicClient::with_base_url(config.api_key.clone(), url.clone())?,
        None => AnthropicClient::new(config.api_key.clone())?,
    };
    Ok(Some(Arc::new(client)))
}

fn build_router(config: &OverwatchConfig, client: Option<Arc<dyn MessageSender>>) -> TaskRouter {
    match client {
        Some(client) => TaskRouter::new(client, config.router_model.api_id()),
        None => TaskRouter::offline(),
    }
}

fn build_manager(
    config: &OverwatchConfig,
    client: Option<Arc<dyn MessageSender>>,
) -> Result<InstanceManager> {
    let generator: Option<Arc<dyn PromptGenerator>> = match (&client, config.use_prompt_generation) {
        (Some(client), true) => Some(Arc::new(LlmPromptGenerator::new(
            client.clone(),
            config.generator_model.api_id(),
        ))),
        _ => None,
    };
    InstanceManager::new(
        config.manager_settings(),
        Arc::new(ProcessLauncher),
        build_router(config, client),
        generator,
    )
}

/// Spawn one instance and drive its followup conversation until the
/// followups run out, the instance ends, or the user interrupts.
async fn run_instance(
    config: &OverwatchConfig,
    request: SpawnRequest,
    followups: Vec<String>,
) -> Result<()> {
    let manager = build_manager(config, anthropic_client(config)?)?;
    let id = request.id.clone();
    let budget = request.duration;
    let banner = format!("{id}: {}", request.task);

    if !manager.spawn(request).await {
        bail!("failed to spawn instance {id}");
    }
    let progress = ui::Progress::start(banner);

    tokio::select! {
        () = converse(&manager, &id, budget, followups, &progress) => {}
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.context("listen for ctrl-c")?;
            progress.warn("interrupted, terminating instance");
            manager.terminate(&id).await;
        }
    }

    progress.finish_instance(&id, manager.status(&id).await);
    Ok(())
}

async fn converse(
    manager: &InstanceManager,
    id: &str,
    budget: Duration,
    followups: Vec<String>,
    progress: &ui::Progress,
) {
    let mut followups = followups.into_iter();
    loop {
        match manager
            .wait_for_instance(id, budget, WaitTarget::Response)
            .await
        {
            WaitOutcome::Response(text) => {
                progress.response(id, &text);
                let Some(message) = followups.next() else {
                    info!(instance_id = %id, "no followups left, terminating");
                    manager.terminate(id).await;
                    return;
                };
                if !manager.send_followup(id, &message).await {
                    return;
                }
                progress.followup(&message);
                progress.set_message(format!("{id}: working on followup"));
                wait_until_resumed(manager, id).await;
            }
            WaitOutcome::Finished(_) | WaitOutcome::TimedOut | WaitOutcome::NotFound => return,
        }
    }
}

/// `status.json` keeps saying "waiting" until the worker picks the followup
/// up; wait for that so the same response is not read twice.
async fn wait_until_resumed(manager: &InstanceManager, id: &str) {
    let Some(log_dir) = manager.log_dir(id) else {
        return;
    };
    let interval = manager.settings().poll_interval;
    while manager.status(id).await == Some(InstanceStatus::Running) {
        match protocol::read_status(&log_dir).await {
            Ok(Some(status)) if status.is_waiting_for_followup() => {}
            _ => return,
        }
        tokio::time::sleep(interval).await;
    }
}

async fn triage_report(
    config: &OverwatchConfig,
    report_path: &Path,
    scope: Option<String>,
    reproduce: bool,
) -> Result<()> {
    let client = anthropic_client(config)?.context("triage needs an API key")?;
    let report = VulnerabilityReport::load(report_path)
        .await
        .with_context(|| format!("read report {}", report_path.display()))?;

    let mut reviewer = LlmTriageReviewer::new(client.clone(), config.triage_model.api_id());
    if let Some(scope) = scope {
        reviewer = reviewer.with_scope(scope);
    }
    if reproduce {
        let manager = build_manager(config, Some(client))?;
        reviewer = reviewer.with_reproduction(
            manager,
            config.reproduction_budget(),
        );
    }

    let engine = TriageEngine::new(
        Arc::new(reviewer),
        Arc::new(FileSubmitter::new(&config.session_dir)),
    );
    let mut case = TriageCase::new(report);
    let progress = ui::Progress::start(format!("triage: {}", case.report.title));

    match engine.run(&mut case).await {
        Ok(outcome) => {
            progress.finish_triage(&case, &outcome);
            Ok(())
        }
        Err(e) => {
            progress.fail(&format!("triage stopped in {}: {e:#}", case.phase()));
            Err(e)
        }
    }
}

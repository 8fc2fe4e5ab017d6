//! Phase execution for one session file: `storyforge run`.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

use storyforge::Phase;
use storyforge::config::StoryConfig;
use storyforge::pipeline::PipelineExecutor;
use storyforge::provider::{OpenAiCompatProvider, ProviderRegistry};
use storyforge::scheduler::{
    ContinuationPolicy, EnqueueRequest, RunScheduler, SchedulerEvent,
};
use storyforge::store::{MemoryStore, RunStatus};

use super::super::Cli;
use super::load_config;
use super::session::SessionFile;

pub struct RunArgs {
    pub session: PathBuf,
    pub phases: Vec<Phase>,
    pub notes: Option<String>,
    pub resume: bool,
    pub model: Option<String>,
    pub max_concurrent_runs: Option<usize>,
    pub events: bool,
}

/// Every provider id the configuration can route to, all OpenAI-compatible.
fn build_registry(config: &StoryConfig) -> ProviderRegistry {
    let ids: BTreeSet<&str> = std::iter::once(config.provider.provider.as_str())
        .chain(config.phases.values().filter_map(|o| o.provider.as_deref()))
        .collect();
    let mut registry = ProviderRegistry::new();
    for id in ids {
        registry.register(Arc::new(OpenAiCompatProvider::new(
            id,
            config.provider.base_url.clone(),
        )));
    }
    registry
}

fn print_events(scheduler: &RunScheduler) {
    let mut events = scheduler.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Ok(line) = serde_json::to_string::<SchedulerEvent>(&event) {
                        eprintln!("{}", line);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

pub async fn cmd_run(cli: &Cli, args: RunArgs) -> Result<()> {
    let mut config = load_config(cli)?;
    if let Some(model) = &args.model {
        config.provider.model = model.clone();
    }
    if let Some(limit) = args.max_concurrent_runs {
        config.scheduler.max_concurrent_runs = limit;
    }
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let file = SessionFile::load(&args.session)?;
    let session_id = file.session_id().to_string();
    let store = Arc::new(file.into_store()?);
    let providers = Arc::new(build_registry(&config));

    let scheduler = RunScheduler::new(config.scheduler.max_concurrent_runs, Some(store.clone()));
    let recovered = scheduler
        .recover_interrupted(store.as_ref())
        .await
        .context("Failed to recover interrupted runs")?;
    if recovered > 0 {
        println!("Recovered {} interrupted run(s)", recovered);
    }

    let executor = Arc::new(PipelineExecutor::new(
        store.clone(),
        store.clone(),
        Arc::new(config),
        providers,
        scheduler.handle(),
    ));
    scheduler.register_executor(executor.clone());
    if args.events {
        print_events(&scheduler);
    }

    let interrupter = scheduler.clone();
    let interrupted_session = session_id.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!(session_id = %interrupted_session, "Interrupt received, cancelling run");
            interrupter.cancel_session(&interrupted_session);
        }
    });

    let mut failure = None;
    for phase in &args.phases {
        let mut request = EnqueueRequest::new(session_id.clone(), *phase);
        if let Some(notes) = &args.notes {
            request = request.user_notes(notes.clone());
        }
        if args.resume {
            request = request.continuation_policy(ContinuationPolicy::ResumeTruncated);
        }
        let Some(run_id) = scheduler.enqueue_run(request) else {
            failure = Some(format!("Scheduler rejected the {} run", phase));
            break;
        };
        println!("Running {} ({})", phase, run_id);
        scheduler.wait_idle().await;

        let state = scheduler.session_state(&session_id);
        match state.status {
            RunStatus::Error => {
                let error = state.last_error.unwrap_or_default();
                println!("Phase {} failed: {}", phase, error);
                failure = Some(format!("Phase {} failed: {}", phase, error));
                break;
            }
            RunStatus::Interrupted => {
                println!("Phase {} interrupted", phase);
                failure = Some(format!("Phase {} interrupted", phase));
                break;
            }
            _ => println!("Phase {} completed", phase),
        }
    }

    executor.drain_side_tasks().await;
    scheduler.flush_meta().await;
    save_session(store.as_ref(), &session_id, &args.session)?;

    match failure {
        Some(message) => anyhow::bail!(message),
        None => Ok(()),
    }
}

fn save_session(store: &MemoryStore, session_id: &str, path: &std::path::Path) -> Result<()> {
    let file = SessionFile::from_store(store, session_id)?;
    file.save(path)?;
    tracing::debug!(session_id, path = %path.display(), "Session saved");
    Ok(())
}

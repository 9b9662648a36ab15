use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::Subcommand;

use crate::agent::CommandAgent;
use crate::error::ExitError;
use crate::template::{PromptBase, Prompts};
use crate::worker::{Worker, WorkerSettings};

use super::{Project, WORKER_ENV, resolve_identity};

#[derive(Debug, Subcommand)]
pub enum RunCommand {
    /// Run the work loop until interrupted or the loop limit is reached
    Worker {
        /// Project root directory
        #[arg(long)]
        project_root: Option<PathBuf>,
        /// Worker identity, defaulting to the store account; any other account is refused (also read from $PEERLOOP_WORKER)
        #[arg(long)]
        worker: Option<String>,
        /// Full loops before exiting (0 = until interrupted)
        #[arg(long)]
        max_loops: Option<u64>,
        /// Seconds to pause after each loop
        #[arg(long)]
        pause: Option<u64>,
    },
}

impl RunCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        match self {
            RunCommand::Worker {
                project_root,
                worker,
                max_loops,
                pause,
            } => run_worker(project_root.as_deref(), worker.as_deref(), *max_loops, *pause),
        }
    }
}

fn run_worker(
    project_root: Option<&std::path::Path>,
    worker: Option<&str>,
    max_loops: Option<u64>,
    pause: Option<u64>,
) -> anyhow::Result<()> {
    let project = Project::load(project_root)?;
    let config = &project.config;
    let goal = config.goal(&project.root)?;
    if config.agent.command.is_empty() {
        return Err(ExitError::Config("agent.command is not set".into()).into());
    }

    let store = project.open_store()?;
    let identity = resolve_identity(worker, std::env::var(WORKER_ENV).ok(), || {
        store.inner().authenticated_login()
    })?;

    let prompts = Prompts::new(PromptBase {
        worker: identity.clone(),
        project: config.project.name.clone(),
        base_branch: config.project.base_branch.clone(),
        check_command: config.project.check_command.clone(),
    })?;
    let agent = CommandAgent::new(
        config.agent.command.clone(),
        Duration::from_secs(config.agent.timeout_secs),
        project.root.clone(),
        identity.clone(),
        prompts,
    )?;

    let settings = WorkerSettings {
        identity: identity.clone(),
        namespace: config.project.namespace.clone(),
        base_branch: config.project.base_branch.clone(),
        goal,
        claim: config.claim_policy(),
        merge: config.merge_policy(),
        progress: config.progress_policy(),
        max_per_step: config.review.max_per_step.max(1),
        seed: None,
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        eprintln!("Received interrupt signal, stopping after the current step...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("installing Ctrl-C handler")?;

    let pause = Duration::from_secs(pause.unwrap_or(config.worker.pause_secs));
    let max_loops = max_loops.unwrap_or(config.worker.max_loops);
    tracing::info!(
        worker = %identity,
        project = %config.project.name,
        max_loops,
        "starting work loop"
    );

    let mut worker = Worker::new(store, agent, project.validator(), settings);
    let loops = worker.run(&shutdown, pause, max_loops);

    match worker.last_progress() {
        Some(report) if report.complete => println!("{identity}: goal complete after {loops} loop(s)"),
        Some(report) => println!(
            "{identity}: stopped after {loops} loop(s), {} open task(s), {} open change(s)",
            report.open_tasks, report.open_changes
        ),
        None => println!("{identity}: stopped after {loops} loop(s)"),
    }
    Ok(())
}

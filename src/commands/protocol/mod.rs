//! Single protocol operations, for humans and scripts.

pub mod render;

use std::path::PathBuf;

use clap::Subcommand;

use crate::agent::{Validation, Validator};
use crate::error::ExitError;
use crate::protocol::feedback::record_failure;
use crate::protocol::{MergeOutcome, evaluate_gate, release_claim, try_claim, try_merge};
use crate::store::github::GithubStore;
use crate::store::retry::Retrying;
use crate::store::{ChangeId, ItemId, WorkStore};

use super::{OutputFormat, Project, WORKER_ENV, resolve_identity};
use render::{ClaimReport, GateReport, MergeReport, UnblockReport, ValidateReport, emit};

/// Shared flags for all protocol subcommands.
#[derive(Debug, clap::Args)]
pub struct ProtocolArgs {
    /// Worker identity, defaulting to the store account; any other account is refused (also read from $PEERLOOP_WORKER)
    #[arg(long)]
    pub worker: Option<String>,
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl ProtocolArgs {
    fn project(&self) -> anyhow::Result<Project> {
        Project::load(self.project_root.as_deref())
    }

    fn format(&self) -> OutputFormat {
        OutputFormat::resolve(self.format)
    }
}

#[derive(Debug, Subcommand)]
pub enum ProtocolCommand {
    /// Try to claim a work item
    Claim {
        item: ItemId,
        #[command(flatten)]
        args: ProtocolArgs,
    },
    /// Merge a change if the review gate allows it, then validate
    Merge {
        change: ChangeId,
        /// Skip validation after merging
        #[arg(long)]
        no_validate: bool,
        #[command(flatten)]
        args: ProtocolArgs,
    },
    /// Show the review gate decision for a change
    Gate {
        change: ChangeId,
        #[command(flatten)]
        args: ProtocolArgs,
    },
    /// Release a claimed or blocked item so it can be claimed again
    Unblock {
        item: ItemId,
        /// Note recorded on the item
        #[arg(long)]
        reason: Option<String>,
        #[command(flatten)]
        args: ProtocolArgs,
    },
    /// Run the project's check command against the base branch
    Validate {
        /// Report only; don't file a failing task
        #[arg(long)]
        no_file: bool,
        #[command(flatten)]
        args: ProtocolArgs,
    },
}

impl ProtocolCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        match self {
            ProtocolCommand::Claim { item, args } => claim(*item, args),
            ProtocolCommand::Merge {
                change,
                no_validate,
                args,
            } => merge(*change, *no_validate, args),
            ProtocolCommand::Gate { change, args } => gate(*change, args),
            ProtocolCommand::Unblock { item, reason, args } => {
                unblock(*item, reason.as_deref().unwrap_or(""), args)
            }
            ProtocolCommand::Validate { no_file, args } => validate(*no_file, args),
        }
    }
}

fn identity(args: &ProtocolArgs, store: &Retrying<GithubStore>) -> anyhow::Result<String> {
    resolve_identity(args.worker.as_deref(), std::env::var(WORKER_ENV).ok(), || {
        store.inner().authenticated_login()
    })
}

fn claim(item: ItemId, args: &ProtocolArgs) -> anyhow::Result<()> {
    let project = args.project()?;
    let store = project.open_store()?;
    let worker = identity(args, &store)?;
    let outcome = try_claim(&store, item, &worker, &project.config.claim_policy())?;
    let report = ClaimReport { item, worker, outcome };
    emit(&report, args.format())?;
    if report.claimed() {
        Ok(())
    } else {
        Err(ExitError::new(1, format!("item #{item} was not claimed")).into())
    }
}

fn merge(change: ChangeId, no_validate: bool, args: &ProtocolArgs) -> anyhow::Result<()> {
    let project = args.project()?;
    let store = project.open_store()?;
    let policy = project.config.merge_policy();
    let current = store.get_change(change)?;
    let gate = evaluate_gate(&current, &policy);
    let outcome = try_merge(&store, change, &policy)?;

    let mut report = MergeReport {
        change,
        outcome,
        gate,
        validation: None,
        feedback: None,
    };
    if outcome == MergeOutcome::Merged && !no_validate {
        let validation = project.validator().validate()?;
        if let Validation::Fail { details } = &validation {
            let worker = identity(args, &store)?;
            report.feedback = Some(record_failure(
                &store,
                &worker,
                details,
                Some(change),
                project.config.claim_policy().settle,
            )?);
        }
        report.validation = Some(validation);
    }
    emit(&report, args.format())?;
    match outcome {
        MergeOutcome::Merged => Ok(()),
        MergeOutcome::NotReady => Err(ExitError::new(1, format!("change #{change} is not ready to merge")).into()),
        MergeOutcome::Conflict => Err(ExitError::new(1, format!("change #{change} conflicts with the base branch")).into()),
    }
}

fn gate(change: ChangeId, args: &ProtocolArgs) -> anyhow::Result<()> {
    let project = args.project()?;
    let store = project.open_store()?;
    let current = store.get_change(change)?;
    let report = GateReport {
        change,
        state: current.state,
        decision: evaluate_gate(&current, &project.config.merge_policy()),
    };
    emit(&report, args.format())
}

fn unblock(item: ItemId, reason: &str, args: &ProtocolArgs) -> anyhow::Result<()> {
    let project = args.project()?;
    let store = project.open_store()?;
    let actor = identity(args, &store)?;
    let previous = release_claim(&store, item, &actor, reason)?;
    emit(&UnblockReport { item, previous }, args.format())
}

fn validate(no_file: bool, args: &ProtocolArgs) -> anyhow::Result<()> {
    let project = args.project()?;
    let validation = project.validator().validate()?;
    let mut report = ValidateReport {
        validation,
        feedback: None,
    };
    if let Validation::Fail { details } = &report.validation
        && !no_file
    {
        let store = project.open_store()?;
        let worker = identity(args, &store)?;
        report.feedback = Some(record_failure(
            &store,
            &worker,
            details,
            None,
            project.config.claim_policy().settle,
        )?);
    }
    emit(&report, args.format())?;
    if report.validation.passed() {
        Ok(())
    } else {
        Err(ExitError::new(1, "validation failed".into()).into())
    }
}

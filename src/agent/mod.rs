//! External agent capability.
//!
//! The protocol decides when judgement is needed; the agent supplies it.
//! Planning, implementation, review and follow-ups all go through
//! [`Agent`], validation of the integration branch through [`Validator`].

mod command;
mod output;

pub use command::{CommandAgent, CommandValidator};
pub use output::{parse_drafts, parse_review, parse_work_outcome};

use serde::Serialize;

use crate::store::{Change, ItemDraft, Review, WorkItem};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "outcome")]
pub enum WorkOutcome {
    Completed { summary: String },
    /// The acceptance criteria can't be met as things stand.
    Stuck { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "verdict")]
pub enum ReviewDecision {
    Approve { comments: String },
    RequestChanges { comments: String },
    /// The base branch already contains what the change does.
    Redundant { comments: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "result")]
pub enum Validation {
    Pass,
    Fail { details: String },
}

impl Validation {
    pub fn passed(&self) -> bool {
        matches!(self, Validation::Pass)
    }
}

pub trait Agent {
    /// Propose work still missing for `goal`, given what is already tracked.
    fn plan(&self, goal: &str, existing: &[WorkItem]) -> anyhow::Result<Vec<ItemDraft>>;

    /// Do the work for a claimed item on `branch` and push it.
    fn implement(&self, item: &WorkItem, branch: &str) -> anyhow::Result<WorkOutcome>;

    fn review(&self, change: &Change, item: &WorkItem) -> anyhow::Result<ReviewDecision>;

    /// Push follow-up commits answering change requests.
    fn respond(&self, change: &Change, item: &WorkItem, feedback: &[Review]) -> anyhow::Result<WorkOutcome>;
}

pub trait Validator {
    /// Run the project's checks against the integration branch.
    fn validate(&self) -> anyhow::Result<Validation>;
}

//! Check-Progress: reconcile, report, validate, find gaps, declare done.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::agent::{Agent, Validation, Validator};
use crate::store::{ChangeId, ItemId, Label, LabelFilter, MergeState, StoreError, WorkItem, WorkStore};

use super::bootstrap::file_drafts;
use super::claim::unfinished_claim;
use super::feedback::{FeedbackOutcome, record_failure};
use super::{COMPLETE_MARKER, parse_change_marker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressPolicy {
    /// Age after which claimed items and unreviewed changes are reported.
    pub stale_after: Duration,
    /// Run validation on every check, not only when the queue is empty.
    pub validate: bool,
    /// Delay before the feedback dedup re-scan.
    pub settle: Duration,
}

impl Default for ProgressPolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(3600),
            validate: true,
            settle: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressReport {
    pub open_tasks: usize,
    pub open_changes: usize,
    /// Items labelled `done` because their change had merged.
    pub reconciled: Vec<ItemId>,
    pub stale_items: Vec<ItemId>,
    pub stale_changes: Vec<ChangeId>,
    pub validation_passed: Option<bool>,
    pub feedback: Option<FeedbackOutcome>,
    pub planned: Vec<ItemId>,
    pub complete: bool,
}

/// Items in review whose change merged without the item being closed out,
/// for example because the merging worker died mid-way.
pub fn reconcile_merged<S: WorkStore + ?Sized>(store: &S) -> Result<Vec<ItemId>, StoreError> {
    let mut fixed = Vec::new();
    for listed in store.list_items(&LabelFilter::new().with(Label::Review).without(Label::Done))? {
        let item = store.get_item(listed.id)?;
        let Some(change_id) = item.comments.iter().rev().find_map(|c| parse_change_marker(&c.body)) else {
            continue;
        };
        let change = match store.get_change(change_id) {
            Ok(change) => change,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        if change.state == MergeState::Merged {
            store.update_item_labels(item.id, &[Label::Done], &[Label::InProgress, Label::Review], None)?;
            tracing::info!(item = item.id, change = change_id, "marked merged item done");
            fixed.push(item.id);
        }
    }
    Ok(fixed)
}

fn older_than(at: chrono::DateTime<Utc>, age: Duration) -> bool {
    chrono::Duration::from_std(age).is_ok_and(|age| Utc::now() - at > age)
}

/// Claimed items with no activity, claims that were started but never
/// finished, and changes nobody reviewed, all older than `stale_after`.
/// Reported only; claims are never released here.
pub fn find_stale<S: WorkStore + ?Sized>(
    store: &S,
    stale_after: Duration,
) -> Result<(Vec<ItemId>, Vec<ChangeId>), StoreError> {
    let mut items = Vec::new();
    for listed in store.list_items(&LabelFilter::new().with(Label::InProgress).without(Label::Done))? {
        let item = store.get_item(listed.id)?;
        let last_activity = item
            .comments
            .iter()
            .map(|c| c.created_at)
            .max()
            .unwrap_or(item.created_at)
            .max(item.created_at);
        if older_than(last_activity, stale_after) {
            tracing::warn!(item = item.id, assignee = ?item.assignee, "claimed item looks abandoned");
            items.push(item.id);
        }
    }

    let unlabelled = LabelFilter::new()
        .with(Label::Task)
        .without(Label::InProgress)
        .without(Label::Review)
        .without(Label::Blocked)
        .without(Label::Done);
    for listed in store.list_items(&unlabelled)? {
        let item = store.get_item(listed.id)?;
        if unfinished_claim(&item).is_some_and(|at| older_than(at, stale_after)) {
            tracing::warn!(item = item.id, assignee = ?item.assignee, "claim was never completed");
            items.push(item.id);
        }
    }

    let mut changes = Vec::new();
    for change in store.list_changes(&LabelFilter::new().with(Label::Review))? {
        let reviewed = change.reviews.iter().any(|r| r.reviewer != change.author);
        if !reviewed && older_than(change.last_author_commit_at, stale_after) {
            tracing::warn!(change = change.id, author = %change.author, "change is waiting for review");
            changes.push(change.id);
        }
    }
    Ok((items, changes))
}

fn latest_task<S: WorkStore + ?Sized>(store: &S) -> Result<Option<WorkItem>, StoreError> {
    let newest = store
        .list_items(&LabelFilter::new().with(Label::Task).with(Label::Done))?
        .into_iter()
        .chain(store.list_items(&LabelFilter::new().with(Label::Task))?)
        .max_by_key(|item| (item.created_at, item.id));
    match newest {
        Some(item) => store.get_item(item.id).map(Some),
        None => Ok(None),
    }
}

fn has_complete_marker(item: &WorkItem) -> bool {
    item.comments.iter().any(|c| c.body.starts_with(COMPLETE_MARKER))
}

/// One Check-Progress pass for `worker`.
pub fn check_progress<S, A, V>(
    store: &S,
    agent: &A,
    validator: &V,
    worker: &str,
    goal: &str,
    policy: &ProgressPolicy,
) -> anyhow::Result<ProgressReport>
where
    S: WorkStore + ?Sized,
    A: Agent + ?Sized,
    V: Validator + ?Sized,
{
    let mut report = ProgressReport {
        reconciled: reconcile_merged(store)?,
        ..ProgressReport::default()
    };
    (report.stale_items, report.stale_changes) = find_stale(store, policy.stale_after)?;

    report.open_tasks = store
        .list_items(&LabelFilter::new().with(Label::Task).without(Label::Done))?
        .len();
    report.open_changes = store.list_changes(&LabelFilter::new())?.len();
    let idle = report.open_tasks == 0 && report.open_changes == 0;

    if policy.validate || idle {
        report.validation_passed = match validator.validate() {
            Ok(Validation::Pass) => Some(true),
            Ok(Validation::Fail { details }) => {
                report.feedback = Some(record_failure(store, worker, &details, None, policy.settle)?);
                Some(false)
            }
            Err(e) => {
                tracing::warn!(error = %e, "validation could not run");
                None
            }
        };
    }

    if !idle || report.validation_passed != Some(true) {
        return Ok(report);
    }

    let latest = latest_task(store)?;
    if latest.as_ref().is_some_and(has_complete_marker) {
        report.complete = true;
        return Ok(report);
    }

    let existing = store.list_items(&LabelFilter::new())?;
    let drafts = agent.plan(goal, &existing)?;
    let plan = file_drafts(store, &drafts, &existing);
    report.planned = plan.created;
    if !report.planned.is_empty() || plan.failed > 0 {
        return Ok(report);
    }

    report.complete = true;
    if let Some(item) = latest {
        store.append_comment(
            item.id,
            worker,
            &format!("{COMPLETE_MARKER} {worker}\n\nAll tracked work is merged and validation passes."),
        )?;
        tracing::info!(item = item.id, "goal complete");
    }
    Ok(report)
}

//! Merge gate: quorum of non-author approvals, then squash integration.
//!
//! The latest review per reviewer decides that reviewer's vote. A
//! `request-changes` vote blocks only while it is newer than the author's
//! most recent commit; after a follow-up commit it no longer blocks but
//! does not count as approval either.

use std::collections::HashMap;

use serde::Serialize;

use crate::store::{Change, ChangeId, Label, MergeResult, MergeState, Review, StoreError, Verdict, WorkStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeOutcome {
    Merged,
    NotReady,
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePolicy {
    /// Minimum non-author approvals. Never less than one.
    pub quorum: usize,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self { quorum: 1 }
    }
}

impl MergePolicy {
    pub fn required_approvals(&self) -> usize {
        self.quorum.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateStatus {
    Ready,
    NeedsReview,
    Blocked,
}

impl GateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GateStatus::Ready => "ready",
            GateStatus::NeedsReview => "needs-review",
            GateStatus::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateDecision {
    pub status: GateStatus,
    pub approved_by: Vec<String>,
    /// Reviewers whose change request is newer than the author's last commit.
    pub blocked_by: Vec<String>,
    pub required: usize,
}

/// Evaluate a change against the gate without touching the store.
pub fn evaluate_gate(change: &Change, policy: &MergePolicy) -> GateDecision {
    let mut latest: HashMap<&str, &Review> = HashMap::new();
    for review in change.reviews.iter().filter(|r| r.reviewer != change.author) {
        latest
            .entry(review.reviewer.as_str())
            .and_modify(|existing| {
                if review.submitted_at > existing.submitted_at {
                    *existing = review;
                }
            })
            .or_insert(review);
    }

    let mut approved_by = Vec::new();
    let mut blocked_by = Vec::new();
    for (reviewer, review) in latest {
        match review.verdict {
            Verdict::Approve => approved_by.push(reviewer.to_string()),
            Verdict::RequestChanges if review.submitted_at > change.last_author_commit_at => {
                blocked_by.push(reviewer.to_string());
            }
            Verdict::RequestChanges => {}
        }
    }
    approved_by.sort();
    blocked_by.sort();

    let required = policy.required_approvals();
    let status = if !blocked_by.is_empty() {
        GateStatus::Blocked
    } else if approved_by.len() >= required {
        GateStatus::Ready
    } else {
        GateStatus::NeedsReview
    };
    GateDecision {
        status,
        approved_by,
        blocked_by,
        required,
    }
}

/// Integrate `change` if the gate allows it.
///
/// Idempotent: an already merged change reports `Merged` and nothing is
/// written. A store error surfaces unchanged.
pub fn try_merge<S: WorkStore + ?Sized>(
    store: &S,
    change: ChangeId,
    policy: &MergePolicy,
) -> Result<MergeOutcome, StoreError> {
    let current = store.get_change(change)?;
    match current.state {
        MergeState::Merged => return Ok(MergeOutcome::Merged),
        MergeState::Closed => return Ok(MergeOutcome::NotReady),
        MergeState::Open | MergeState::Approved => {}
    }

    let decision = evaluate_gate(&current, policy);
    if decision.status != GateStatus::Ready {
        tracing::debug!(change, status = decision.status.as_str(), "merge gate not satisfied");
        return Ok(MergeOutcome::NotReady);
    }

    match store.merge_change(change)? {
        MergeResult::Merged => {
            store.update_item_labels(
                current.closes,
                &[Label::Done],
                &[Label::InProgress, Label::Review],
                None,
            )?;
            store.update_change_labels(change, &[Label::Done], &[Label::Review])?;
            tracing::info!(change, item = current.closes, approved_by = ?decision.approved_by, "change merged");
            Ok(MergeOutcome::Merged)
        }
        MergeResult::AlreadyMerged => Ok(MergeOutcome::Merged),
        MergeResult::NotMergeable => {
            tracing::info!(change, "change does not integrate cleanly");
            Ok(MergeOutcome::Conflict)
        }
    }
}

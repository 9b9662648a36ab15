//! Claim resolver.
//!
//! Stores with conditional updates get a compare-and-set claim. Stores
//! without them run a small election in the item's comments: each claimant
//! appends a claim marker, waits out the settle delay, re-reads, and the
//! smallest identity among the markers posted within the contention window
//! takes the item. Losers append a yield marker and never touch the
//! assignee.
//!
//! The election is sound as long as store reads lag writes by no more than
//! half the settle delay.

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::{Comment, ItemId, Label, StoreError, WorkItem, WorkStore};

pub const CLAIM_MARKER: &str = "peerloop:claim";
pub const YIELD_MARKER: &str = "peerloop:yield";
pub const UNCLAIM_MARKER: &str = "peerloop:unclaim";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimOutcome {
    Claimed,
    AlreadyClaimed,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimPolicy {
    /// Wait between writing a claim marker and verifying it.
    pub settle: Duration,
    /// Label attempts after winning the assignee on a conditional store.
    pub label_retries: u32,
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(1500),
            label_retries: 3,
        }
    }
}

impl ClaimPolicy {
    /// Markers this close to the first one of an epoch contend with it.
    pub fn window(&self) -> Duration {
        self.settle / 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Claim,
    Yield,
    Unclaim,
}

fn parse_marker(body: &str) -> Option<(Marker, &str)> {
    let line = body.lines().next()?.trim();
    let (tag, who) = line.split_once(' ')?;
    let marker = match tag {
        CLAIM_MARKER => Marker::Claim,
        YIELD_MARKER => Marker::Yield,
        UNCLAIM_MARKER => Marker::Unclaim,
        _ => return None,
    };
    let who = who.trim();
    (!who.is_empty()).then_some((marker, who))
}

/// Claim markers of the current epoch, as seen in one read of the comments.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Election {
    /// Claimants in marker order with their first marker time.
    pub claimants: Vec<(String, DateTime<Utc>)>,
    pub yielded: HashSet<String>,
}

impl Election {
    /// Replay the comment history. An unclaim marker, or every claimant
    /// having yielded, starts a fresh epoch.
    pub fn from_comments(comments: &[Comment]) -> Self {
        let mut ordered: Vec<&Comment> = comments.iter().collect();
        ordered.sort_by_key(|c| c.created_at);

        let mut epoch = Self::default();
        for comment in ordered {
            match parse_marker(&comment.body) {
                Some((Marker::Claim, who)) => {
                    if !epoch.claimants.iter().any(|(c, _)| c == who) {
                        epoch.claimants.push((who.to_string(), comment.created_at));
                    }
                }
                Some((Marker::Yield, who)) => {
                    epoch.yielded.insert(who.to_string());
                    if epoch.claimants.iter().all(|(c, _)| epoch.yielded.contains(c)) {
                        epoch = Self::default();
                    }
                }
                Some((Marker::Unclaim, _)) => epoch = Self::default(),
                None => {}
            }
        }
        epoch
    }

    pub fn has_claimant(&self, worker: &str) -> bool {
        self.claimants.iter().any(|(c, _)| c == worker)
    }

    /// Smallest non-yielded identity among markers within `window` of the
    /// epoch's first marker.
    pub fn winner(&self, window: Duration) -> Option<&str> {
        let (_, first) = self.claimants.first()?;
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = *first + window;
        self.claimants
            .iter()
            .filter(|(c, at)| *at <= cutoff && !self.yielded.contains(c))
            .map(|(c, _)| c.as_str())
            .min()
    }
}

/// Attempt to take `item` for `worker`.
///
/// `Claimed` is also returned when `worker` already holds the item.
pub fn try_claim<S: WorkStore + ?Sized>(
    store: &S,
    item: ItemId,
    worker: &str,
    policy: &ClaimPolicy,
) -> Result<ClaimOutcome, StoreError> {
    let current = match store.get_item(item) {
        Ok(current) => current,
        Err(e) if e.is_not_found() => return Ok(ClaimOutcome::NotFound),
        Err(e) => return Err(e),
    };
    if current.is_claimed_by(worker) {
        return Ok(ClaimOutcome::Claimed);
    }
    if !current.is_claimable() {
        tracing::debug!(item, assignee = ?current.assignee, "item not claimable");
        return Ok(ClaimOutcome::AlreadyClaimed);
    }

    let outcome = if store.supports_conditional_update() {
        claim_conditional(store, &current, worker, policy)?
    } else {
        claim_by_election(store, &current, worker, policy)?
    };
    tracing::info!(item, worker, outcome = ?outcome, "claim resolved");
    Ok(outcome)
}

fn claim_conditional<S: WorkStore + ?Sized>(
    store: &S,
    current: &WorkItem,
    worker: &str,
    policy: &ClaimPolicy,
) -> Result<ClaimOutcome, StoreError> {
    let item = current.id;
    let mut revision = match store.assign_item(item, Some(worker), Some(current.revision)) {
        Ok(revision) => revision,
        Err(e) if e.is_conflict() => {
            let fresh = store.get_item(item)?;
            tracing::debug!(item, assignee = ?fresh.assignee, "lost conditional claim");
            return Ok(ClaimOutcome::AlreadyClaimed);
        }
        Err(e) => return Err(e),
    };

    // The assignee is ours; unrelated writes may still bump the revision.
    for _ in 0..=policy.label_retries {
        match store.update_item_labels(item, &[Label::InProgress], &[], Some(revision)) {
            Ok(_) => return Ok(ClaimOutcome::Claimed),
            Err(e) if e.is_conflict() => {
                let fresh = store.get_item(item)?;
                if fresh.assignee.as_deref() != Some(worker) {
                    return Ok(ClaimOutcome::AlreadyClaimed);
                }
                revision = fresh.revision;
            }
            Err(e) => return Err(e),
        }
    }

    tracing::warn!(item, worker, "could not label claimed item, releasing assignee");
    let fresh = store.get_item(item)?;
    if fresh.assignee.as_deref() == Some(worker) && !fresh.has(Label::InProgress) {
        if let Err(e) = store.assign_item(item, None, Some(fresh.revision)) {
            tracing::warn!(item, worker, error = %e, "could not release assignee");
        }
    }
    Ok(ClaimOutcome::AlreadyClaimed)
}

fn claim_by_election<S: WorkStore + ?Sized>(
    store: &S,
    current: &WorkItem,
    worker: &str,
    policy: &ClaimPolicy,
) -> Result<ClaimOutcome, StoreError> {
    let item = current.id;
    let seen = Election::from_comments(&current.comments);
    if seen.claimants.iter().any(|(c, _)| c != worker && !seen.yielded.contains(c)) {
        // Someone else is already contending; stay out of it.
        return Ok(ClaimOutcome::AlreadyClaimed);
    }
    if !seen.has_claimant(worker) {
        store.append_comment(item, worker, &format!("{CLAIM_MARKER} {worker}"))?;
    }

    thread::sleep(policy.settle);

    let settled = store.get_item(item)?;
    let election = Election::from_comments(&settled.comments);
    let winner = election.winner(policy.window());
    if winner != Some(worker) {
        tracing::debug!(item, worker, winner = ?winner, "yielding claim");
        store.append_comment(item, worker, &format!("{YIELD_MARKER} {worker}"))?;
        return Ok(ClaimOutcome::AlreadyClaimed);
    }
    if settled
        .assignee
        .as_deref()
        .is_some_and(|a| !a.is_empty() && a != worker)
    {
        store.append_comment(item, worker, &format!("{YIELD_MARKER} {worker}"))?;
        return Ok(ClaimOutcome::AlreadyClaimed);
    }

    store.assign_item(item, Some(worker), None)?;
    store.update_item_labels(item, &[Label::InProgress], &[], None)?;
    Ok(ClaimOutcome::Claimed)
}

/// Time of the last claim activity on an item whose claim was started but
/// never finished: an assignee without `in-progress`, or live election
/// markers with nobody assigned. A claimant that dies between its writes
/// leaves the item like this, and nobody else will take it.
pub fn unfinished_claim(item: &WorkItem) -> Option<DateTime<Utc>> {
    let settled = [Label::InProgress, Label::Review, Label::Blocked, Label::Done];
    if settled.iter().any(|label| item.has(*label)) {
        return None;
    }
    if item.assignee.as_deref().is_some_and(|a| !a.is_empty()) {
        let last = item.comments.iter().map(|c| c.created_at).max();
        return Some(last.map_or(item.created_at, |at| at.max(item.created_at)));
    }
    let election = Election::from_comments(&item.comments);
    election
        .claimants
        .iter()
        .filter(|(c, _)| !election.yielded.contains(c))
        .map(|(_, at)| *at)
        .max()
}

/// Re-check that `worker` still holds `item` before acting on the claim.
pub fn verify_claim<S: WorkStore + ?Sized>(
    store: &S,
    item: ItemId,
    worker: &str,
    policy: &ClaimPolicy,
) -> Result<bool, StoreError> {
    let current = store.get_item(item)?;
    if !current.is_claimed_by(worker) {
        return Ok(false);
    }
    if store.supports_conditional_update() {
        return Ok(true);
    }
    let election = Election::from_comments(&current.comments);
    Ok(election.claimants.is_empty() || election.winner(policy.window()) == Some(worker))
}

/// Explicitly release an item: clears `in-progress`, `blocked` and the
/// assignee, and opens a new claim epoch. Nothing calls this automatically.
pub fn release_claim<S: WorkStore + ?Sized>(
    store: &S,
    item: ItemId,
    actor: &str,
    reason: &str,
) -> Result<Option<String>, StoreError> {
    let current = store.get_item(item)?;
    let previous = current.assignee.clone().filter(|a| !a.is_empty());
    store.update_item_labels(item, &[], &[Label::InProgress, Label::Blocked], None)?;
    store.assign_item(item, None, None)?;
    store.append_comment(
        item,
        actor,
        &format!("{UNCLAIM_MARKER} {}", previous.as_deref().unwrap_or(actor)),
    )?;
    let note = if reason.trim().is_empty() {
        format!("Released by {actor}.")
    } else {
        format!("Released by {actor}: {}", reason.trim())
    };
    store.append_comment(item, actor, &note)?;
    tracing::info!(item, actor, previous = ?previous, "claim released");
    Ok(previous)
}

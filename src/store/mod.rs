//! Work store capability: the shared, eventually-consistent record of work
//! items, changes and reviews that every worker coordinates through.
//!
//! Adapters implement [`WorkStore`]. The protocol never caches what it reads
//! beyond one loop step, so adapters are free to serve stale reads as long
//! as writes eventually become visible.

pub mod github;
pub mod memory;
pub mod retry;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::error::StoreError;

pub type ItemId = u64;
pub type ChangeId = u64;

/// Fixed label vocabulary shared by items and changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Label {
    Task,
    InProgress,
    Review,
    Blocked,
    Done,
    Failing,
}

impl Label {
    pub const ALL: [Label; 6] = [
        Label::Task,
        Label::InProgress,
        Label::Review,
        Label::Blocked,
        Label::Done,
        Label::Failing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Label::Task => "task",
            Label::InProgress => "in-progress",
            Label::Review => "review",
            Label::Blocked => "blocked",
            Label::Done => "done",
            Label::Failing => "failing",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Label::ALL
            .into_iter()
            .find(|label| label.as_str() == s)
            .ok_or_else(|| format!("unknown label {s:?}"))
    }
}

/// Opaque per-item version used for conditional writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Revision(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub title: String,
    /// Free text; acceptance criteria are a markdown checklist.
    pub body: String,
    pub labels: BTreeSet<Label>,
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
    pub revision: Revision,
    /// Ordered oldest first. May be empty in list results.
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl WorkItem {
    pub fn has(&self, label: Label) -> bool {
        self.labels.contains(&label)
    }

    /// `in-progress` together with a recorded assignee.
    pub fn is_claimed(&self) -> bool {
        self.has(Label::InProgress) && self.assignee.as_deref().is_some_and(|a| !a.is_empty())
    }

    pub fn is_claimed_by(&self, worker: &str) -> bool {
        self.is_claimed() && self.assignee.as_deref() == Some(worker)
    }

    /// Free for claiming: a task nobody owns and nothing else is waiting on.
    pub fn is_claimable(&self) -> bool {
        self.has(Label::Task)
            && !self.has(Label::InProgress)
            && !self.has(Label::Blocked)
            && !self.has(Label::Review)
            && !self.has(Label::Done)
            && self.assignee.as_deref().is_none_or(str::is_empty)
    }

    /// Unchecked `- [ ]` entries of the body's checklist.
    pub fn open_criteria(&self) -> Vec<&str> {
        self.body
            .lines()
            .filter_map(|line| line.trim_start().strip_prefix("- [ ]"))
            .map(str::trim)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    Approve,
    RequestChanges,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Approve => "approve",
            Verdict::RequestChanges => "request-changes",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub reviewer: String,
    pub verdict: Verdict,
    pub comments: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeState {
    Open,
    /// Open, with a standing non-author approval.
    Approved,
    Merged,
    Closed,
}

/// A proposed modification closing exactly one work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub branch: String,
    pub title: String,
    pub body: String,
    pub author: String,
    pub closes: ItemId,
    pub reviews: Vec<Review>,
    pub state: MergeState,
    pub labels: BTreeSet<Label>,
    pub created_at: DateTime<Utc>,
    /// Time of the newest commit pushed by the author.
    pub last_author_commit_at: DateTime<Utc>,
}

impl Change {
    pub fn has(&self, label: Label) -> bool {
        self.labels.contains(&label)
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, MergeState::Open | MergeState::Approved)
    }

    /// Move an open change between `Open` and `Approved`. It reads as
    /// approved while some non-author's latest review approves and no
    /// non-author's latest review requests changes after the author's last
    /// commit. The merge gate still decides quorum.
    pub fn refresh_review_state(&mut self) {
        if !self.is_open() {
            return;
        }
        let approved = {
            let mut latest: BTreeMap<&str, &Review> = BTreeMap::new();
            for review in self.reviews.iter().filter(|r| r.reviewer != self.author) {
                let entry = latest.entry(review.reviewer.as_str()).or_insert(review);
                if review.submitted_at > entry.submitted_at {
                    *entry = review;
                }
            }
            let blocked = latest
                .values()
                .any(|r| r.verdict == Verdict::RequestChanges && r.submitted_at > self.last_author_commit_at);
            !blocked && latest.values().any(|r| r.verdict == Verdict::Approve)
        };
        self.state = if approved { MergeState::Approved } else { MergeState::Open };
    }

    /// Latest review from `reviewer`, by submission time.
    pub fn latest_review_by(&self, reviewer: &str) -> Option<&Review> {
        self.reviews
            .iter()
            .filter(|r| r.reviewer == reviewer)
            .max_by_key(|r| r.submitted_at)
    }
}

/// Label presence/absence filter for listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    pub with: Vec<Label>,
    pub without: Vec<Label>,
}

impl LabelFilter {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, label: Label) -> Self {
        self.with.push(label);
        self
    }

    #[must_use]
    pub fn without(mut self, label: Label) -> Self {
        self.without.push(label);
        self
    }

    pub fn matches(&self, labels: &BTreeSet<Label>) -> bool {
        self.with.iter().all(|l| labels.contains(l)) && !self.without.iter().any(|l| labels.contains(l))
    }
}

/// Result of asking the store to integrate a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeResult {
    Merged,
    AlreadyMerged,
    NotMergeable,
}

/// Proposed new work item, produced by planning or feedback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDraft {
    pub title: String,
    pub body: String,
}

/// Capability surface the protocol consumes.
///
/// Every call is a network round trip in real adapters; callers re-read
/// rather than cache.
pub trait WorkStore {
    /// Whether `expected` revisions on mutations are honoured atomically.
    fn supports_conditional_update(&self) -> bool;

    fn create_item(&self, title: &str, body: &str, labels: &[Label]) -> Result<ItemId, StoreError>;

    /// Always includes comments.
    fn get_item(&self, id: ItemId) -> Result<WorkItem, StoreError>;

    fn list_items(&self, filter: &LabelFilter) -> Result<Vec<WorkItem>, StoreError>;

    fn update_item_labels(
        &self,
        id: ItemId,
        add: &[Label],
        remove: &[Label],
        expected: Option<Revision>,
    ) -> Result<Revision, StoreError>;

    /// `None` clears the assignee.
    fn assign_item(
        &self,
        id: ItemId,
        worker: Option<&str>,
        expected: Option<Revision>,
    ) -> Result<Revision, StoreError>;

    fn append_comment(&self, id: ItemId, author: &str, text: &str) -> Result<(), StoreError>;

    fn create_change(
        &self,
        branch: &str,
        title: &str,
        body: &str,
        closes: ItemId,
    ) -> Result<ChangeId, StoreError>;

    fn get_change(&self, id: ChangeId) -> Result<Change, StoreError>;

    /// Open changes matching the filter.
    fn list_changes(&self, filter: &LabelFilter) -> Result<Vec<Change>, StoreError>;

    fn add_review(
        &self,
        change: ChangeId,
        reviewer: &str,
        verdict: Verdict,
        comments: &str,
    ) -> Result<(), StoreError>;

    fn update_change_labels(
        &self,
        change: ChangeId,
        add: &[Label],
        remove: &[Label],
    ) -> Result<(), StoreError>;

    /// Squash-integrate the change's branch.
    fn merge_change(&self, change: ChangeId) -> Result<MergeResult, StoreError>;

    fn close_change(&self, change: ChangeId) -> Result<(), StoreError>;
}

impl<S: WorkStore + ?Sized> WorkStore for &S {
    fn supports_conditional_update(&self) -> bool {
        (**self).supports_conditional_update()
    }
    fn create_item(&self, title: &str, body: &str, labels: &[Label]) -> Result<ItemId, StoreError> {
        (**self).create_item(title, body, labels)
    }
    fn get_item(&self, id: ItemId) -> Result<WorkItem, StoreError> {
        (**self).get_item(id)
    }
    fn list_items(&self, filter: &LabelFilter) -> Result<Vec<WorkItem>, StoreError> {
        (**self).list_items(filter)
    }
    fn update_item_labels(
        &self,
        id: ItemId,
        add: &[Label],
        remove: &[Label],
        expected: Option<Revision>,
    ) -> Result<Revision, StoreError> {
        (**self).update_item_labels(id, add, remove, expected)
    }
    fn assign_item(
        &self,
        id: ItemId,
        worker: Option<&str>,
        expected: Option<Revision>,
    ) -> Result<Revision, StoreError> {
        (**self).assign_item(id, worker, expected)
    }
    fn append_comment(&self, id: ItemId, author: &str, text: &str) -> Result<(), StoreError> {
        (**self).append_comment(id, author, text)
    }
    fn create_change(
        &self,
        branch: &str,
        title: &str,
        body: &str,
        closes: ItemId,
    ) -> Result<ChangeId, StoreError> {
        (**self).create_change(branch, title, body, closes)
    }
    fn get_change(&self, id: ChangeId) -> Result<Change, StoreError> {
        (**self).get_change(id)
    }
    fn list_changes(&self, filter: &LabelFilter) -> Result<Vec<Change>, StoreError> {
        (**self).list_changes(filter)
    }
    fn add_review(
        &self,
        change: ChangeId,
        reviewer: &str,
        verdict: Verdict,
        comments: &str,
    ) -> Result<(), StoreError> {
        (**self).add_review(change, reviewer, verdict, comments)
    }
    fn update_change_labels(
        &self,
        change: ChangeId,
        add: &[Label],
        remove: &[Label],
    ) -> Result<(), StoreError> {
        (**self).update_change_labels(change, add, remove)
    }
    fn merge_change(&self, change: ChangeId) -> Result<MergeResult, StoreError> {
        (**self).merge_change(change)
    }
    fn close_change(&self, change: ChangeId) -> Result<(), StoreError> {
        (**self).close_change(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(labels: &[Label], assignee: Option<&str>) -> WorkItem {
        WorkItem {
            id: 1,
            title: "Add parser".into(),
            body: "- [ ] parses headers\n- [x] has tests\n  - [ ] nested item".into(),
            labels: labels.iter().copied().collect(),
            assignee: assignee.map(String::from),
            created_at: Utc::now(),
            revision: Revision(1),
            comments: Vec::new(),
        }
    }

    #[test]
    fn label_round_trips_through_str() {
        for label in Label::ALL {
            assert_eq!(label.as_str().parse::<Label>(), Ok(label));
        }
        assert!("wontfix".parse::<Label>().is_err());
    }

    #[test]
    fn claimed_requires_label_and_assignee() {
        assert!(item(&[Label::Task, Label::InProgress], Some("w1")).is_claimed());
        assert!(!item(&[Label::Task, Label::InProgress], None).is_claimed());
        assert!(!item(&[Label::Task], Some("w1")).is_claimed());
        assert!(item(&[Label::Task, Label::InProgress], Some("w1")).is_claimed_by("w1"));
        assert!(!item(&[Label::Task, Label::InProgress], Some("w1")).is_claimed_by("w2"));
    }

    #[test]
    fn claimable_excludes_owned_and_finished_items() {
        assert!(item(&[Label::Task], None).is_claimable());
        assert!(item(&[Label::Task, Label::Failing], None).is_claimable());
        assert!(!item(&[Label::Task], Some("w1")).is_claimable());
        assert!(!item(&[Label::Task, Label::Blocked], None).is_claimable());
        assert!(!item(&[Label::Task, Label::Review], None).is_claimable());
        assert!(!item(&[Label::Task, Label::Done], None).is_claimable());
        assert!(!item(&[], None).is_claimable());
    }

    #[test]
    fn open_criteria_lists_unchecked_boxes() {
        let it = item(&[Label::Task], None);
        assert_eq!(it.open_criteria(), vec!["parses headers", "nested item"]);
    }

    #[test]
    fn label_filter_matches_presence_and_absence() {
        let labels: BTreeSet<Label> = [Label::Task, Label::Failing].into_iter().collect();
        assert!(LabelFilter::new().with(Label::Task).matches(&labels));
        assert!(!LabelFilter::new().with(Label::Task).without(Label::Failing).matches(&labels));
        assert!(LabelFilter::new().without(Label::Done).matches(&labels));
    }

    #[test]
    fn latest_review_by_uses_submission_time() {
        let t0 = Utc::now();
        let change = Change {
            id: 7,
            branch: "peerloop/1-add-parser".into(),
            title: "Add parser".into(),
            body: String::new(),
            author: "w1".into(),
            closes: 1,
            reviews: vec![
                Review {
                    reviewer: "w2".into(),
                    verdict: Verdict::Approve,
                    comments: String::new(),
                    submitted_at: t0 + chrono::Duration::seconds(5),
                },
                Review {
                    reviewer: "w2".into(),
                    verdict: Verdict::RequestChanges,
                    comments: String::new(),
                    submitted_at: t0,
                },
            ],
            state: MergeState::Open,
            labels: BTreeSet::new(),
            created_at: t0,
            last_author_commit_at: t0,
        };
        assert_eq!(change.latest_review_by("w2").map(|r| r.verdict), Some(Verdict::Approve));
        assert!(change.latest_review_by("w3").is_none());
    }
}

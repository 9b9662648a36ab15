//! In-memory work store.
//!
//! Backs the protocol tests and local dry runs. Item writes are applied to
//! an authoritative history, but reads only see snapshots whose visibility
//! delay has elapsed, which reproduces the stale reads an eventually
//! consistent store serves. Changes are immediately visible.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{
    Change, ChangeId, Comment, ItemId, Label, LabelFilter, MergeResult, MergeState, Review,
    Revision, StoreError, Verdict, WorkItem, WorkStore,
};

/// Behaviour knobs for the simulated store.
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Honour `expected` revisions atomically.
    pub conditional: bool,
    /// Minimum delay before an item write becomes readable.
    pub visibility_lag: Duration,
    /// Extra random delay added per write, up to this bound.
    pub lag_jitter: Duration,
    pub seed: u64,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            conditional: true,
            visibility_lag: Duration::ZERO,
            lag_jitter: Duration::ZERO,
            seed: 7,
        }
    }
}

impl MemoryOptions {
    /// A store without conditional updates whose reads lag by up to `max_lag`.
    pub fn eventual(max_lag: Duration) -> Self {
        Self {
            conditional: false,
            visibility_lag: Duration::ZERO,
            lag_jitter: max_lag,
            seed: 7,
        }
    }
}

struct Snapshot {
    visible_at: Instant,
    item: WorkItem,
}

struct ChangeRecord {
    change: Change,
    mergeable: bool,
}

struct Inner {
    next_id: u64,
    clock: DateTime<Utc>,
    items: BTreeMap<ItemId, Vec<Snapshot>>,
    changes: BTreeMap<ChangeId, ChangeRecord>,
    integration: Vec<ChangeId>,
    pending_failures: u32,
    rng: StdRng,
}

impl Inner {
    /// Strictly increasing store time.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        self.clock = if now > self.clock {
            now
        } else {
            self.clock + chrono::Duration::microseconds(1)
        };
        self.clock
    }

    fn inject_failure(&mut self) -> Result<(), StoreError> {
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(StoreError::Transient("injected failure".into()));
        }
        Ok(())
    }

    fn latest(&self, id: ItemId) -> Result<&WorkItem, StoreError> {
        self.items
            .get(&id)
            .and_then(|history| history.last())
            .map(|snap| &snap.item)
            .ok_or(StoreError::NotFound { kind: "item", id })
    }

    fn visible(&self, id: ItemId, now: Instant) -> Option<&WorkItem> {
        self.items
            .get(&id)?
            .iter()
            .rev()
            .find(|snap| snap.visible_at <= now)
            .map(|snap| &snap.item)
    }

    fn change_mut(&mut self, id: ChangeId) -> Result<&mut ChangeRecord, StoreError> {
        self.changes
            .get_mut(&id)
            .ok_or(StoreError::NotFound { kind: "change", id })
    }
}

/// Shared in-memory store. Workers talk to it through [`MemorySession`]s.
pub struct MemoryStore {
    options: MemoryOptions,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(options: MemoryOptions) -> Arc<Self> {
        let rng = StdRng::seed_from_u64(options.seed);
        Arc::new(Self {
            options,
            inner: Mutex::new(Inner {
                next_id: 1,
                clock: DateTime::<Utc>::MIN_UTC,
                items: BTreeMap::new(),
                changes: BTreeMap::new(),
                integration: Vec::new(),
                pending_failures: 0,
                rng,
            }),
        })
    }

    /// Open a session acting as `identity` (the author of created changes).
    pub fn session(self: &Arc<Self>, identity: &str) -> MemorySession {
        MemorySession {
            store: Arc::clone(self),
            identity: identity.to_string(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` store calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.lock().pending_failures = n;
    }

    /// Record a follow-up commit by the change's author.
    pub fn push_commit(&self, change: ChangeId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let now = inner.tick();
        let record = inner.change_mut(change)?;
        record.change.last_author_commit_at = now;
        record.change.refresh_review_state();
        Ok(())
    }

    pub fn set_mergeable(&self, change: ChangeId, mergeable: bool) -> Result<(), StoreError> {
        self.lock().change_mut(change)?.mergeable = mergeable;
        Ok(())
    }

    /// Changes squash-merged so far, in merge order.
    pub fn integration_log(&self) -> Vec<ChangeId> {
        self.lock().integration.clone()
    }

    /// Authoritative (non-lagged) view of every item.
    pub fn items(&self) -> Vec<WorkItem> {
        let inner = self.lock();
        inner
            .items
            .values()
            .filter_map(|history| history.last())
            .map(|snap| snap.item.clone())
            .collect()
    }

    /// Every change ever created, including merged and closed ones.
    pub fn changes(&self) -> Vec<Change> {
        self.lock().changes.values().map(|r| r.change.clone()).collect()
    }

    fn commit_item(&self, inner: &mut Inner, mut item: WorkItem) -> Revision {
        let lag = self.options.visibility_lag + jitter(inner, self.options.lag_jitter);
        item.revision = Revision(item.revision.0 + 1);
        let revision = item.revision;
        inner.items.entry(item.id).or_default().push(Snapshot {
            visible_at: Instant::now() + lag,
            item,
        });
        revision
    }

    fn check_expected(&self, current: &WorkItem, expected: Option<Revision>) -> Result<(), StoreError> {
        if self.options.conditional
            && let Some(expected) = expected
            && expected != current.revision
        {
            return Err(StoreError::Conflict {
                kind: "item",
                id: current.id,
            });
        }
        Ok(())
    }
}

fn jitter(inner: &mut Inner, bound: Duration) -> Duration {
    if bound.is_zero() {
        return Duration::ZERO;
    }
    let nanos = u64::try_from(bound.as_nanos()).unwrap_or(u64::MAX);
    Duration::from_nanos(inner.rng.random_range(0..=nanos))
}

/// A worker's handle onto a [`MemoryStore`].
#[derive(Clone)]
pub struct MemorySession {
    store: Arc<MemoryStore>,
    identity: String,
}

impl MemorySession {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

impl WorkStore for MemorySession {
    fn supports_conditional_update(&self) -> bool {
        self.store.options.conditional
    }

    fn create_item(&self, title: &str, body: &str, labels: &[Label]) -> Result<ItemId, StoreError> {
        let mut inner = self.store.lock();
        inner.inject_failure()?;
        let id = inner.next_id;
        inner.next_id += 1;
        let created_at = inner.tick();
        let item = WorkItem {
            id,
            title: title.to_string(),
            body: body.to_string(),
            labels: labels.iter().copied().collect(),
            assignee: None,
            created_at,
            revision: Revision(0),
            comments: Vec::new(),
        };
        self.store.commit_item(&mut inner, item);
        Ok(id)
    }

    fn get_item(&self, id: ItemId) -> Result<WorkItem, StoreError> {
        let mut inner = self.store.lock();
        inner.inject_failure()?;
        inner
            .visible(id, Instant::now())
            .cloned()
            .ok_or(StoreError::NotFound { kind: "item", id })
    }

    fn list_items(&self, filter: &LabelFilter) -> Result<Vec<WorkItem>, StoreError> {
        let mut inner = self.store.lock();
        inner.inject_failure()?;
        let now = Instant::now();
        let ids: Vec<ItemId> = inner.items.keys().copied().collect();
        Ok(ids
            .into_iter()
            .filter_map(|id| inner.visible(id, now))
            .filter(|item| filter.matches(&item.labels))
            .cloned()
            .collect())
    }

    fn update_item_labels(
        &self,
        id: ItemId,
        add: &[Label],
        remove: &[Label],
        expected: Option<Revision>,
    ) -> Result<Revision, StoreError> {
        let mut inner = self.store.lock();
        inner.inject_failure()?;
        let mut item = inner.latest(id)?.clone();
        self.store.check_expected(&item, expected)?;
        for label in remove {
            item.labels.remove(label);
        }
        item.labels.extend(add.iter().copied());
        Ok(self.store.commit_item(&mut inner, item))
    }

    fn assign_item(
        &self,
        id: ItemId,
        worker: Option<&str>,
        expected: Option<Revision>,
    ) -> Result<Revision, StoreError> {
        let mut inner = self.store.lock();
        inner.inject_failure()?;
        let mut item = inner.latest(id)?.clone();
        self.store.check_expected(&item, expected)?;
        item.assignee = worker.map(String::from);
        Ok(self.store.commit_item(&mut inner, item))
    }

    fn append_comment(&self, id: ItemId, author: &str, text: &str) -> Result<(), StoreError> {
        let mut inner = self.store.lock();
        inner.inject_failure()?;
        let mut item = inner.latest(id)?.clone();
        let created_at = inner.tick();
        item.comments.push(Comment {
            author: author.to_string(),
            body: text.to_string(),
            created_at,
        });
        self.store.commit_item(&mut inner, item);
        Ok(())
    }

    fn create_change(
        &self,
        branch: &str,
        title: &str,
        body: &str,
        closes: ItemId,
    ) -> Result<ChangeId, StoreError> {
        let mut inner = self.store.lock();
        inner.inject_failure()?;
        inner.latest(closes)?;
        let id = inner.next_id;
        inner.next_id += 1;
        let now = inner.tick();
        inner.changes.insert(
            id,
            ChangeRecord {
                change: Change {
                    id,
                    branch: branch.to_string(),
                    title: title.to_string(),
                    body: body.to_string(),
                    author: self.identity.clone(),
                    closes,
                    reviews: Vec::new(),
                    state: MergeState::Open,
                    labels: BTreeSet::new(),
                    created_at: now,
                    last_author_commit_at: now,
                },
                mergeable: true,
            },
        );
        Ok(id)
    }

    fn get_change(&self, id: ChangeId) -> Result<Change, StoreError> {
        let mut inner = self.store.lock();
        inner.inject_failure()?;
        Ok(inner.change_mut(id)?.change.clone())
    }

    fn list_changes(&self, filter: &LabelFilter) -> Result<Vec<Change>, StoreError> {
        let mut inner = self.store.lock();
        inner.inject_failure()?;
        Ok(inner
            .changes
            .values()
            .map(|r| &r.change)
            .filter(|c| c.is_open() && filter.matches(&c.labels))
            .cloned()
            .collect())
    }

    fn add_review(
        &self,
        change: ChangeId,
        reviewer: &str,
        verdict: Verdict,
        comments: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.store.lock();
        inner.inject_failure()?;
        let submitted_at = inner.tick();
        let record = inner.change_mut(change)?;
        record.change.reviews.push(Review {
            reviewer: reviewer.to_string(),
            verdict,
            comments: comments.to_string(),
            submitted_at,
        });
        record.change.refresh_review_state();
        Ok(())
    }

    fn update_change_labels(
        &self,
        change: ChangeId,
        add: &[Label],
        remove: &[Label],
    ) -> Result<(), StoreError> {
        let mut inner = self.store.lock();
        inner.inject_failure()?;
        let record = inner.change_mut(change)?;
        for label in remove {
            record.change.labels.remove(label);
        }
        record.change.labels.extend(add.iter().copied());
        Ok(())
    }

    fn merge_change(&self, change: ChangeId) -> Result<MergeResult, StoreError> {
        let mut inner = self.store.lock();
        inner.inject_failure()?;
        let record = inner.change_mut(change)?;
        match record.change.state {
            MergeState::Merged => return Ok(MergeResult::AlreadyMerged),
            MergeState::Closed => return Ok(MergeResult::NotMergeable),
            MergeState::Open | MergeState::Approved => {}
        }
        if !record.mergeable {
            return Ok(MergeResult::NotMergeable);
        }
        record.change.state = MergeState::Merged;
        inner.integration.push(change);
        Ok(MergeResult::Merged)
    }

    fn close_change(&self, change: ChangeId) -> Result<(), StoreError> {
        let mut inner = self.store.lock();
        inner.inject_failure()?;
        let record = inner.change_mut(change)?;
        if record.change.state != MergeState::Merged {
            record.change.state = MergeState::Closed;
        }
        Ok(())
    }
}

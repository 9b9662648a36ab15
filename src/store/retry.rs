//! Retry decorator for work stores.
//!
//! Transient failures are retried with exponential backoff and jitter;
//! every other error is returned on first sight.

use std::thread;
use std::time::Duration;

use rand::Rng;

use super::{
    Change, ChangeId, ItemId, Label, LabelFilter, MergeResult, Revision, StoreError, Verdict,
    WorkItem, WorkStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff with +-30% jitter.
    fn jittered(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let range = base.mul_f64(0.3);
        if range.is_zero() {
            return base;
        }
        let span = u64::try_from(range.as_micros()).unwrap_or(u64::MAX);
        let offset = rand::rng().random_range(0..=span.saturating_mul(2));
        base.saturating_sub(range) + Duration::from_micros(offset)
    }

    /// Run `op`, retrying transient failures.
    pub fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.jittered(attempt);
                    attempt += 1;
                    tracing::debug!(
                        op = what,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient store error, retrying"
                    );
                    thread::sleep(delay);
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(op = what, attempts = attempt + 1, error = %err, "retries exhausted");
                    return Err(err);
                }
                other => return other,
            }
        }
    }
}

/// Wraps a store so every call goes through a [`RetryPolicy`].
pub struct Retrying<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: WorkStore> Retrying<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: WorkStore> WorkStore for Retrying<S> {
    fn supports_conditional_update(&self) -> bool {
        self.inner.supports_conditional_update()
    }

    fn create_item(&self, title: &str, body: &str, labels: &[Label]) -> Result<ItemId, StoreError> {
        self.policy
            .run("create_item", || self.inner.create_item(title, body, labels))
    }

    fn get_item(&self, id: ItemId) -> Result<WorkItem, StoreError> {
        self.policy.run("get_item", || self.inner.get_item(id))
    }

    fn list_items(&self, filter: &LabelFilter) -> Result<Vec<WorkItem>, StoreError> {
        self.policy.run("list_items", || self.inner.list_items(filter))
    }

    fn update_item_labels(
        &self,
        id: ItemId,
        add: &[Label],
        remove: &[Label],
        expected: Option<Revision>,
    ) -> Result<Revision, StoreError> {
        self.policy.run("update_item_labels", || {
            self.inner.update_item_labels(id, add, remove, expected)
        })
    }

    fn assign_item(
        &self,
        id: ItemId,
        worker: Option<&str>,
        expected: Option<Revision>,
    ) -> Result<Revision, StoreError> {
        self.policy
            .run("assign_item", || self.inner.assign_item(id, worker, expected))
    }

    fn append_comment(&self, id: ItemId, author: &str, text: &str) -> Result<(), StoreError> {
        self.policy
            .run("append_comment", || self.inner.append_comment(id, author, text))
    }

    fn create_change(
        &self,
        branch: &str,
        title: &str,
        body: &str,
        closes: ItemId,
    ) -> Result<ChangeId, StoreError> {
        self.policy.run("create_change", || {
            self.inner.create_change(branch, title, body, closes)
        })
    }

    fn get_change(&self, id: ChangeId) -> Result<Change, StoreError> {
        self.policy.run("get_change", || self.inner.get_change(id))
    }

    fn list_changes(&self, filter: &LabelFilter) -> Result<Vec<Change>, StoreError> {
        self.policy.run("list_changes", || self.inner.list_changes(filter))
    }

    fn add_review(
        &self,
        change: ChangeId,
        reviewer: &str,
        verdict: Verdict,
        comments: &str,
    ) -> Result<(), StoreError> {
        self.policy.run("add_review", || {
            self.inner.add_review(change, reviewer, verdict, comments)
        })
    }

    fn update_change_labels(
        &self,
        change: ChangeId,
        add: &[Label],
        remove: &[Label],
    ) -> Result<(), StoreError> {
        self.policy.run("update_change_labels", || {
            self.inner.update_change_labels(change, add, remove)
        })
    }

    fn merge_change(&self, change: ChangeId) -> Result<MergeResult, StoreError> {
        self.policy.run("merge_change", || self.inner.merge_change(change))
    }

    fn close_change(&self, change: ChangeId) -> Result<(), StoreError> {
        self.policy.run("close_change", || self.inner.close_change(change))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::store::memory::{MemoryOptions, MemoryStore};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(10), Duration::from_secs(15));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(15));
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let calls = Cell::new(0);
        let result = fast(5).run("op", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(StoreError::Transient("503".into()))
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn retries_stop_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), _> = fast(3).run("op", || {
            calls.set(calls.get() + 1);
            Err(StoreError::Transient("503".into()))
        });
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn conflicts_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = fast(5).run("op", || {
            calls.set(calls.get() + 1);
            Err(StoreError::Conflict { kind: "item", id: 1 })
        });
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn decorator_hides_brief_outages() {
        let store = MemoryStore::new(MemoryOptions::default());
        let retrying = Retrying::new(store.session("w1"), fast(4));
        store.fail_next(2);
        let id = retrying.create_item("Add parser", "", &[Label::Task]).unwrap();
        assert_eq!(retrying.get_item(id).unwrap().title, "Add parser");
    }
}

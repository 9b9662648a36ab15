//! Per-worker work loop.
//!
//! A worker is a single-threaded state machine. Each step re-reads the
//! store, so a restarted worker needs no recovery beyond starting again.
//! Steps never fail: errors are logged, a transient store failure that
//! outlived its retries blocks the item being worked on, and the machine
//! moves on.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::SeedableRng;
use serde::Serialize;

use crate::agent::{Agent, ReviewDecision, Validation, Validator, WorkOutcome};
use crate::protocol::bootstrap::{bootstrap, needs_bootstrap};
use crate::protocol::branch::branch_name;
use crate::protocol::feedback::record_failure;
use crate::protocol::progress::{ProgressPolicy, ProgressReport, check_progress};
use crate::protocol::{
    ClaimOutcome, ClaimPolicy, MergeOutcome, MergePolicy, change_marker, evaluate_gate, try_claim,
    try_merge, verify_claim,
};
use crate::store::{
    Change, ChangeId, ItemId, Label, LabelFilter, Review, StoreError, Verdict, WorkItem, WorkStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "state", content = "item")]
pub enum State {
    Bootstrap,
    FindWork,
    Implement(ItemId),
    ReviewPeers,
    RespondToReviews,
    CheckProgress,
}

impl State {
    /// Where to go when this state's step fails.
    fn fallback(self) -> State {
        match self {
            State::Bootstrap | State::Implement(_) | State::CheckProgress => State::FindWork,
            State::FindWork => State::ReviewPeers,
            State::ReviewPeers => State::RespondToReviews,
            State::RespondToReviews => State::CheckProgress,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Bootstrap => f.write_str("bootstrap"),
            State::FindWork => f.write_str("find-work"),
            State::Implement(item) => write!(f, "implement(#{item})"),
            State::ReviewPeers => f.write_str("review-peers"),
            State::RespondToReviews => f.write_str("respond-to-reviews"),
            State::CheckProgress => f.write_str("check-progress"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub identity: String,
    /// Branch namespace.
    pub namespace: String,
    pub base_branch: String,
    /// Human-authored goal the plan is derived from.
    pub goal: String,
    pub claim: ClaimPolicy,
    pub merge: MergePolicy,
    pub progress: ProgressPolicy,
    /// Changes reviewed or answered per step.
    pub max_per_step: usize,
    /// Fixed seed for work selection; random when `None`.
    pub seed: Option<u64>,
}

impl WorkerSettings {
    pub fn new(identity: &str, goal: &str) -> Self {
        Self {
            identity: identity.to_string(),
            namespace: "peerloop".to_string(),
            base_branch: "main".to_string(),
            goal: goal.to_string(),
            claim: ClaimPolicy::default(),
            merge: MergePolicy::default(),
            progress: ProgressPolicy::default(),
            max_per_step: 3,
            seed: None,
        }
    }
}

pub struct Worker<S, A, V> {
    store: S,
    agent: A,
    validator: V,
    settings: WorkerSettings,
    state: State,
    rng: StdRng,
    /// Item the current step is working on, blocked if the store gives out.
    focus: Option<ItemId>,
    last_progress: Option<ProgressReport>,
}

impl<S: WorkStore, A: Agent, V: Validator> Worker<S, A, V> {
    pub fn new(store: S, agent: A, validator: V, settings: WorkerSettings) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            store,
            agent,
            validator,
            settings,
            state: State::Bootstrap,
            rng,
            focus: None,
            last_progress: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn identity(&self) -> &str {
        &self.settings.identity
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn last_progress(&self) -> Option<&ProgressReport> {
        self.last_progress.as_ref()
    }

    /// Run one state to completion and return the next state.
    pub fn step(&mut self) -> State {
        let state = self.state;
        let span = tracing::info_span!("step", worker = %self.settings.identity, state = %state);
        let _guard = span.enter();

        self.focus = None;
        let next = match self.run_state(state) {
            Ok(next) => next,
            Err(err) => {
                self.recover(&err);
                state.fallback()
            }
        };
        tracing::debug!(next = %next, "transition");
        self.state = next;
        next
    }

    /// Step until shut down, the goal is complete, or `max_loops` full
    /// cycles have run (0 = unbounded), pausing after every Check-Progress.
    /// Returns the cycles completed.
    pub fn run(&mut self, shutdown: &AtomicBool, pause: Duration, max_loops: u64) -> u64 {
        let mut loops = 0;
        while !shutdown.load(Ordering::SeqCst) {
            let before = self.state;
            self.step();
            if before == State::CheckProgress {
                loops += 1;
                if self.last_progress.as_ref().is_some_and(|p| p.complete) {
                    tracing::info!(loops, "goal complete");
                    break;
                }
                if max_loops > 0 && loops >= max_loops {
                    break;
                }
                sleep_unless(shutdown, pause);
            }
        }
        tracing::info!(loops, "worker stopped");
        loops
    }

    fn run_state(&mut self, state: State) -> anyhow::Result<State> {
        match state {
            State::Bootstrap => self.bootstrap(),
            State::FindWork => self.find_work(),
            State::Implement(item) => self.implement(item),
            State::ReviewPeers => self.review_peers(),
            State::RespondToReviews => self.respond_to_reviews(),
            State::CheckProgress => self.check_progress(),
        }
    }

    fn recover(&self, err: &anyhow::Error) {
        tracing::error!(error = %format!("{err:#}"), "step failed");
        let transient = err
            .downcast_ref::<StoreError>()
            .is_some_and(StoreError::is_transient);
        let (true, Some(item)) = (transient, self.focus) else {
            return;
        };
        let me = self.identity();
        let result = self
            .store
            .update_item_labels(item, &[Label::Blocked], &[Label::InProgress], None)
            .and_then(|_| {
                self.store
                    .append_comment(item, me, &format!("Blocked: {err}"))
            });
        match result {
            Ok(()) => tracing::warn!(item, "blocked item after store failure"),
            Err(e) => tracing::warn!(item, error = %e, "could not block item"),
        }
    }

    fn bootstrap(&mut self) -> anyhow::Result<State> {
        if needs_bootstrap(&self.store)? {
            bootstrap(&self.store, &self.agent, &self.settings.goal)?;
        }
        Ok(State::FindWork)
    }

    fn reviewable(&self) -> Result<Vec<Change>, StoreError> {
        let me = self.identity();
        Ok(self
            .store
            .list_changes(&LabelFilter::new().with(Label::Review))?
            .into_iter()
            .filter(|c| c.author != me)
            .collect())
    }

    fn find_work(&mut self) -> anyhow::Result<State> {
        let candidates: Vec<WorkItem> = self
            .store
            .list_items(
                &LabelFilter::new()
                    .with(Label::Task)
                    .without(Label::InProgress)
                    .without(Label::Blocked)
                    .without(Label::Review)
                    .without(Label::Done),
            )?
            .into_iter()
            .filter(WorkItem::is_claimable)
            .collect();

        // Regressions first.
        let failing: Vec<&WorkItem> = candidates.iter().filter(|i| i.has(Label::Failing)).collect();
        let pool: Vec<&WorkItem> = if failing.is_empty() {
            candidates.iter().collect()
        } else {
            failing
        };

        if let Some(item) = pool.choose(&mut self.rng) {
            let id = item.id;
            let outcome = try_claim(&self.store, id, self.identity(), &self.settings.claim)?;
            return Ok(match outcome {
                ClaimOutcome::Claimed => State::Implement(id),
                ClaimOutcome::AlreadyClaimed | ClaimOutcome::NotFound => State::ReviewPeers,
            });
        }

        if !self.reviewable()?.is_empty() {
            Ok(State::ReviewPeers)
        } else if self.awaiting_response()? {
            Ok(State::RespondToReviews)
        } else {
            Ok(State::CheckProgress)
        }
    }

    /// Whether one of this worker's changes has unanswered change requests.
    fn awaiting_response(&self) -> Result<bool, StoreError> {
        let me = self.identity();
        Ok(self
            .store
            .list_changes(&LabelFilter::new())?
            .iter()
            .filter(|c| c.author == me)
            .any(|c| !evaluate_gate(c, &self.settings.merge).blocked_by.is_empty()))
    }

    fn mark_stuck(&self, item: ItemId, reason: &str) -> Result<(), StoreError> {
        self.store
            .update_item_labels(item, &[Label::Blocked], &[Label::InProgress], None)?;
        self.store
            .append_comment(item, self.identity(), &format!("Blocked: {reason}"))?;
        tracing::info!(item, reason, "item blocked");
        Ok(())
    }

    fn implement(&mut self, id: ItemId) -> anyhow::Result<State> {
        self.focus = Some(id);
        let me = self.identity().to_string();
        if !verify_claim(&self.store, id, &me, &self.settings.claim)? {
            tracing::info!(item = id, "claim no longer held, abandoning");
            return Ok(State::FindWork);
        }
        let item = self.store.get_item(id)?;

        // An earlier attempt may have opened the change before dying.
        let open = self
            .store
            .list_changes(&LabelFilter::new())?
            .into_iter()
            .find(|c| c.closes == id);
        let change = if let Some(change) = open {
            change.id
        } else {
            let branch = branch_name(&self.settings.namespace, id, &item.title);
            let outcome = self
                .agent
                .implement(&item, &branch)
                .unwrap_or_else(|e| WorkOutcome::Stuck {
                    reason: format!("agent failed: {e:#}"),
                });
            match outcome {
                WorkOutcome::Stuck { reason } => {
                    self.mark_stuck(id, &reason)?;
                    return Ok(State::FindWork);
                }
                WorkOutcome::Completed { summary } => {
                    let body = change_body(&item, &summary);
                    let change = self.store.create_change(&branch, &item.title, &body, id)?;
                    self.store.append_comment(id, &me, &change_marker(change))?;
                    change
                }
            }
        };

        self.store.update_change_labels(change, &[Label::Review], &[])?;
        self.store
            .update_item_labels(id, &[Label::Review], &[Label::InProgress], None)?;
        tracing::info!(item = id, change, "change opened for review");
        Ok(State::FindWork)
    }

    fn review_peers(&mut self) -> anyhow::Result<State> {
        let me = self.identity().to_string();
        let mut reviewed = 0;
        for change in self.reviewable()? {
            let current = change
                .latest_review_by(&me)
                .is_some_and(|r| r.submitted_at > change.last_author_commit_at);
            if !current {
                if reviewed >= self.settings.max_per_step {
                    continue;
                }
                let item = match self.store.get_item(change.closes) {
                    Ok(item) => item,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e.into()),
                };
                reviewed += 1;
                match self.agent.review(&change, &item) {
                    Ok(ReviewDecision::Approve { comments }) => {
                        self.store.add_review(change.id, &me, Verdict::Approve, &comments)?;
                    }
                    Ok(ReviewDecision::RequestChanges { comments }) => {
                        self.store
                            .add_review(change.id, &me, Verdict::RequestChanges, &comments)?;
                    }
                    Ok(ReviewDecision::Redundant { comments }) => {
                        self.close_redundant(&change, &comments)?;
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(change = change.id, error = %format!("{e:#}"), "review failed");
                        continue;
                    }
                }
            }

            match try_merge(&self.store, change.id, &self.settings.merge)? {
                MergeOutcome::Merged => self.after_merge(change.id)?,
                MergeOutcome::Conflict => {
                    let note = format!(
                        "Merge conflict: `{}` no longer integrates with `{}`. Merge the base branch into it and push a follow-up commit.",
                        change.branch, self.settings.base_branch
                    );
                    self.store
                        .add_review(change.id, &me, Verdict::RequestChanges, &note)?;
                }
                MergeOutcome::NotReady => {}
            }
        }
        Ok(State::RespondToReviews)
    }

    fn close_redundant(&self, change: &Change, comments: &str) -> Result<(), StoreError> {
        let me = self.identity();
        self.store.add_review(
            change.id,
            me,
            Verdict::RequestChanges,
            &format!("Redundant: {comments}"),
        )?;
        self.store.close_change(change.id)?;
        self.store.update_change_labels(change.id, &[], &[Label::Review])?;
        self.store.update_item_labels(
            change.closes,
            &[Label::Done],
            &[Label::InProgress, Label::Review],
            None,
        )?;
        self.store.append_comment(
            change.closes,
            me,
            &format!("Change #{} closed as redundant: {comments}", change.id),
        )?;
        tracing::info!(change = change.id, item = change.closes, "closed redundant change");
        Ok(())
    }

    /// Validate the integration branch and feed failures back as work.
    fn after_merge(&self, change: ChangeId) -> Result<(), StoreError> {
        match self.validator.validate() {
            Ok(Validation::Pass) => {
                tracing::info!(change, "validation passes after merge");
            }
            Ok(Validation::Fail { details }) => {
                let outcome = record_failure(
                    &self.store,
                    self.identity(),
                    &details,
                    Some(change),
                    self.settings.claim.settle,
                )?;
                tracing::info!(change, outcome = ?outcome, "validation fails after merge");
            }
            Err(e) => tracing::warn!(change, error = %format!("{e:#}"), "validation could not run"),
        }
        Ok(())
    }

    fn respond_to_reviews(&mut self) -> anyhow::Result<State> {
        let me = self.identity().to_string();
        let mine: Vec<Change> = self
            .store
            .list_changes(&LabelFilter::new())?
            .into_iter()
            .filter(|c| c.author == me)
            .collect();

        for change in mine.into_iter().take(self.settings.max_per_step) {
            let decision = evaluate_gate(&change, &self.settings.merge);
            if decision.blocked_by.is_empty() {
                continue;
            }
            self.focus = Some(change.closes);
            let feedback: Vec<Review> = change
                .reviews
                .iter()
                .filter(|r| {
                    r.verdict == Verdict::RequestChanges
                        && r.submitted_at > change.last_author_commit_at
                        && decision.blocked_by.contains(&r.reviewer)
                })
                .cloned()
                .collect();
            let item = self.store.get_item(change.closes)?;
            match self.agent.respond(&change, &item, &feedback) {
                Ok(WorkOutcome::Completed { .. }) => {
                    self.store.update_change_labels(change.id, &[Label::Review], &[])?;
                    tracing::info!(change = change.id, "answered change requests");
                }
                Ok(WorkOutcome::Stuck { reason }) => self.mark_stuck(change.closes, &reason)?,
                Err(e) => {
                    tracing::warn!(change = change.id, error = %format!("{e:#}"), "follow-up failed");
                }
            }
        }
        Ok(State::CheckProgress)
    }

    fn check_progress(&mut self) -> anyhow::Result<State> {
        let report = check_progress(
            &self.store,
            &self.agent,
            &self.validator,
            self.identity(),
            &self.settings.goal,
            &self.settings.progress,
        )?;
        tracing::info!(
            open_tasks = report.open_tasks,
            open_changes = report.open_changes,
            complete = report.complete,
            "progress checked"
        );
        self.last_progress = Some(report);
        Ok(State::FindWork)
    }
}

fn change_body(item: &WorkItem, summary: &str) -> String {
    let summary = summary.trim();
    if summary.is_empty() {
        format!("Implements #{}: {}", item.id, item.title)
    } else {
        format!("{summary}\n\nImplements #{}: {}", item.id, item.title)
    }
}

fn sleep_unless(shutdown: &AtomicBool, pause: Duration) {
    let deadline = Instant::now() + pause;
    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryOptions, MemorySession, MemoryStore};
    use crate::store::ItemDraft;

    struct Eager;

    impl Agent for Eager {
        fn plan(&self, _goal: &str, existing: &[WorkItem]) -> anyhow::Result<Vec<ItemDraft>> {
            if existing.is_empty() {
                Ok(vec![ItemDraft {
                    title: "Add parser".into(),
                    body: "- [ ] parses".into(),
                }])
            } else {
                Ok(Vec::new())
            }
        }
        fn implement(&self, item: &WorkItem, _branch: &str) -> anyhow::Result<WorkOutcome> {
            Ok(WorkOutcome::Completed {
                summary: format!("did {}", item.title),
            })
        }
        fn review(&self, _change: &Change, _item: &WorkItem) -> anyhow::Result<ReviewDecision> {
            Ok(ReviewDecision::Approve { comments: "lgtm".into() })
        }
        fn respond(&self, _change: &Change, _item: &WorkItem, _feedback: &[Review]) -> anyhow::Result<WorkOutcome> {
            Ok(WorkOutcome::Completed { summary: String::new() })
        }
    }

    struct Passing;

    impl Validator for Passing {
        fn validate(&self) -> anyhow::Result<Validation> {
            Ok(Validation::Pass)
        }
    }

    fn worker(session: MemorySession) -> Worker<MemorySession, Eager, Passing> {
        let mut settings = WorkerSettings::new(session.identity(), "Build a parser");
        settings.seed = Some(1);
        settings.claim.settle = Duration::ZERO;
        settings.progress.settle = Duration::ZERO;
        Worker::new(session, Eager, Passing, settings)
    }

    #[test]
    fn states_display_in_kebab_case() {
        assert_eq!(State::FindWork.to_string(), "find-work");
        assert_eq!(State::Implement(4).to_string(), "implement(#4)");
        assert_eq!(State::RespondToReviews.to_string(), "respond-to-reviews");
    }

    #[test]
    fn failed_steps_fall_forward() {
        assert_eq!(State::Implement(1).fallback(), State::FindWork);
        assert_eq!(State::FindWork.fallback(), State::ReviewPeers);
        assert_eq!(State::CheckProgress.fallback(), State::FindWork);
    }

    #[test]
    fn lone_worker_opens_a_change_but_never_merges_it() {
        let store = MemoryStore::new(MemoryOptions::default());
        let mut w = worker(store.session("w1"));

        assert_eq!(w.step(), State::FindWork);
        let item = store.items()[0].id;
        assert_eq!(w.step(), State::Implement(item));
        assert_eq!(w.step(), State::FindWork);

        let changes = store.changes();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].has(Label::Review));
        let current = store.items().remove(0);
        assert!(current.has(Label::Review) && !current.has(Label::InProgress));

        // Nothing to claim and only its own change open.
        for _ in 0..8 {
            w.step();
        }
        assert!(store.integration_log().is_empty());
        assert!(!w.last_progress().is_some_and(|p| p.complete));
    }

    #[test]
    fn store_outage_while_implementing_blocks_the_item() {
        let store = MemoryStore::new(MemoryOptions::default());
        let s = store.session("w1");
        let item = s.create_item("Add parser", "- [ ] parses", &[Label::Task]).unwrap();
        let mut w = worker(s);

        assert_eq!(w.step(), State::FindWork);
        assert_eq!(w.step(), State::Implement(item));
        store.fail_next(1);
        assert_eq!(w.step(), State::FindWork);

        let current = store.items().remove(0);
        assert!(current.has(Label::Blocked));
        assert!(!current.has(Label::InProgress));
        assert!(current.comments.iter().any(|c| c.body.starts_with("Blocked: store unavailable")));
    }

    #[test]
    fn run_stops_after_max_loops() {
        let store = MemoryStore::new(MemoryOptions::default());
        let mut w = worker(store.session("w1"));
        let shutdown = AtomicBool::new(false);
        assert_eq!(w.run(&shutdown, Duration::ZERO, 2), 2);

        shutdown.store(true, Ordering::SeqCst);
        assert_eq!(w.run(&shutdown, Duration::ZERO, 0), 0);
    }
}

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Barrier, Mutex, PoisonError};
use std::time::Duration;

use peerloop::agent::{Agent, ReviewDecision, Validation, Validator, WorkOutcome};
use peerloop::store::memory::{MemorySession, MemoryStore};
use peerloop::store::{Change, ItemDraft, Review, WorkItem};
use peerloop::worker::{Worker, WorkerSettings};

/// Agent whose decisions are fixed up front.
#[derive(Default)]
pub struct ScriptedAgent {
    drafts: Vec<ItemDraft>,
    stuck_on: Vec<String>,
    reviews: Mutex<VecDeque<ReviewDecision>>,
    store: Option<Arc<MemoryStore>>,
    barrier: Option<Arc<Barrier>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Proposes `titles` when nothing is tracked yet, nothing afterwards.
    pub fn planning(titles: &[&str]) -> Self {
        Self {
            drafts: titles
                .iter()
                .map(|t| ItemDraft {
                    title: (*t).to_string(),
                    body: format!("- [ ] {t}"),
                })
                .collect(),
            ..Self::default()
        }
    }

    /// Review verdicts handed out in order; approval once they run out.
    #[must_use]
    pub fn reviewing(self, decisions: Vec<ReviewDecision>) -> Self {
        Self {
            reviews: Mutex::new(decisions.into()),
            ..self
        }
    }

    #[must_use]
    pub fn stuck_on(mut self, title: &str) -> Self {
        self.stuck_on.push(title.to_string());
        self
    }

    /// Record a follow-up commit on the store when answering reviews.
    #[must_use]
    pub fn pushing_to(self, store: &Arc<MemoryStore>) -> Self {
        Self {
            store: Some(Arc::clone(store)),
            ..self
        }
    }

    /// Hold the first plan until every racing worker has reached it.
    #[must_use]
    pub fn racing(self, barrier: Arc<Barrier>) -> Self {
        Self {
            barrier: Some(barrier),
            ..self
        }
    }
}

impl Agent for ScriptedAgent {
    fn plan(&self, _goal: &str, existing: &[WorkItem]) -> anyhow::Result<Vec<ItemDraft>> {
        if !existing.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(barrier) = &self.barrier {
            barrier.wait();
        }
        Ok(self.drafts.clone())
    }

    fn implement(&self, item: &WorkItem, _branch: &str) -> anyhow::Result<WorkOutcome> {
        if self.stuck_on.contains(&item.title) {
            return Ok(WorkOutcome::Stuck {
                reason: "acceptance criteria contradict each other".into(),
            });
        }
        Ok(WorkOutcome::Completed {
            summary: format!("Implements {}", item.title),
        })
    }

    fn review(&self, _change: &Change, _item: &WorkItem) -> anyhow::Result<ReviewDecision> {
        let next = self
            .reviews
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        Ok(next.unwrap_or(ReviewDecision::Approve {
            comments: "Looks good.".into(),
        }))
    }

    fn respond(&self, change: &Change, _item: &WorkItem, _feedback: &[Review]) -> anyhow::Result<WorkOutcome> {
        if let Some(store) = &self.store {
            store.push_commit(change.id)?;
        }
        Ok(WorkOutcome::Completed {
            summary: "Addressed review comments".into(),
        })
    }
}

/// Validator returning queued results, then passing.
#[derive(Default)]
pub struct ScriptedValidator {
    results: Mutex<VecDeque<Validation>>,
}

impl ScriptedValidator {
    pub fn passing() -> Self {
        Self::default()
    }

    pub fn failing_once(details: &str) -> Self {
        Self {
            results: Mutex::new(VecDeque::from([Validation::Fail {
                details: details.to_string(),
            }])),
        }
    }
}

impl Validator for ScriptedValidator {
    fn validate(&self) -> anyhow::Result<Validation> {
        Ok(self
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(Validation::Pass))
    }
}

pub type TestWorker = Worker<MemorySession, ScriptedAgent, ScriptedValidator>;

/// Settings tuned for a zero-lag conditional store.
pub fn settings(identity: &str, seed: u64) -> WorkerSettings {
    let mut settings = WorkerSettings::new(identity, "Build a small parser");
    settings.seed = Some(seed);
    settings.claim.settle = Duration::ZERO;
    settings.progress.settle = Duration::ZERO;
    settings
}

pub fn worker(store: &Arc<MemoryStore>, identity: &str, agent: ScriptedAgent) -> TestWorker {
    worker_with(store, identity, agent, ScriptedValidator::passing())
}

pub fn worker_with(
    store: &Arc<MemoryStore>,
    identity: &str,
    agent: ScriptedAgent,
    validator: ScriptedValidator,
) -> TestWorker {
    let seed = identity.bytes().map(u64::from).sum();
    worker_from(store, settings(identity, seed), agent, validator)
}

pub fn worker_from(
    store: &Arc<MemoryStore>,
    settings: WorkerSettings,
    agent: ScriptedAgent,
    validator: ScriptedValidator,
) -> TestWorker {
    Worker::new(store.session(&settings.identity), agent, validator, settings)
}

/// Step every worker in turn until `done` holds or `rounds` run out.
pub fn drive(workers: &mut [TestWorker], rounds: usize, done: impl Fn() -> bool) -> bool {
    for _ in 0..rounds {
        if done() {
            return true;
        }
        for worker in workers.iter_mut() {
            worker.step();
        }
    }
    done()
}

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use peerloop::protocol::{ClaimOutcome, ClaimPolicy, try_claim, verify_claim};
use peerloop::store::memory::{MemoryOptions, MemoryStore};
use peerloop::store::{ItemId, Label, WorkStore};

/// Race `workers` claimants for one item; returns who got `Claimed`.
fn race(store: &Arc<MemoryStore>, item: ItemId, workers: usize, policy: ClaimPolicy) -> Vec<String> {
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|n| {
            let session = store.session(&format!("w{n}"));
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let me = session.identity().to_string();
                barrier.wait();
                let outcome = try_claim(&session, item, &me, &policy).unwrap();
                (me, outcome)
            })
        })
        .collect();

    handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|(_, outcome)| *outcome == ClaimOutcome::Claimed)
        .map(|(me, _)| me)
        .collect()
}

#[test]
fn compare_and_set_claim_has_exactly_one_winner() {
    let store = MemoryStore::new(MemoryOptions::default());
    let item = store
        .session("setup")
        .create_item("Add lexer", "", &[Label::Task])
        .unwrap();

    let policy = ClaimPolicy {
        settle: Duration::ZERO,
        label_retries: 3,
    };
    let winners = race(&store, item, 8, policy);
    assert_eq!(winners.len(), 1, "winners: {winners:?}");

    let current = store.items().remove(0);
    assert!(current.is_claimed_by(&winners[0]));
    assert!(verify_claim(&store.session(&winners[0]), item, &winners[0], &policy).unwrap());
}

#[test]
fn election_on_a_lagging_store_has_at_most_one_winner() {
    for round in 0..5 {
        let store = MemoryStore::new(MemoryOptions {
            seed: round,
            ..MemoryOptions::eventual(Duration::from_millis(15))
        });
        let item = store
            .session("setup")
            .create_item("Add lexer", "", &[Label::Task])
            .unwrap();
        // Let the new item become readable everywhere.
        thread::sleep(Duration::from_millis(30));

        let policy = ClaimPolicy {
            settle: Duration::from_millis(40),
            label_retries: 3,
        };
        let winners = race(&store, item, 5, policy);
        assert!(winners.len() <= 1, "round {round}: winners {winners:?}");

        let current = store.items().remove(0);
        match winners.first() {
            Some(winner) => {
                assert_eq!(current.assignee.as_deref(), Some(winner.as_str()));
                assert!(current.has(Label::InProgress));
            }
            None => assert!(current.assignee.is_none()),
        }
    }
}

#[test]
fn late_claimant_yields_to_the_holder() {
    let store = MemoryStore::new(MemoryOptions {
        conditional: false,
        ..MemoryOptions::default()
    });
    let item = store
        .session("setup")
        .create_item("Add lexer", "", &[Label::Task])
        .unwrap();
    let policy = ClaimPolicy {
        settle: Duration::from_millis(5),
        label_retries: 3,
    };

    assert_eq!(
        try_claim(&store.session("w9"), item, "w9", &policy).unwrap(),
        ClaimOutcome::Claimed
    );
    // A smaller identity arriving after the claim settled does not take over.
    assert_eq!(
        try_claim(&store.session("w0"), item, "w0", &policy).unwrap(),
        ClaimOutcome::AlreadyClaimed
    );
    assert!(store.items()[0].is_claimed_by("w9"));
}

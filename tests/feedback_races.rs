use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use peerloop::protocol::feedback::{FeedbackOutcome, record_failure};
use peerloop::store::memory::{MemoryOptions, MemoryStore};
use peerloop::store::{Label, WorkStore};

#[test]
fn simultaneous_failure_reports_leave_one_open_item() {
    for round in 0..3 {
        let store = MemoryStore::new(MemoryOptions {
            visibility_lag: Duration::from_millis(10),
            seed: round,
            ..MemoryOptions::eventual(Duration::from_millis(10))
        });
        // An unrelated item that is already readable everywhere.
        store
            .session("setup")
            .create_item("Add lexer", "", &[Label::Task])
            .unwrap();
        thread::sleep(Duration::from_millis(30));

        let workers = 6;
        let barrier = Arc::new(Barrier::new(workers));
        let handles: Vec<_> = (0..workers)
            .map(|n| {
                let session = store.session(&format!("w{n}"));
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let me = session.identity().to_string();
                    barrier.wait();
                    record_failure(
                        &session,
                        &me,
                        "test X failed after 120ms",
                        Some(1),
                        Duration::from_millis(60),
                    )
                    .unwrap()
                })
            })
            .collect();
        let outcomes: Vec<FeedbackOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let open: Vec<_> = store
            .items()
            .into_iter()
            .filter(|i| i.has(Label::Failing) && !i.has(Label::Done))
            .map(|i| i.id)
            .collect();
        assert_eq!(open.len(), 1, "round {round}: open failing items {open:?}");

        let filed: Vec<_> = outcomes
            .iter()
            .filter_map(|o| match o {
                FeedbackOutcome::Filed(id) => Some(*id),
                FeedbackOutcome::Duplicate(_) => None,
            })
            .collect();
        assert_eq!(filed, open, "round {round}: outcomes {outcomes:?}");
    }
}

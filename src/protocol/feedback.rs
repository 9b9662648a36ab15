//! Feedback loop: validation failures become `task,failing` items.
//!
//! Dedup is by failure signature, not transactional. Two workers filing the
//! same failure at once both create an item; each then re-scans and the one
//! holding the higher id retires its own copy.

use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::store::{ChangeId, ItemId, Label, LabelFilter, StoreError, WorkItem, WorkStore};

pub const SIGNATURE_MARKER: &str = "peerloop:signature";

/// Failure output kept in the item body.
const MAX_DETAILS: usize = 4000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "outcome", content = "item")]
pub enum FeedbackOutcome {
    /// A new failing item was filed.
    Filed(ItemId),
    /// An open item already tracks this signature.
    Duplicate(ItemId),
}

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid ansi pattern"))
}

fn hex_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:0x)?[0-9a-fA-F]{7,}\b").expect("valid hex pattern"))
}

fn digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("valid digit pattern"))
}

/// Strip the parts of failure output that vary between identical failures:
/// colour codes, hashes and addresses, counts and durations, spacing.
pub fn normalize_failure(output: &str) -> String {
    let text = ansi_re().replace_all(output, "");
    let text = hex_re().replace_all(&text, "#");
    let text = digits_re().replace_all(&text, "0");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First 12 hex chars of the SHA-256 of the normalised output.
pub fn failure_signature(output: &str) -> String {
    let digest = Sha256::digest(normalize_failure(output).as_bytes());
    let mut hex = format!("{digest:x}");
    hex.truncate(12);
    hex
}

/// Signature recorded in an item body, if any.
pub fn signature_of(body: &str) -> Option<&str> {
    body.lines()
        .find_map(|line| line.trim().strip_prefix(SIGNATURE_MARKER))
        .map(str::trim)
        .filter(|sig| !sig.is_empty())
}

fn failure_title(details: &str) -> String {
    let first = details
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("validation failed");
    let first: String = first.chars().take(72).collect();
    format!("Fix failing validation: {first}")
}

fn tail(details: &str) -> &str {
    if details.len() <= MAX_DETAILS {
        return details;
    }
    let mut start = details.len() - MAX_DETAILS;
    while !details.is_char_boundary(start) {
        start += 1;
    }
    &details[start..]
}

fn failure_body(signature: &str, details: &str, merged: Option<ChangeId>) -> String {
    let mut body = String::from("Validation fails on the integration branch.\n\n");
    if let Some(change) = merged {
        body.push_str(&format!("First seen after merging change #{change}.\n\n"));
    }
    body.push_str("```\n");
    body.push_str(tail(details).trim_end());
    body.push_str("\n```\n\n");
    body.push_str("- [ ] validation passes again\n\n");
    body.push_str(&format!("{SIGNATURE_MARKER} {signature}\n"));
    body
}

fn open_with_signature<S: WorkStore + ?Sized>(
    store: &S,
    signature: &str,
) -> Result<Vec<WorkItem>, StoreError> {
    let mut items: Vec<WorkItem> = store
        .list_items(&LabelFilter::new().with(Label::Failing).without(Label::Done))?
        .into_iter()
        .filter(|item| signature_of(&item.body) == Some(signature))
        .collect();
    items.sort_by_key(|item| item.id);
    Ok(items)
}

/// File a failing item for `details` unless its signature is already open.
///
/// `settle` is waited before the convergence re-scan so that concurrent
/// filings from other workers are visible.
pub fn record_failure<S: WorkStore + ?Sized>(
    store: &S,
    worker: &str,
    details: &str,
    merged: Option<ChangeId>,
    settle: Duration,
) -> Result<FeedbackOutcome, StoreError> {
    let signature = failure_signature(details);
    if let Some(existing) = open_with_signature(store, &signature)?.first() {
        tracing::debug!(item = existing.id, signature, "failure already tracked");
        return Ok(FeedbackOutcome::Duplicate(existing.id));
    }

    let id = store.create_item(
        &failure_title(details),
        &failure_body(&signature, details, merged),
        &[Label::Task, Label::Failing],
    )?;
    tracing::info!(item = id, signature, merged = ?merged, "filed failing item");

    thread::sleep(settle);
    let lowest = open_with_signature(store, &signature)?
        .first()
        .map_or(id, |item| item.id);
    if lowest < id {
        store.update_item_labels(id, &[Label::Done], &[Label::Task, Label::Failing], None)?;
        store.append_comment(id, worker, &format!("Duplicate of #{lowest}."))?;
        tracing::info!(item = id, duplicate_of = lowest, "retired duplicate failing item");
        return Ok(FeedbackOutcome::Duplicate(lowest));
    }
    Ok(FeedbackOutcome::Filed(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryOptions, MemoryStore};

    #[test]
    fn signature_ignores_volatile_details() {
        let a = "\x1b[31mtest X failed\x1b[0m after 120ms at 0xdeadbeef01";
        let b = "test X failed   after 98ms at 0x00c0ffee99";
        assert_eq!(failure_signature(a), failure_signature(b));
        assert_ne!(failure_signature(a), failure_signature("test Y failed"));
        assert_eq!(failure_signature(a).len(), 12);
    }

    #[test]
    fn signature_round_trips_through_body() {
        let body = failure_body("abc123def456", "test X failed", Some(4));
        assert_eq!(signature_of(&body), Some("abc123def456"));
        assert!(body.contains("change #4"));
        assert_eq!(signature_of("no marker here"), None);
    }

    #[test]
    fn long_output_keeps_the_tail() {
        let details = format!("{}END", "é".repeat(5000));
        let kept = tail(&details);
        assert!(kept.len() <= MAX_DETAILS);
        assert!(kept.ends_with("END"));
    }

    #[test]
    fn same_failure_is_filed_once() {
        let store = MemoryStore::new(MemoryOptions::default());
        let s = store.session("w1");

        let first = record_failure(&s, "w1", "test X failed", Some(3), Duration::ZERO).unwrap();
        let FeedbackOutcome::Filed(id) = first else {
            panic!("expected a new item, got {first:?}");
        };
        let second = record_failure(&s, "w2", "test X failed", Some(5), Duration::ZERO).unwrap();
        assert_eq!(second, FeedbackOutcome::Duplicate(id));

        let failing = s
            .list_items(&LabelFilter::new().with(Label::Failing))
            .unwrap();
        assert_eq!(failing.len(), 1);
        assert!(failing[0].has(Label::Task));
        assert!(failing[0].title.contains("test X failed"));
    }

    #[test]
    fn fixed_failure_can_be_filed_again() {
        let store = MemoryStore::new(MemoryOptions::default());
        let s = store.session("w1");
        let FeedbackOutcome::Filed(id) =
            record_failure(&s, "w1", "test X failed", None, Duration::ZERO).unwrap()
        else {
            panic!("expected a new item");
        };
        s.update_item_labels(id, &[Label::Done], &[], None).unwrap();

        let again = record_failure(&s, "w1", "test X failed", None, Duration::ZERO).unwrap();
        assert!(matches!(again, FeedbackOutcome::Filed(new) if new != id));
    }

    #[test]
    fn higher_duplicate_retires_itself() {
        let store = MemoryStore::new(MemoryOptions {
            visibility_lag: Duration::from_millis(40),
            ..MemoryOptions::default()
        });
        let other = store.session("w2");
        let s = store.session("w1");
        let signature = failure_signature("test X failed");
        // Filed concurrently by another worker; not yet visible to w1.
        let earlier = other
            .create_item(
                "Fix failing validation: test X failed",
                &failure_body(&signature, "test X failed", None),
                &[Label::Task, Label::Failing],
            )
            .unwrap();

        let outcome =
            record_failure(&s, "w1", "test X failed", None, Duration::from_millis(80)).unwrap();
        assert_eq!(outcome, FeedbackOutcome::Duplicate(earlier));

        let still_failing: Vec<_> = store
            .items()
            .into_iter()
            .filter(|item| item.has(Label::Failing))
            .collect();
        assert_eq!(still_failing.len(), 1);
        assert_eq!(still_failing[0].id, earlier);
    }
}

//! Bootstrap: initial decomposition when the store holds no task items.
//!
//! There is no election. Workers that bootstrap at the same moment may each
//! file the plan; duplicates are implemented independently and the later
//! change is closed as redundant at review.

use crate::agent::Agent;
use crate::store::{ItemDraft, ItemId, Label, LabelFilter, StoreError, WorkItem, WorkStore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanReport {
    pub created: Vec<ItemId>,
    /// Drafts whose title was already tracked when this worker looked.
    pub skipped: usize,
    pub failed: usize,
}

pub fn needs_bootstrap<S: WorkStore + ?Sized>(store: &S) -> Result<bool, StoreError> {
    Ok(store.list_items(&LabelFilter::new().with(Label::Task))?.is_empty())
}

/// Give a draft a checklist if the agent left it without one.
pub fn normalize_draft(draft: &ItemDraft) -> Option<ItemDraft> {
    let title = draft.title.trim();
    if title.is_empty() {
        return None;
    }
    let mut body = draft.body.trim().to_string();
    if !body.lines().any(|l| l.trim_start().starts_with("- [")) {
        if !body.is_empty() {
            body.push_str("\n\n");
        }
        body.push_str(&format!("- [ ] {title}"));
    }
    Some(ItemDraft {
        title: title.to_string(),
        body,
    })
}

/// File drafts as `task` items. A failed creation is logged and skipped so
/// the remaining drafts still land.
pub fn file_drafts<S: WorkStore + ?Sized>(
    store: &S,
    drafts: &[ItemDraft],
    existing: &[WorkItem],
) -> PlanReport {
    let mut report = PlanReport::default();
    let mut titles: Vec<String> = existing.iter().map(|i| i.title.to_lowercase()).collect();
    for draft in drafts.iter().filter_map(normalize_draft) {
        let key = draft.title.to_lowercase();
        if titles.contains(&key) {
            report.skipped += 1;
            continue;
        }
        match store.create_item(&draft.title, &draft.body, &[Label::Task]) {
            Ok(id) => {
                tracing::info!(item = id, title = %draft.title, "filed task");
                report.created.push(id);
                titles.push(key);
            }
            Err(e) => {
                tracing::warn!(title = %draft.title, error = %e, "could not file task");
                report.failed += 1;
            }
        }
    }
    report
}

/// Decompose `goal` into task items.
pub fn bootstrap<S: WorkStore + ?Sized, A: Agent + ?Sized>(
    store: &S,
    agent: &A,
    goal: &str,
) -> anyhow::Result<PlanReport> {
    let existing = store.list_items(&LabelFilter::new())?;
    let drafts = agent.plan(goal, &existing)?;
    let report = file_drafts(store, &drafts, &existing);
    tracing::info!(
        created = report.created.len(),
        skipped = report.skipped,
        failed = report.failed,
        "bootstrap finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryOptions, MemoryStore};

    fn draft(title: &str, body: &str) -> ItemDraft {
        ItemDraft {
            title: title.into(),
            body: body.into(),
        }
    }

    #[test]
    fn draft_without_checklist_gets_one() {
        let d = normalize_draft(&draft("Add parser", "Parse the headers.")).unwrap();
        assert_eq!(d.body, "Parse the headers.\n\n- [ ] Add parser");
        let kept = normalize_draft(&draft("Add parser", "- [ ] parses")).unwrap();
        assert_eq!(kept.body, "- [ ] parses");
        assert!(normalize_draft(&draft("  ", "x")).is_none());
    }

    #[test]
    fn empty_store_needs_bootstrap() {
        let store = MemoryStore::new(MemoryOptions::default());
        let s = store.session("w1");
        assert!(needs_bootstrap(&s).unwrap());
        s.create_item("Add parser", "", &[Label::Task]).unwrap();
        assert!(!needs_bootstrap(&s).unwrap());
    }

    #[test]
    fn known_titles_are_skipped_and_failures_counted() {
        let store = MemoryStore::new(MemoryOptions::default());
        let s = store.session("w1");
        let existing_id = s.create_item("Add parser", "", &[Label::Task]).unwrap();
        let existing = vec![s.get_item(existing_id).unwrap()];

        let report = file_drafts(
            &s,
            &[draft("add PARSER", ""), draft("Add CLI", ""), draft("Add CLI", "")],
            &existing,
        );
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.skipped, 2);

        store.fail_next(1);
        let report = file_drafts(&s, &[draft("Add docs", "")], &[]);
        assert_eq!(report.failed, 1);
        assert!(report.created.is_empty());
    }
}

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use serde::Serialize;

use crate::protocol::progress::find_stale;
use crate::protocol::{GateStatus, MergePolicy, evaluate_gate};
use crate::store::{Change, ChangeId, ItemId, Label, LabelFilter, WorkItem, WorkStore};

use super::{OutputFormat, Project};

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub project: String,
    pub items: LabelCounts,
    pub claimed: Vec<ClaimSummary>,
    pub changes: Vec<ChangeSummary>,
    /// Abandoned or never-finished claims older than the stale threshold.
    pub stale_items: Vec<ItemId>,
    pub stale_changes: Vec<ChangeId>,
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct LabelCounts {
    pub task: usize,
    pub in_progress: usize,
    pub review: usize,
    pub blocked: usize,
    pub done: usize,
    pub failing: usize,
}

#[derive(Debug, Serialize)]
pub struct ClaimSummary {
    pub item: ItemId,
    pub title: String,
    pub assignee: String,
}

#[derive(Debug, Serialize)]
pub struct ChangeSummary {
    pub change: ChangeId,
    pub closes: ItemId,
    pub author: String,
    pub gate: GateStatus,
    pub approvals: usize,
    pub required: usize,
}

impl LabelCounts {
    fn tally(items: &[WorkItem]) -> Self {
        let mut counts = Self::default();
        for item in items {
            for label in &item.labels {
                match label {
                    Label::Task => counts.task += 1,
                    Label::InProgress => counts.in_progress += 1,
                    Label::Review => counts.review += 1,
                    Label::Blocked => counts.blocked += 1,
                    Label::Done => counts.done += 1,
                    Label::Failing => counts.failing += 1,
                }
            }
        }
        counts
    }
}

/// Summarise what the store shows right now.
pub fn build_report<S: WorkStore + ?Sized>(
    store: &S,
    project: &str,
    policy: &MergePolicy,
    stale_after: Duration,
) -> anyhow::Result<StatusReport> {
    let items = store.list_items(&LabelFilter::new())?;
    let claimed = items
        .iter()
        .filter(|i| i.is_claimed() && !i.has(Label::Done))
        .map(|i| ClaimSummary {
            item: i.id,
            title: i.title.clone(),
            assignee: i.assignee.clone().unwrap_or_default(),
        })
        .collect();
    let changes = store
        .list_changes(&LabelFilter::new())?
        .iter()
        .map(|c: &Change| {
            let decision = evaluate_gate(c, policy);
            ChangeSummary {
                change: c.id,
                closes: c.closes,
                author: c.author.clone(),
                gate: decision.status,
                approvals: decision.approved_by.len(),
                required: decision.required,
            }
        })
        .collect();
    let (stale_items, stale_changes) = find_stale(store, stale_after)?;
    Ok(StatusReport {
        project: project.to_string(),
        items: LabelCounts::tally(&items),
        claimed,
        changes,
        stale_items,
        stale_changes,
    })
}

impl StatusArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let format = OutputFormat::resolve(self.format);
        let project = Project::load(self.project_root.as_deref())?;
        let store = project.open_store()?;
        let report = build_report(
            &store,
            &project.config.project.name,
            &project.config.merge_policy(),
            project.config.progress_policy().stale_after,
        )?;

        match format {
            OutputFormat::Pretty => print_pretty(&report),
            OutputFormat::Text => print_text(&report),
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        }
        Ok(())
    }
}

fn print_pretty(report: &StatusReport) {
    let c = &report.items;
    println!("=== {} ===\n", report.project);
    println!(
        "Items: {} task, {} in progress, {} in review, {} blocked, {} done, {} failing",
        c.task, c.in_progress, c.review, c.blocked, c.done, c.failing
    );

    println!("\nClaimed:");
    if report.claimed.is_empty() {
        println!("  (none)");
    }
    for claim in &report.claimed {
        println!("  #{} {} ({})", claim.item, claim.title, claim.assignee);
    }

    println!("\nOpen changes:");
    if report.changes.is_empty() {
        println!("  (none)");
    }
    for change in &report.changes {
        println!(
            "  #{} closes #{} by {}: {} ({}/{})",
            change.change,
            change.closes,
            change.author,
            change.gate.as_str(),
            change.approvals,
            change.required
        );
    }

    if !report.stale_items.is_empty() || !report.stale_changes.is_empty() {
        println!("\nStale:");
        for item in &report.stale_items {
            println!("  item #{item} (release with `peerloop protocol unblock {item}`)");
        }
        for change in &report.stale_changes {
            println!("  change #{change} is waiting for review");
        }
    }
}

fn print_text(report: &StatusReport) {
    let c = &report.items;
    println!("peerloop-status  project={}", report.project);
    println!(
        "items  task={}  in-progress={}  review={}  blocked={}  done={}  failing={}",
        c.task, c.in_progress, c.review, c.blocked, c.done, c.failing
    );
    for claim in &report.claimed {
        println!("claimed  item={}  assignee={}", claim.item, claim.assignee);
    }
    for change in &report.changes {
        println!(
            "change  id={}  closes={}  author={}  gate={}  approvals={}  required={}",
            change.change,
            change.closes,
            change.author,
            change.gate.as_str(),
            change.approvals,
            change.required
        );
    }
    for item in &report.stale_items {
        println!("stale  item={item}");
    }
    for change in &report.stale_changes {
        println!("stale  change={change}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Verdict;
    use crate::store::memory::{MemoryOptions, MemoryStore};

    #[test]
    fn report_counts_labels_claims_and_gates() {
        let store = MemoryStore::new(MemoryOptions::default());
        let s = store.session("w1");
        s.create_item("Add CLI", "", &[Label::Task]).unwrap();
        let claimed = s.create_item("Add parser", "", &[Label::Task, Label::InProgress]).unwrap();
        s.assign_item(claimed, Some("w1"), None).unwrap();
        let reviewed = s.create_item("Add docs", "", &[Label::Task, Label::Review]).unwrap();
        let change = s.create_change("peerloop/3-add-docs", "Add docs", "", reviewed).unwrap();
        store.session("w2").add_review(change, "w2", Verdict::Approve, "").unwrap();

        let report = build_report(&s, "demo", &MergePolicy { quorum: 2 }, Duration::from_secs(3600)).unwrap();
        assert_eq!(
            report.items,
            LabelCounts {
                task: 3,
                in_progress: 1,
                review: 1,
                ..LabelCounts::default()
            }
        );
        assert_eq!(report.claimed.len(), 1);
        assert_eq!(report.claimed[0].assignee, "w1");
        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.changes[0].gate, GateStatus::NeedsReview);
        assert_eq!(report.changes[0].approvals, 1);
        assert!(report.stale_items.is_empty());
    }

    #[test]
    fn report_lists_claims_that_never_finished() {
        let store = MemoryStore::new(MemoryOptions {
            conditional: false,
            ..MemoryOptions::default()
        });
        let s = store.session("w1");
        let item = s.create_item("Add lexer", "", &[Label::Task]).unwrap();
        s.append_comment(item, "w-dead", "peerloop:claim w-dead").unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let report = build_report(&s, "demo", &MergePolicy { quorum: 1 }, Duration::ZERO).unwrap();
        assert!(report.claimed.is_empty());
        assert_eq!(report.stale_items, vec![item]);
    }
}

use serde::Serialize;

use crate::agent::Validation;
use crate::commands::OutputFormat;
use crate::protocol::feedback::FeedbackOutcome;
use crate::protocol::{ClaimOutcome, GateDecision, MergeOutcome};
use crate::store::{ChangeId, ItemId, MergeState};

/// A command result printable in every output format.
pub trait Render: Serialize {
    fn pretty(&self) -> String;
    /// One `key=value` record per line.
    fn text(&self) -> String;
}

pub fn emit<R: Render>(report: &R, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Pretty => println!("{}", report.pretty()),
        OutputFormat::Text => println!("{}", report.text()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

fn claim_word(outcome: ClaimOutcome) -> &'static str {
    match outcome {
        ClaimOutcome::Claimed => "claimed",
        ClaimOutcome::AlreadyClaimed => "already-claimed",
        ClaimOutcome::NotFound => "not-found",
    }
}

fn merge_word(outcome: MergeOutcome) -> &'static str {
    match outcome {
        MergeOutcome::Merged => "merged",
        MergeOutcome::NotReady => "not-ready",
        MergeOutcome::Conflict => "conflict",
    }
}

fn state_word(state: MergeState) -> &'static str {
    match state {
        MergeState::Open => "open",
        MergeState::Approved => "approved",
        MergeState::Merged => "merged",
        MergeState::Closed => "closed",
    }
}

fn feedback_line(feedback: Option<&FeedbackOutcome>) -> Option<String> {
    feedback.map(|f| match f {
        FeedbackOutcome::Filed(id) => format!("filed failing task #{id}"),
        FeedbackOutcome::Duplicate(id) => format!("already tracked by #{id}"),
    })
}

fn list(names: &[String]) -> String {
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(",")
    }
}

#[derive(Debug, Serialize)]
pub struct ClaimReport {
    pub item: ItemId,
    pub worker: String,
    pub outcome: ClaimOutcome,
}

impl ClaimReport {
    pub fn claimed(&self) -> bool {
        self.outcome == ClaimOutcome::Claimed
    }
}

impl Render for ClaimReport {
    fn pretty(&self) -> String {
        match self.outcome {
            ClaimOutcome::Claimed => format!("Item #{} claimed by {}.", self.item, self.worker),
            ClaimOutcome::AlreadyClaimed => format!("Item #{} is taken or not claimable.", self.item),
            ClaimOutcome::NotFound => format!("Item #{} does not exist.", self.item),
        }
    }

    fn text(&self) -> String {
        format!(
            "claim  item={}  worker={}  outcome={}",
            self.item,
            self.worker,
            claim_word(self.outcome)
        )
    }
}

#[derive(Debug, Serialize)]
pub struct GateReport {
    pub change: ChangeId,
    pub state: MergeState,
    pub decision: GateDecision,
}

impl Render for GateReport {
    fn pretty(&self) -> String {
        let d = &self.decision;
        let mut out = format!(
            "Change #{} ({}): {}\n  approvals: {}/{}",
            self.change,
            state_word(self.state),
            d.status.as_str(),
            d.approved_by.len(),
            d.required
        );
        if !d.approved_by.is_empty() {
            out.push_str(&format!(" ({})", d.approved_by.join(", ")));
        }
        if !d.blocked_by.is_empty() {
            out.push_str(&format!("\n  changes requested by: {}", d.blocked_by.join(", ")));
        }
        out
    }

    fn text(&self) -> String {
        let d = &self.decision;
        format!(
            "gate  change={}  state={}  status={}  approvals={}  required={}  approved-by={}  blocked-by={}",
            self.change,
            state_word(self.state),
            d.status.as_str(),
            d.approved_by.len(),
            d.required,
            list(&d.approved_by),
            list(&d.blocked_by)
        )
    }
}

#[derive(Debug, Serialize)]
pub struct MergeReport {
    pub change: ChangeId,
    pub outcome: MergeOutcome,
    pub gate: GateDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<Validation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackOutcome>,
}

impl Render for MergeReport {
    fn pretty(&self) -> String {
        let mut out = match self.outcome {
            MergeOutcome::Merged => format!("Change #{} merged.", self.change),
            MergeOutcome::NotReady => format!(
                "Change #{} is not ready: {} ({}/{} approvals).",
                self.change,
                self.gate.status.as_str(),
                self.gate.approved_by.len(),
                self.gate.required
            ),
            MergeOutcome::Conflict => format!(
                "Change #{} no longer merges cleanly; the author needs to integrate the base branch.",
                self.change
            ),
        };
        match &self.validation {
            Some(Validation::Pass) => out.push_str("\nValidation passes."),
            Some(Validation::Fail { .. }) => out.push_str("\nValidation fails after merge."),
            None => {}
        }
        if let Some(line) = feedback_line(self.feedback.as_ref()) {
            out.push_str(&format!("\n{line}"));
        }
        out
    }

    fn text(&self) -> String {
        let mut out = format!(
            "merge  change={}  outcome={}  gate={}",
            self.change,
            merge_word(self.outcome),
            self.gate.status.as_str()
        );
        if let Some(validation) = &self.validation {
            out.push_str(&format!(
                "\nvalidation  result={}",
                if validation.passed() { "pass" } else { "fail" }
            ));
        }
        if let Some(feedback) = &self.feedback {
            out.push_str(&format!("\n{}", feedback_text(feedback)));
        }
        out
    }
}

fn feedback_text(feedback: &FeedbackOutcome) -> String {
    match feedback {
        FeedbackOutcome::Filed(id) => format!("feedback  filed={id}"),
        FeedbackOutcome::Duplicate(id) => format!("feedback  duplicate-of={id}"),
    }
}

#[derive(Debug, Serialize)]
pub struct UnblockReport {
    pub item: ItemId,
    pub previous: Option<String>,
}

impl Render for UnblockReport {
    fn pretty(&self) -> String {
        match &self.previous {
            Some(prev) => format!("Item #{} released (was held by {prev}).", self.item),
            None => format!("Item #{} released.", self.item),
        }
    }

    fn text(&self) -> String {
        format!(
            "unblock  item={}  previous={}",
            self.item,
            self.previous.as_deref().unwrap_or("-")
        )
    }
}

#[derive(Debug, Serialize)]
pub struct ValidateReport {
    pub validation: Validation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackOutcome>,
}

impl Render for ValidateReport {
    fn pretty(&self) -> String {
        let mut out = match &self.validation {
            Validation::Pass => "Validation passes.".to_string(),
            Validation::Fail { details } => format!("Validation fails:\n{details}"),
        };
        if let Some(line) = feedback_line(self.feedback.as_ref()) {
            out.push_str(&format!("\n{line}"));
        }
        out
    }

    fn text(&self) -> String {
        let mut out = format!(
            "validation  result={}",
            if self.validation.passed() { "pass" } else { "fail" }
        );
        if let Some(feedback) = &self.feedback {
            out.push_str(&format!("\n{}", feedback_text(feedback)));
        }
        out
    }
}

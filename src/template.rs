//! Prompt templates for the external agent.

use minijinja::Environment;
use serde::Serialize;

use crate::store::{Change, Review, WorkItem};

const PLAN: &str = include_str!("templates/plan.md.jinja");
const IMPLEMENT: &str = include_str!("templates/implement.md.jinja");
const REVIEW: &str = include_str!("templates/review.md.jinja");
const RESPOND: &str = include_str!("templates/respond.md.jinja");

/// Fields shared by every prompt.
#[derive(Debug, Clone, Serialize)]
pub struct PromptBase {
    pub worker: String,
    pub project: String,
    pub base_branch: String,
    pub check_command: Option<String>,
}

#[derive(Serialize)]
struct PlanContext<'a> {
    #[serde(flatten)]
    base: &'a PromptBase,
    goal: &'a str,
    existing: &'a [WorkItem],
}

#[derive(Serialize)]
struct ImplementContext<'a> {
    #[serde(flatten)]
    base: &'a PromptBase,
    item: &'a WorkItem,
    branch: &'a str,
}

#[derive(Serialize)]
struct ChangeContext<'a> {
    #[serde(flatten)]
    base: &'a PromptBase,
    change: &'a Change,
    item: &'a WorkItem,
    feedback: &'a [Review],
}

pub struct Prompts {
    env: Environment<'static>,
    base: PromptBase,
}

impl Prompts {
    pub fn new(base: PromptBase) -> anyhow::Result<Self> {
        let mut env = Environment::new();
        env.add_template("plan", PLAN)?;
        env.add_template("implement", IMPLEMENT)?;
        env.add_template("review", REVIEW)?;
        env.add_template("respond", RESPOND)?;
        Ok(Self { env, base })
    }

    fn render<C: Serialize>(&self, name: &str, ctx: &C) -> anyhow::Result<String> {
        Ok(self.env.get_template(name)?.render(ctx)?)
    }

    pub fn plan(&self, goal: &str, existing: &[WorkItem]) -> anyhow::Result<String> {
        self.render(
            "plan",
            &PlanContext {
                base: &self.base,
                goal,
                existing,
            },
        )
    }

    pub fn implement(&self, item: &WorkItem, branch: &str) -> anyhow::Result<String> {
        self.render(
            "implement",
            &ImplementContext {
                base: &self.base,
                item,
                branch,
            },
        )
    }

    pub fn review(&self, change: &Change, item: &WorkItem) -> anyhow::Result<String> {
        self.render(
            "review",
            &ChangeContext {
                base: &self.base,
                change,
                item,
                feedback: &[],
            },
        )
    }

    pub fn respond(&self, change: &Change, item: &WorkItem, feedback: &[Review]) -> anyhow::Result<String> {
        self.render(
            "respond",
            &ChangeContext {
                base: &self.base,
                change,
                item,
                feedback,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Utc;

    use super::*;
    use crate::store::{Label, MergeState, Revision, Verdict};

    fn prompts(check: Option<&str>) -> Prompts {
        Prompts::new(PromptBase {
            worker: "w1".into(),
            project: "demo".into(),
            base_branch: "main".into(),
            check_command: check.map(String::from),
        })
        .unwrap()
    }

    fn item() -> WorkItem {
        WorkItem {
            id: 4,
            title: "Add parser".into(),
            body: "- [ ] parses headers".into(),
            labels: [Label::Task, Label::InProgress].into_iter().collect(),
            assignee: Some("w1".into()),
            created_at: Utc::now(),
            revision: Revision(1),
            comments: Vec::new(),
        }
    }

    fn change() -> Change {
        Change {
            id: 9,
            branch: "peerloop/4-add-parser".into(),
            title: "Add parser".into(),
            body: "Adds the parser.".into(),
            author: "w1".into(),
            closes: 4,
            reviews: Vec::new(),
            state: MergeState::Open,
            labels: BTreeSet::new(),
            created_at: Utc::now(),
            last_author_commit_at: Utc::now(),
        }
    }

    #[test]
    fn plan_lists_existing_work() {
        let out = prompts(None).plan("Ship a parser", &[item()]).unwrap();
        assert!(out.contains("Ship a parser"));
        assert!(out.contains("#4 Add parser [task, in-progress]"));
        assert!(out.contains("<item>"));
    }

    #[test]
    fn implement_names_branch_and_optional_check() {
        let out = prompts(Some("cargo test")).implement(&item(), "peerloop/4-add-parser").unwrap();
        assert!(out.contains("`peerloop/4-add-parser`"));
        assert!(out.contains("Run `cargo test`"));
        assert!(out.contains("<promise>COMPLETE</promise>"));

        let out = prompts(None).implement(&item(), "peerloop/4-add-parser").unwrap();
        assert!(!out.contains("Run `"));
    }

    #[test]
    fn review_and_respond_render_change() {
        let p = prompts(None);
        let out = p.review(&change(), &item()).unwrap();
        assert!(out.contains("change #9 by w1"));
        assert!(out.contains("<verdict>redundant</verdict>"));

        let feedback = vec![Review {
            reviewer: "w2".into(),
            verdict: Verdict::RequestChanges,
            comments: "Handle empty input".into(),
            submitted_at: Utc::now(),
        }];
        let out = p.respond(&change(), &item(), &feedback).unwrap();
        assert!(out.contains("### w2"));
        assert!(out.contains("Handle empty input"));
    }
}

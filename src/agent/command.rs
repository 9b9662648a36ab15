use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::error::ExitError;
use crate::store::{Change, ItemDraft, Review, WorkItem};
use crate::subprocess::Tool;
use crate::template::Prompts;

use super::output::{parse_drafts, parse_review, parse_work_outcome};
use super::{Agent, ReviewDecision, Validation, Validator, WorkOutcome};

/// Runs the configured agent command with the rendered prompt as its last
/// argument, inside the project checkout.
pub struct CommandAgent {
    argv: Vec<String>,
    timeout: Duration,
    workdir: PathBuf,
    worker: String,
    prompts: Prompts,
}

impl CommandAgent {
    pub fn new(
        argv: Vec<String>,
        timeout: Duration,
        workdir: PathBuf,
        worker: String,
        prompts: Prompts,
    ) -> anyhow::Result<Self> {
        if argv.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(ExitError::Config("agent.command must name a program".into()).into());
        }
        Ok(Self {
            argv,
            timeout,
            workdir,
            worker,
            prompts,
        })
    }

    fn invoke(&self, phase: &str, prompt: &str, env: &[(&str, String)]) -> anyhow::Result<String> {
        let mut tool = Tool::from_argv(&self.argv)?
            .arg(prompt)
            .env("PEERLOOP_WORKER", &self.worker)
            .env("PEERLOOP_PHASE", phase)
            .current_dir(&self.workdir)
            .timeout(self.timeout);
        for (key, value) in env {
            tool = tool.env(key, value);
        }
        let span = tracing::info_span!("agent", phase, program = tool.program());
        let _guard = span.enter();
        let output = tool.run_ok()?;
        tracing::debug!(bytes = output.stdout.len(), "agent finished");
        Ok(output.stdout)
    }
}

impl Agent for CommandAgent {
    fn plan(&self, goal: &str, existing: &[WorkItem]) -> anyhow::Result<Vec<ItemDraft>> {
        let prompt = self.prompts.plan(goal, existing)?;
        Ok(parse_drafts(&self.invoke("plan", &prompt, &[])?))
    }

    fn implement(&self, item: &WorkItem, branch: &str) -> anyhow::Result<WorkOutcome> {
        let prompt = self.prompts.implement(item, branch)?;
        let out = self.invoke(
            "implement",
            &prompt,
            &[
                ("PEERLOOP_ITEM", item.id.to_string()),
                ("PEERLOOP_BRANCH", branch.to_string()),
            ],
        )?;
        Ok(parse_work_outcome(&out))
    }

    fn review(&self, change: &Change, item: &WorkItem) -> anyhow::Result<ReviewDecision> {
        let prompt = self.prompts.review(change, item)?;
        let out = self.invoke(
            "review",
            &prompt,
            &[
                ("PEERLOOP_ITEM", item.id.to_string()),
                ("PEERLOOP_BRANCH", change.branch.clone()),
                ("PEERLOOP_CHANGE", change.id.to_string()),
            ],
        )?;
        parse_review(&out)
    }

    fn respond(&self, change: &Change, item: &WorkItem, feedback: &[Review]) -> anyhow::Result<WorkOutcome> {
        let prompt = self.prompts.respond(change, item, feedback)?;
        let out = self.invoke(
            "respond",
            &prompt,
            &[
                ("PEERLOOP_ITEM", item.id.to_string()),
                ("PEERLOOP_BRANCH", change.branch.clone()),
                ("PEERLOOP_CHANGE", change.id.to_string()),
            ],
        )?;
        Ok(parse_work_outcome(&out))
    }
}

/// Runs `check_command` through `sh -c` against the integration branch.
///
/// In a git checkout the command runs in a detached worktree of the base
/// branch, fetched from `origin` first when the checkout has that remote.
/// Whatever branch the agent left checked out is never what gets validated.
/// Outside git the command runs in the project directory. Without a
/// command every run passes.
pub struct CommandValidator {
    command: Option<String>,
    workdir: PathBuf,
    base_branch: String,
    timeout: Duration,
}

impl CommandValidator {
    pub fn new(command: Option<String>, workdir: PathBuf, base_branch: &str, timeout: Duration) -> Self {
        Self {
            command: command.filter(|c| !c.trim().is_empty()),
            workdir,
            base_branch: base_branch.to_string(),
            timeout,
        }
    }
}

impl Validator for CommandValidator {
    fn validate(&self) -> anyhow::Result<Validation> {
        let Some(command) = &self.command else {
            return Ok(Validation::Pass);
        };
        let worktree = if is_git_checkout(&self.workdir) {
            Some(Worktree::add(&self.workdir, &self.base_branch, self.timeout)?)
        } else {
            tracing::debug!(workdir = %self.workdir.display(), "not a git checkout, validating in place");
            None
        };
        let dir = worktree.as_ref().map_or(self.workdir.as_path(), |w| w.path.as_path());

        let result = Tool::new("sh")
            .args(&["-c", command.as_str()])
            .current_dir(dir)
            .timeout(self.timeout)
            .run();
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                if let Some(ExitError::Timeout { timeout_secs, .. }) = e.downcast_ref::<ExitError>() {
                    return Ok(Validation::Fail {
                        details: format!("`{command}` timed out after {timeout_secs}s"),
                    });
                }
                return Err(e);
            }
        };
        let commit = worktree.as_ref().map(|w| w.commit.as_str());
        if output.success() {
            tracing::debug!(command, commit, "validation passed");
            Ok(Validation::Pass)
        } else {
            tracing::info!(command, commit, exit_code = output.exit_code, "validation failed");
            Ok(Validation::Fail {
                details: output.combined(),
            })
        }
    }
}

const REMOTE: &str = "origin";

fn git(repo: &Path, timeout: Duration) -> Tool {
    Tool::new("git").current_dir(repo).timeout(timeout)
}

fn is_git_checkout(dir: &Path) -> bool {
    Tool::new("git")
        .args(&["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .run()
        .is_ok_and(|out| out.success() && out.stdout.trim() == "true")
}

/// Detached checkout of the base branch, removed again on drop.
struct Worktree {
    repo: PathBuf,
    path: PathBuf,
    commit: String,
    timeout: Duration,
    _scratch: tempfile::TempDir,
}

impl Worktree {
    fn add(repo: &Path, base_branch: &str, timeout: Duration) -> anyhow::Result<Self> {
        let has_remote = git(repo, timeout)
            .args(&["remote", "get-url", REMOTE])
            .run()?
            .success();
        let target = if has_remote {
            let tracking = format!("refs/remotes/{REMOTE}/{base_branch}");
            git(repo, timeout)
                .args(&["fetch", "--quiet", REMOTE])
                .arg(&format!("+refs/heads/{base_branch}:{tracking}"))
                .run_ok()
                .with_context(|| format!("fetching {REMOTE}/{base_branch}"))?;
            tracking
        } else {
            format!("refs/heads/{base_branch}")
        };
        let commit = git(repo, timeout)
            .args(&["rev-parse", "--verify", "--quiet"])
            .arg(&format!("{target}^{{commit}}"))
            .run_ok()
            .with_context(|| format!("base branch `{base_branch}` not found"))?
            .stdout
            .trim()
            .to_string();

        let scratch = tempfile::Builder::new()
            .prefix("peerloop-validate-")
            .tempdir()
            .context("creating a directory for the validation worktree")?;
        let path = scratch.path().join("tree");
        git(repo, timeout)
            .args(&["worktree", "add", "--detach", "--quiet"])
            .arg(&path.to_string_lossy())
            .arg(&commit)
            .run_ok()
            .context("checking out the base branch for validation")?;
        tracing::debug!(path = %path.display(), commit, "validation worktree added");
        Ok(Self {
            repo: repo.to_path_buf(),
            path,
            commit,
            timeout,
            _scratch: scratch,
        })
    }
}

impl Drop for Worktree {
    fn drop(&mut self) {
        let removed = git(&self.repo, self.timeout)
            .args(&["worktree", "remove", "--force"])
            .arg(&self.path.to_string_lossy())
            .run_ok();
        if let Err(e) = removed {
            tracing::warn!(path = %self.path.display(), error = %e, "could not remove validation worktree");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::PromptBase;

    fn prompts() -> Prompts {
        Prompts::new(PromptBase {
            worker: "w1".into(),
            project: "demo".into(),
            base_branch: "main".into(),
            check_command: None,
        })
        .unwrap()
    }

    fn item() -> WorkItem {
        WorkItem {
            id: 4,
            title: "Add parser".into(),
            body: "- [ ] parses headers".into(),
            labels: std::collections::BTreeSet::new(),
            assignee: None,
            created_at: chrono::Utc::now(),
            revision: crate::store::Revision(1),
            comments: Vec::new(),
        }
    }

    fn sh_agent(script: &str) -> CommandAgent {
        let dir = std::env::temp_dir();
        CommandAgent::new(
            vec!["sh".into(), "-c".into(), script.into(), "agent".into()],
            Duration::from_secs(10),
            dir,
            "w1".into(),
            prompts(),
        )
        .unwrap()
    }

    #[test]
    fn empty_command_is_a_config_error() {
        let err = CommandAgent::new(
            Vec::new(),
            Duration::from_secs(1),
            std::env::temp_dir(),
            "w1".into(),
            prompts(),
        )
        .err()
        .unwrap();
        assert!(matches!(err.downcast_ref::<ExitError>(), Some(ExitError::Config(_))));
    }

    #[test]
    fn implement_passes_item_context_through_env() {
        let agent = sh_agent(
            r#"echo "<summary>$PEERLOOP_WORKER on $PEERLOOP_ITEM at $PEERLOOP_BRANCH</summary><promise>COMPLETE</promise>""#,
        );
        let outcome = agent.implement(&item(), "peerloop/4-add-parser").unwrap();
        assert_eq!(
            outcome,
            WorkOutcome::Completed {
                summary: "w1 on 4 at peerloop/4-add-parser".into()
            }
        );
    }

    #[test]
    fn prompt_is_the_last_argument() {
        // With `sh -c script name`, the prompt lands in $1.
        let agent = sh_agent(r#"case "$1" in *"Add parser"*) echo "<promise>COMPLETE</promise>";; esac"#);
        assert!(matches!(
            agent.implement(&item(), "peerloop/4-add-parser").unwrap(),
            WorkOutcome::Completed { .. }
        ));
    }

    #[test]
    fn failing_agent_is_an_error() {
        let agent = sh_agent("exit 3");
        assert!(agent.implement(&item(), "peerloop/4-add-parser").is_err());
    }

    #[test]
    fn plan_parses_items() {
        let agent = sh_agent(r#"echo "<item><title>Add CLI</title><body>- [ ] runs</body></item>""#);
        let drafts = agent.plan("Ship it", &[]).unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].title, "Add CLI");
    }

    #[test]
    fn validator_reports_pass_and_fail() {
        let dir = tempfile::tempdir().unwrap();
        let pass = CommandValidator::new(Some("true".into()), dir.path().into(), "main", Duration::from_secs(5));
        assert_eq!(pass.validate().unwrap(), Validation::Pass);

        let fail = CommandValidator::new(
            Some("echo 'test X failed'; exit 1".into()),
            dir.path().into(),
            "main",
            Duration::from_secs(5),
        );
        assert_eq!(
            fail.validate().unwrap(),
            Validation::Fail {
                details: "test X failed".into()
            }
        );

        let none = CommandValidator::new(None, dir.path().into(), "main", Duration::from_secs(5));
        assert!(none.validate().unwrap().passed());
    }

    #[test]
    fn validator_timeout_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let slow = CommandValidator::new(Some("sleep 5".into()), dir.path().into(), "main", Duration::from_millis(100));
        assert!(matches!(slow.validate().unwrap(), Validation::Fail { .. }));
    }

    fn git_in(dir: &Path, args: &[&str]) -> String {
        Tool::new("git")
            .args(&["-c", "user.name=peerloop", "-c", "user.email=peerloop@example.com"])
            .args(args)
            .current_dir(dir)
            .run_ok()
            .unwrap()
            .stdout
            .trim()
            .to_string()
    }

    fn commit_file(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), name).unwrap();
        git_in(dir, &["add", name]);
        git_in(dir, &["commit", "--quiet", "-m", name]);
    }

    /// Repository on `main` with one commit, then switched to a feature
    /// branch holding a commit and an uncommitted file of its own.
    fn checkout_on_feature_branch(dir: &Path) {
        git_in(dir, &["init", "--quiet"]);
        git_in(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        commit_file(dir, "base.txt");
        git_in(dir, &["checkout", "--quiet", "-b", "peerloop/1-add-lexer"]);
        commit_file(dir, "feature.txt");
        std::fs::write(dir.join("dirty.txt"), "wip").unwrap();
    }

    #[test]
    fn validator_checks_the_base_branch_not_the_checked_out_one() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path();
        checkout_on_feature_branch(repo);

        let check = "test -e base.txt && test ! -e feature.txt && test ! -e dirty.txt";
        let validator = CommandValidator::new(Some(check.into()), repo.into(), "main", Duration::from_secs(10));
        assert_eq!(validator.validate().unwrap(), Validation::Pass);

        // The agent's checkout is untouched and the worktree is gone again.
        assert_eq!(git_in(repo, &["rev-parse", "--abbrev-ref", "HEAD"]), "peerloop/1-add-lexer");
        assert!(repo.join("dirty.txt").exists());
        let worktrees = git_in(repo, &["worktree", "list", "--porcelain"]);
        assert_eq!(worktrees.lines().filter(|l| l.starts_with("worktree ")).count(), 1);
    }

    #[test]
    fn validator_fetches_the_base_branch_from_origin() {
        let dir = tempfile::tempdir().unwrap();
        let origin = dir.path().join("origin.git");
        let repo = dir.path().join("work");
        std::fs::create_dir_all(&origin).unwrap();
        std::fs::create_dir_all(&repo).unwrap();
        git_in(&origin, &["init", "--quiet", "--bare"]);
        checkout_on_feature_branch(&repo);
        git_in(&repo, &["remote", "add", "origin", &origin.to_string_lossy()]);

        // Someone else's merge lands on origin's main after our branch point.
        git_in(&repo, &["checkout", "--quiet", "-b", "upstream", "main"]);
        commit_file(&repo, "merged.txt");
        git_in(&repo, &["push", "--quiet", "origin", "upstream:main"]);
        git_in(&repo, &["checkout", "--quiet", "peerloop/1-add-lexer"]);

        let check = "test -e merged.txt && test ! -e feature.txt";
        let validator = CommandValidator::new(Some(check.into()), repo.clone(), "main", Duration::from_secs(10));
        assert_eq!(validator.validate().unwrap(), Validation::Pass);
    }

    #[test]
    fn missing_base_branch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        checkout_on_feature_branch(dir.path());
        let validator = CommandValidator::new(Some("true".into()), dir.path().into(), "trunk", Duration::from_secs(10));
        let err = validator.validate().unwrap_err();
        assert!(format!("{err:#}").contains("trunk"));
    }
}

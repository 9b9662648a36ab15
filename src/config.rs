use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;
use crate::protocol::progress::ProgressPolicy;
use crate::protocol::{ClaimPolicy, MergePolicy};
use crate::store::github::GithubSettings;
use crate::store::retry::RetryPolicy;

/// Config file name constants.
pub const CONFIG_TOML: &str = ".peerloop.toml";
pub const CONFIG_JSON: &str = ".peerloop.json";

/// Find the config file path, preferring .peerloop.toml over .peerloop.json.
/// Returns None if neither exists.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    let toml_path = dir.join(CONFIG_TOML);
    if toml_path.exists() {
        return Some(toml_path);
    }
    let json_path = dir.join(CONFIG_JSON);
    if json_path.exists() {
        return Some(json_path);
    }
    None
}

/// Locate and load the project config under `root`.
pub fn load_project(root: &Path) -> anyhow::Result<Config> {
    let path = find_config(root).ok_or_else(|| {
        ExitError::Config(format!(
            "no {CONFIG_TOML} or {CONFIG_JSON} found in {} (run `peerloop init`)",
            root.display()
        ))
    })?;
    Config::load(&path)
}

/// Top-level .peerloop.toml config.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    pub project: ProjectConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub claim: ClaimConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProjectConfig {
    pub name: String,
    /// Branch namespace for changes: `<namespace>/<item>-<slug>`.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// File holding the goal, relative to the project root.
    #[serde(default = "default_goal_file")]
    pub goal_file: String,
    /// Validation command run against the integration branch.
    #[serde(default)]
    pub check_command: Option<String>,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Github,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    /// `owner/name`.
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Environment variable holding the API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_30")]
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            repo: None,
            api_url: default_api_url(),
            token_env: default_token_env(),
            timeout_secs: default_timeout_30(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClaimConfig {
    /// Wait between writing a claim marker and reading it back. Must be at
    /// least twice the store's read lag.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_label_retries")]
    pub label_retries: u32,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
            label_retries: default_label_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReviewConfig {
    /// Approvals from distinct non-authors needed to merge (at least 1).
    #[serde(default = "default_quorum")]
    pub quorum: usize,
    /// Changes reviewed or answered per work-loop step.
    #[serde(default = "default_max_per_step")]
    pub max_per_step: usize,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            quorum: default_quorum(),
            max_per_step: default_max_per_step(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkerConfig {
    /// Pause after each full loop.
    #[serde(default = "default_pause_secs")]
    pub pause_secs: u64,
    /// Full loops before exiting; 0 runs until interrupted.
    #[serde(default)]
    pub max_loops: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Validate on every Check-Progress, not only once the queue is empty.
    #[serde(default = "default_true")]
    pub validate_on_check: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pause_secs: default_pause_secs(),
            max_loops: 0,
            stale_after_secs: default_stale_after_secs(),
            validate_on_check: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentConfig {
    /// Agent program and arguments; the prompt is appended.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_timeout_900")]
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: default_timeout_900(),
        }
    }
}

// Default value functions for serde
fn default_namespace() -> String { "peerloop".into() }
fn default_goal_file() -> String { "GOAL.md".into() }
fn default_base_branch() -> String { "main".into() }
fn default_api_url() -> String { "https://api.github.com".into() }
fn default_token_env() -> String { "GITHUB_TOKEN".into() }
fn default_timeout_30() -> u64 { 30 }
fn default_timeout_900() -> u64 { 900 }
fn default_settle_ms() -> u64 { 1500 }
fn default_label_retries() -> u32 { 3 }
fn default_max_attempts() -> u32 { 5 }
fn default_base_delay_ms() -> u64 { 500 }
fn default_max_delay_ms() -> u64 { 15_000 }
fn default_quorum() -> usize { 1 }
fn default_max_per_step() -> usize { 3 }
fn default_pause_secs() -> u64 { 30 }
fn default_stale_after_secs() -> u64 { 3600 }
fn default_true() -> bool { true }

impl Config {
    /// A config with defaults for everything but the project name and repo.
    pub fn new(name: &str, repo: Option<String>) -> Self {
        Self {
            project: ProjectConfig {
                name: name.to_string(),
                namespace: default_namespace(),
                goal_file: default_goal_file(),
                check_command: None,
                base_branch: default_base_branch(),
            },
            store: StoreConfig {
                repo,
                ..StoreConfig::default()
            },
            claim: ClaimConfig::default(),
            retry: RetryConfig::default(),
            review: ReviewConfig::default(),
            worker: WorkerConfig::default(),
            agent: AgentConfig::default(),
        }
    }

    /// Load config from a file (TOML or JSON, auto-detected by extension).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "json" => Self::parse_json(&contents),
            _ => Self::parse_toml(&contents),
        }
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_TOML}: {e}")).into())
    }

    /// Parse config from a JSON string.
    pub fn parse_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_JSON}: {e}")).into())
    }

    /// Serialize config to a TOML string with section comments.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        let raw = toml::to_string_pretty(self).context("serializing config to TOML")?;

        let mut doc: toml_edit::DocumentMut = raw
            .parse()
            .context("parsing generated TOML for comment injection")?;

        doc.decor_mut().set_prefix("# peerloop project configuration\n\n");

        fn set_table_comment(doc: &mut toml_edit::DocumentMut, key: &str, comment: &str) {
            if let Some(tbl) = doc.get_mut(key).and_then(toml_edit::Item::as_table_mut) {
                tbl.decor_mut().set_prefix(comment);
            }
        }

        set_table_comment(&mut doc, "store", "\n# Shared work store (issues, pull requests, reviews)\n");
        set_table_comment(
            &mut doc,
            "claim",
            "\n# Claim election timing; settle_ms must cover twice the store's read lag\n",
        );
        set_table_comment(&mut doc, "retry", "\n# Backoff for transient store failures\n");
        set_table_comment(&mut doc, "review", "\n# Merge gate\n");
        set_table_comment(&mut doc, "worker", "\n# Work loop pacing and progress checks\n");
        set_table_comment(
            &mut doc,
            "agent",
            "\n# External agent; the rendered prompt is appended as the last argument\n",
        );

        Ok(doc.to_string())
    }

    /// Read the goal text from `project.goal_file`.
    pub fn goal(&self, root: &Path) -> anyhow::Result<String> {
        let path = root.join(&self.project.goal_file);
        let goal = std::fs::read_to_string(&path).map_err(|e| {
            ExitError::Config(format!("cannot read goal file {}: {e}", path.display()))
        })?;
        if goal.trim().is_empty() {
            return Err(ExitError::Config(format!("goal file {} is empty", path.display())).into());
        }
        Ok(goal)
    }

    /// The API token, read from the environment variable named in `store.token_env`.
    pub fn token(&self) -> anyhow::Result<String> {
        let var = &self.store.token_env;
        std::env::var(var)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ExitError::Config(format!("${var} is not set")).into())
    }

    pub fn github_settings(&self, token: String) -> anyhow::Result<GithubSettings> {
        let repo = self
            .store
            .repo
            .clone()
            .filter(|r| r.split_once('/').is_some_and(|(o, n)| !o.is_empty() && !n.is_empty()))
            .ok_or_else(|| ExitError::Config("store.repo must be set as owner/name".into()))?;
        Ok(GithubSettings {
            api_url: self.store.api_url.trim_end_matches('/').to_string(),
            repo,
            token,
            base_branch: self.project.base_branch.clone(),
            timeout: Duration::from_secs(self.store.timeout_secs),
        })
    }

    pub fn claim_policy(&self) -> ClaimPolicy {
        ClaimPolicy {
            settle: Duration::from_millis(self.claim.settle_ms),
            label_retries: self.claim.label_retries,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn merge_policy(&self) -> MergePolicy {
        MergePolicy {
            quorum: self.review.quorum,
        }
    }

    pub fn progress_policy(&self) -> ProgressPolicy {
        ProgressPolicy {
            stale_after: Duration::from_secs(self.worker.stale_after_secs),
            validate: self.worker.validate_on_check,
            settle: Duration::from_millis(self.claim.settle_ms),
        }
    }
}

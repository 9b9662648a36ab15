pub mod init;
pub mod protocol;
pub mod run;
pub mod schema;
pub mod status;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::agent::CommandValidator;
use crate::config::{self, Config, StoreKind};
use crate::error::ExitError;
use crate::store::StoreError;
use crate::store::github::GithubStore;
use crate::store::retry::Retrying;

/// Environment override for the worker identity.
pub const WORKER_ENV: &str = "PEERLOOP_WORKER";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

impl OutputFormat {
    /// Pretty on a terminal, text otherwise.
    pub fn resolve(format: Option<Self>) -> Self {
        format.unwrap_or_else(|| {
            if std::io::stdout().is_terminal() {
                OutputFormat::Pretty
            } else {
                OutputFormat::Text
            }
        })
    }
}

/// A project root with its loaded config.
pub struct Project {
    pub root: PathBuf,
    pub config: Config,
}

impl Project {
    pub fn load(root: Option<&Path>) -> anyhow::Result<Self> {
        let root = match root {
            Some(root) => root.to_path_buf(),
            None => std::env::current_dir().context("getting current directory")?,
        };
        let root = root.canonicalize().unwrap_or(root);
        let config = config::load_project(&root)?;
        Ok(Self { root, config })
    }

    /// Connect to the configured store, with retries on transient failures.
    pub fn open_store(&self) -> anyhow::Result<Retrying<GithubStore>> {
        match self.config.store.kind {
            StoreKind::Github => {
                let token = self.config.token()?;
                let store = GithubStore::new(self.config.github_settings(token)?);
                Ok(Retrying::new(store, self.config.retry_policy()))
            }
        }
    }

    pub fn validator(&self) -> CommandValidator {
        CommandValidator::new(
            self.config.project.check_command.clone(),
            self.root.clone(),
            &self.config.project.base_branch,
            Duration::from_secs(self.config.agent.timeout_secs),
        )
    }
}

/// Worker identity. The store records authorship under the account it is
/// authenticated as, and the gate compares that with the worker identity,
/// so an explicit `--worker` or `$PEERLOOP_WORKER` must name that account.
pub fn resolve_identity(
    flag: Option<&str>,
    env: Option<String>,
    login: impl FnOnce() -> Result<String, StoreError>,
) -> anyhow::Result<String> {
    let login = login().context("looking up the store account for the worker identity")?;
    let login = login.trim();
    if login.is_empty() {
        return Err(ExitError::Config("the store account has no login to use as worker identity".into()).into());
    }
    let requested = flag
        .map(str::trim)
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .or_else(|| env.map(|w| w.trim().to_string()).filter(|w| !w.is_empty()));
    match requested {
        // GitHub logins are case-insensitive.
        Some(worker) if !worker.eq_ignore_ascii_case(login) => Err(ExitError::Config(format!(
            "worker identity {worker:?} is not the store account {login:?}; \
             each worker needs its own account, so drop --worker/${WORKER_ENV} or use that account's token"
        ))
        .into()),
        _ => Ok(login.to_string()),
    }
}

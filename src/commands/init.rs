use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use crate::config::{self, Config};
use crate::error::ExitError;

const GOAL_STUB: &str = "# Goal\n\nDescribe the finished artifact here. Workers plan their tasks from this file.\n";

/// Infer the project name from a directory name.
fn infer_project_name(dir: &Path) -> Option<String> {
    let name = dir.file_name()?.to_str()?;
    // Lowercase and replace non-alphanumeric with hyphens
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('-').to_string();
    if trimmed.is_empty() || validate_name(&trimmed, "project name").is_err() {
        return None;
    }
    Some(trimmed)
}

/// Names end up in branch names, so keep them to [a-z0-9-] and ≤64 chars.
fn validate_name(name: &str, label: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        anyhow::bail!("{label} must be 1-64 characters, got {}", name.len());
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        anyhow::bail!("{label} must match [a-z0-9-], got {name:?}");
    }
    if name.starts_with('-') || name.ends_with('-') {
        anyhow::bail!("{label} must not start or end with '-', got {name:?}");
    }
    Ok(())
}

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Project name (defaults to the directory name)
    #[arg(long)]
    pub name: Option<String>,
    /// Store repository as owner/name
    #[arg(long)]
    pub repo: Option<String>,
    /// Validation command run after merges (e.g., "cargo test")
    #[arg(long)]
    pub check_command: Option<String>,
    /// Agent command; the prompt is appended as the last argument
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    pub agent_command: Vec<String>,
    /// Force overwrite existing config
    #[arg(long)]
    pub force: bool,
    /// Project root directory
    #[arg(long)]
    pub project_root: Option<PathBuf>,
}

impl InitArgs {
    pub fn execute(&self) -> Result<()> {
        let project_dir = match &self.project_root {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("getting current directory")?,
        };
        let project_dir = project_dir.canonicalize().unwrap_or(project_dir);

        let config_path = project_dir.join(config::CONFIG_TOML);
        if (config_path.exists() || project_dir.join(config::CONFIG_JSON).exists()) && !self.force {
            return Err(ExitError::Config(format!(
                "{} already has a peerloop config (use --force to overwrite)",
                project_dir.display()
            ))
            .into());
        }

        let name = match &self.name {
            Some(name) => {
                validate_name(name, "project name").map_err(|e| ExitError::Config(e.to_string()))?;
                name.clone()
            }
            None => infer_project_name(&project_dir).ok_or_else(|| {
                ExitError::Config("cannot infer a project name; pass --name".into())
            })?,
        };
        if let Some(repo) = &self.repo
            && !repo.split_once('/').is_some_and(|(o, n)| !o.is_empty() && !n.is_empty())
        {
            return Err(ExitError::Config(format!("--repo must be owner/name, got {repo:?}")).into());
        }

        let mut config = Config::new(&name, self.repo.clone());
        config.project.check_command = self.check_command.clone();
        config.agent.command = self.agent_command.clone();

        fs::create_dir_all(&project_dir)
            .with_context(|| format!("creating {}", project_dir.display()))?;
        fs::write(&config_path, config.to_toml()?)
            .with_context(|| format!("writing {}", config_path.display()))?;
        println!("Generated {}", config::CONFIG_TOML);
        tracing::info!(project = %name, path = %config_path.display(), "wrote config");

        let goal_path = project_dir.join(&config.project.goal_file);
        if goal_path.exists() {
            println!("Keeping existing {}", config.project.goal_file);
        } else {
            fs::write(&goal_path, GOAL_STUB)
                .with_context(|| format!("writing {}", goal_path.display()))?;
            println!("Created {} (edit it before starting workers)", config.project.goal_file);
        }
        Ok(())
    }
}

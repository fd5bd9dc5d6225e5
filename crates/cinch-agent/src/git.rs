//! Repository clone for the executor lifecycle (`spec.md` §4.6 phase 2).
//!
//! Grounded on `buildit-config::variables::VariableContext::populate_git_from_repo`'s
//! pattern of shelling out to the `git` binary rather than a Git library
//! crate, ported to `tokio::process::Command` since cloning runs inside
//! the agent's async job-lifecycle task.

use cinch_core::{Error, Result};
use std::path::Path;
use tokio::process::Command;

fn infra_err(message: impl std::fmt::Display) -> Error {
    Error::Infra { phase: "clone".to_string(), message: message.to_string() }
}

/// Clone `clone_url` at `head_sha` into `target_dir`, injecting
/// `access_token` into the URL per forge convention if supplied
/// (`spec.md` §4.6 phase 2 "short-lived credential if provided").
pub async fn clone_at_sha(
    clone_url: &str,
    head_sha: &str,
    branch: Option<&str>,
    access_token: Option<&str>,
    target_dir: &Path,
) -> Result<()> {
    let url = match access_token {
        Some(token) if clone_url.starts_with("https://") => {
            clone_url.replacen("https://", &format!("https://x-access-token:{token}@"), 1)
        }
        _ => clone_url.to_string(),
    };

    let mut args = vec!["clone".to_string(), "--depth".to_string(), "50".to_string()];
    if let Some(branch) = branch {
        args.push("--branch".to_string());
        args.push(branch.to_string());
    }
    args.push(url);
    args.push(target_dir.display().to_string());

    run_git(None, &args).await?;
    run_git(Some(target_dir), &["fetch", "--depth", "50", "origin", head_sha]).await.ok();
    run_git(Some(target_dir), &["checkout", "--quiet", head_sha]).await?;
    Ok(())
}

async fn run_git(cwd: Option<&Path>, args: &[impl AsRef<str>]) -> Result<()> {
    let mut cmd = Command::new("git");
    cmd.args(args.iter().map(|a| a.as_ref()));
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    let output = cmd.output().await.map_err(infra_err)?;
    if !output.status.success() {
        return Err(infra_err(String::from_utf8_lossy(&output.stderr)));
    }
    Ok(())
}

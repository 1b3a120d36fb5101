use std::path::Path;
use std::process::{Command, Stdio};

use crate::error::{Error, Result};

/// True when `dir` sits inside a git work tree whose HEAD resolves to a commit.
/// A freshly initialised repository has nothing to describe yet.
pub fn is_repository(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["rev-parse", "--verify", "-q", "HEAD"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Abbreviated commit hash of HEAD, suffixed with `-dirty` for modified trees.
/// Tags are ignored so the result only changes when the revision does.
pub fn describe_revision(repo: &Path) -> Result<String> {
    describe(
        repo,
        &["--always", "--dirty", "--abbrev=12", "--exclude=*"],
    )
}

/// Human version string (nearest tag when there is one).
pub fn describe_version(repo: &Path) -> Result<String> {
    describe(repo, &["--tags", "--always", "--dirty"])
}

fn describe(repo: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .arg("-C")
        .arg(repo)
        .arg("describe")
        .args(args)
        .output()
        .map_err(|e| {
            Error::msg(format!(
                "failed to run git describe in {}: {e}",
                repo.display()
            ))
        })?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(Error::msg(format!(
            "git describe failed in {}: {}",
            repo.display(),
            stderr.trim()
        )));
    }
    let parsed = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if parsed.is_empty() {
        return Err(Error::msg(format!(
            "git describe returned empty output in {}",
            repo.display()
        )));
    }
    Ok(parsed)
}

use std::path::Path;

use super::{ChangeDetector, StateDir, atomic_write_text, checkpoint_path, read_checkpoint};
use crate::error::Result;
use crate::git;
use crate::modules::{FirmwareModule, Module};

/// Fires when `repo_path` moved to another commit or its dirtiness changed.
/// Directories outside git, or without a commit yet, never fire.
#[derive(Debug, Clone)]
pub struct RevisionDetector {
    state: StateDir,
}

impl RevisionDetector {
    pub fn new(state: StateDir) -> Self {
        Self { state }
    }
}

impl ChangeDetector for RevisionDetector {
    fn name(&self) -> &'static str {
        "git"
    }

    fn save_checkpoint(&self, id: &str, module: &Module) -> Result<()> {
        let repo = Path::new(&module.common().repo_path);
        if !git::is_repository(repo) {
            return Ok(());
        }
        let path = checkpoint_path(&self.state.git_hashes(), id, "txt");
        atomic_write_text(&path, &git::describe_revision(repo)?)
    }

    fn detect_changes(&self, id: &str, module: &Module) -> Result<bool> {
        let repo = Path::new(&module.common().repo_path);
        if !git::is_repository(repo) {
            return Ok(false);
        }
        let path = checkpoint_path(&self.state.git_hashes(), id, "txt");
        let current = git::describe_revision(repo)?;
        Ok(read_checkpoint(&path)?.is_none_or(|saved| saved.trim() != current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testutil::{git, have_git, init_empty_repo, init_repo};
    use crate::modules::{CommonOpts, URootOpts};
    use std::fs;

    fn module(repo: &Path) -> Module {
        Module::URoot(URootOpts {
            common: CommonOpts {
                repo_path: repo.display().to_string(),
                ..Default::default()
            },
            build_command: "go build".into(),
        })
    }

    #[test]
    fn plain_directory_never_fires() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let det = RevisionDetector::new(StateDir::new(tmp.path().join("state")));
        let m = module(&tmp.path().join("not-a-repo"));
        det.save_checkpoint("u-root", &m).unwrap();
        assert!(!det.detect_changes("u-root", &m).unwrap());
        assert!(!tmp.path().join("state/git-hashes").exists());
    }

    #[test]
    fn repository_without_commits_never_fires() {
        if !have_git() {
            return;
        }
        let tmp = tempfile::tempdir().expect("tempdir");
        let repo = tmp.path().join("repo");
        init_empty_repo(&repo);
        fs::write(repo.join("Makefile"), "all:\n").unwrap();
        let det = RevisionDetector::new(StateDir::new(tmp.path().join("state")));
        let m = module(&repo);

        det.save_checkpoint("u-root", &m).expect("save is a no-op");
        assert!(!det.detect_changes("u-root", &m).expect("detect"));
        assert!(!tmp.path().join("state/git-hashes").exists());
    }

    #[test]
    fn commits_and_dirt_fire() {
        if !have_git() {
            return;
        }
        let tmp = tempfile::tempdir().expect("tempdir");
        let repo = tmp.path().join("repo");
        init_repo(&repo);
        let det = RevisionDetector::new(StateDir::new(tmp.path().join("state")));
        let m = module(&repo);

        assert!(det.detect_changes("u-root", &m).unwrap());
        det.save_checkpoint("u-root", &m).unwrap();
        assert!(!det.detect_changes("u-root", &m).unwrap());

        fs::write(repo.join("README"), "changed\n").unwrap();
        assert!(det.detect_changes("u-root", &m).unwrap(), "dirty tree");

        git(&repo, &["commit", "-qam", "second"]);
        assert!(det.detect_changes("u-root", &m).unwrap(), "new commit");
        det.save_checkpoint("u-root", &m).unwrap();
        assert!(!det.detect_changes("u-root", &m).unwrap());
    }
}

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::fsutil;
use crate::modules::Module;

mod fingerprint;
mod revision;
mod timestamp;

pub use fingerprint::ConfigDetector;
pub use revision::RevisionDetector;
pub use timestamp::TimestampDetector;

pub const DEFAULT_STATE_DIR: &str = ".firmware-action";

pub trait ChangeDetector {
    fn name(&self) -> &'static str;
    fn save_checkpoint(&self, id: &str, module: &Module) -> Result<()>;
    fn detect_changes(&self, id: &str, module: &Module) -> Result<bool>;
}

/// Layout of the on-disk state directory.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl Default for StateDir {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_DIR)
    }
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn timestamps(&self) -> PathBuf {
        self.root.join("timestamps")
    }

    pub fn configs(&self) -> PathBuf {
        self.root.join("configs")
    }

    pub fn git_hashes(&self) -> PathBuf {
        self.root.join("git-hashes")
    }

    pub fn create(&self) -> Result<()> {
        for dir in [self.timestamps(), self.configs(), self.git_hashes()] {
            fsutil::ensure_dir(&dir)?;
        }
        Ok(())
    }

    /// The three detectors over this state directory. `outputs` are the output
    /// directories of every configured module; they never count as sources.
    pub fn detectors(&self, outputs: &[PathBuf]) -> Vec<Box<dyn ChangeDetector>> {
        vec![
            Box::new(TimestampDetector::new(self.clone()).excluding(outputs.iter().cloned())),
            Box::new(ConfigDetector::new(self.clone())),
            Box::new(RevisionDetector::new(self.clone())),
        ]
    }
}

fn checkpoint_path(dir: &Path, id: &str, ext: &str) -> PathBuf {
    dir.join(fsutil::filenamify(id, ext))
}

fn read_checkpoint(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::msg(format!(
            "failed to read checkpoint {}: {e}",
            path.display()
        ))),
    }
}

fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fsutil::ensure_dir(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| Error::msg(format!("failed to create temp file in {}: {e}", parent.display())))?;
    io::Write::write_all(&mut tmp, body.as_bytes())?;
    tmp.persist(path).map_err(|e| {
        Error::msg(format!(
            "failed to write checkpoint {}: {}",
            path.display(),
            e.error
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_and_file_names() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let state = StateDir::new(tmp.path().join(DEFAULT_STATE_DIR));
        state.create().expect("create");
        assert!(state.timestamps().is_dir());
        assert!(state.configs().is_dir());
        assert!(state.git_hashes().is_dir());
        assert_eq!(
            checkpoint_path(&state.configs(), "coreboot example", "json"),
            state.configs().join("coreboot_example.json")
        );
    }

    #[test]
    fn atomic_write_replaces_content() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("nested/value.txt");
        atomic_write_text(&p, "one").unwrap();
        atomic_write_text(&p, "two").unwrap();
        assert_eq!(read_checkpoint(&p).unwrap().as_deref(), Some("two"));
        assert_eq!(read_checkpoint(&tmp.path().join("none")).unwrap(), None);
    }
}

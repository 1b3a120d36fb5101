use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};

use super::{ChangeDetector, StateDir, atomic_write_text, checkpoint_path, read_checkpoint};
use crate::error::{Error, Result};
use crate::fsutil;
use crate::modules::{FirmwareModule, Module};

/// Fires when a source file was modified after the recorded build time.
#[derive(Debug, Clone)]
pub struct TimestampDetector {
    state: StateDir,
    outputs: Vec<PathBuf>,
}

impl TimestampDetector {
    pub fn new(state: StateDir) -> Self {
        Self {
            state,
            outputs: Vec::new(),
        }
    }

    /// Output directories of every configured module. Modules sharing a
    /// repository must not see each other's artifacts as source changes.
    pub fn excluding(mut self, outputs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.outputs
            .extend(outputs.into_iter().filter(|p| !p.as_os_str().is_empty()));
        self
    }

    /// Time of the last successful build of `id`, if any.
    pub fn recorded(&self, id: &str) -> Result<Option<DateTime<Utc>>> {
        let path = checkpoint_path(&self.state.timestamps(), id, "txt");
        let Some(raw) = read_checkpoint(&path)? else {
            return Ok(None);
        };
        let ts = DateTime::parse_from_rfc3339(raw.trim()).map_err(|e| {
            Error::msg(format!("corrupt timestamp in {}: {e}", path.display()))
        })?;
        Ok(Some(ts.with_timezone(&Utc)))
    }

    pub fn save_at(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let path = checkpoint_path(&self.state.timestamps(), id, "txt");
        atomic_write_text(&path, &at.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }
}

impl ChangeDetector for TimestampDetector {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    fn save_checkpoint(&self, id: &str, _module: &Module) -> Result<()> {
        self.save_at(id, Utc::now())
    }

    fn detect_changes(&self, id: &str, module: &Module) -> Result<bool> {
        let Some(at) = self.recorded(id)? else {
            return Ok(true);
        };
        let since: SystemTime = at.into();
        // Our own state and build outputs never count as sources.
        let mut exclude = vec![self.state.root().to_path_buf()];
        exclude.extend(self.outputs.iter().cloned());
        let out = &module.common().output_dir;
        if !out.trim().is_empty() {
            exclude.push(PathBuf::from(out));
        }
        let sources: Vec<PathBuf> = module
            .sources()
            .into_iter()
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        fsutil::any_file_newer_than(&sources, since, &exclude)
    }
}

use super::{ChangeDetector, StateDir, atomic_write_text, checkpoint_path, read_checkpoint};
use crate::error::Result;
use crate::modules::Module;

/// Fires when the module's effective configuration differs from the last build.
#[derive(Debug, Clone)]
pub struct ConfigDetector {
    state: StateDir,
}

impl ConfigDetector {
    pub fn new(state: StateDir) -> Self {
        Self { state }
    }
}

/// Canonical serialization; field order is fixed and maps are sorted.
pub fn fingerprint(module: &Module) -> Result<String> {
    Ok(serde_json::to_string_pretty(module)?)
}

impl ChangeDetector for ConfigDetector {
    fn name(&self) -> &'static str {
        "config"
    }

    fn save_checkpoint(&self, id: &str, module: &Module) -> Result<()> {
        let path = checkpoint_path(&self.state.configs(), id, "json");
        atomic_write_text(&path, &fingerprint(module)?)
    }

    fn detect_changes(&self, id: &str, module: &Module) -> Result<bool> {
        let path = checkpoint_path(&self.state.configs(), id, "json");
        match read_checkpoint(&path)? {
            Some(saved) => Ok(saved != fingerprint(module)?),
            None => Ok(true),
        }
    }
}

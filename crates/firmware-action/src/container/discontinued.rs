use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

const BUNDLED: &str = include_str!("../../data/discontinued-containers.json");

pub const USER_FILE_NAME: &str = "discontinued-containers.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscontinuedEntry {
    /// Image reference; without a tag it matches every tag of the image.
    pub reference: String,
    pub reason: Option<String>,
    pub replacement: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Discontinued {
    pub images: Vec<DiscontinuedEntry>,
}

impl Discontinued {
    pub fn bundled() -> Result<Self> {
        serde_json::from_str(BUNDLED)
            .map_err(|e| Error::msg(format!("bundled deny-list is malformed: {e}")))
    }

    /// Bundled list extended by `<state_dir>/discontinued-containers.json` when present.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let mut list = Self::bundled()?;
        let user = state_dir.join(USER_FILE_NAME);
        if user.is_file() {
            let raw = fs::read_to_string(&user)
                .map_err(|e| Error::msg(format!("failed to read {}: {e}", user.display())))?;
            let extra: Discontinued = serde_json::from_str(&raw)
                .map_err(|e| Error::msg(format!("failed to parse {}: {e}", user.display())))?;
            list.images.extend(extra.images);
        }
        Ok(list)
    }

    pub fn find(&self, reference: &str) -> Option<&DiscontinuedEntry> {
        let reference = reference.trim();
        self.images.iter().find(|e| {
            let want = e.reference.trim();
            if want.is_empty() {
                return false;
            }
            reference == want
                || (!has_tag(want)
                    && reference
                        .strip_prefix(want)
                        .is_some_and(|rest| rest.starts_with(':') || rest.starts_with('@')))
        })
    }

    pub fn check(&self, reference: &str) -> Result<()> {
        let Some(hit) = self.find(reference) else {
            return Ok(());
        };
        let mut msg = format!("container image '{reference}' is no longer maintained");
        if let Some(reason) = hit.reason.as_deref().filter(|s| !s.trim().is_empty()) {
            msg.push_str(&format!(" ({reason})"));
        }
        if let Some(repl) = hit.replacement.as_deref().filter(|s| !s.trim().is_empty()) {
            msg.push_str(&format!("; use '{repl}' instead"));
        }
        Err(Error::new(ErrorKind::ContainerDiscontinued, msg))
    }
}

fn has_tag(reference: &str) -> bool {
    let last = reference.rsplit('/').next().unwrap_or(reference);
    last.contains(':') || last.contains('@')
}

use serde::{Deserialize, Serialize};

use super::{BuildResult, CommonOpts, FirmwareModule, run_in_container};
use crate::executor::ExecCtx;

/// Arbitrary shell commands in an arbitrary image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UniversalOpts {
    #[serde(flatten)]
    pub common: CommonOpts,
    pub build_commands: Vec<String>,
}

impl FirmwareModule for UniversalOpts {
    fn kind(&self) -> &'static str {
        "universal"
    }

    fn common(&self) -> &CommonOpts {
        &self.common
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let mut out = self.common.missing_fields();
        if self.build_commands.iter().all(|c| c.trim().is_empty()) {
            out.push("build_commands");
        }
        out
    }

    fn build(&self, ctx: &ExecCtx) -> BuildResult {
        run_in_container(ctx, &self.common, Vec::new(), &self.artifacts(), |ctx, c| {
            for cmd in &self.build_commands {
                c.exec_shell(ctx, cmd)?;
            }
            Ok(())
        })
    }
}

use serde::{Deserialize, Serialize};

use super::{BuildResult, CommonOpts, FirmwareModule, run_in_container};
use crate::arch;
use crate::executor::ExecCtx;

/// BaseTools location inside the edk2 SDK images.
pub const EDK_TOOLS_PATH: &str = "/tools/Edk2/BaseTools";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Edk2Opts {
    #[serde(flatten)]
    pub common: CommonOpts,
    pub arch: String,
    pub build_commands: Vec<String>,
}

impl Edk2Opts {
    fn env(&self) -> Vec<(String, String)> {
        vec![
            ("WORKSPACE".into(), self.common.container_workdir.clone()),
            ("EDK_TOOLS_PATH".into(), EDK_TOOLS_PATH.into()),
        ]
    }
}

impl FirmwareModule for Edk2Opts {
    fn kind(&self) -> &'static str {
        "edk2"
    }

    fn common(&self) -> &CommonOpts {
        &self.common
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let mut out = self.common.missing_fields();
        if self.arch.trim().is_empty() {
            out.push("arch");
        }
        if self.build_commands.iter().all(|c| c.trim().is_empty()) {
            out.push("build_commands");
        }
        out
    }

    fn build(&self, ctx: &ExecCtx) -> BuildResult {
        let rebuild_tools = !arch::is_x86(&arch::host_arch());
        run_in_container(ctx, &self.common, self.env(), &self.artifacts(), |ctx, c| {
            // Prebuilt BaseTools in the images are x86 binaries.
            if rebuild_tools {
                c.exec_shell(ctx, "make -C $EDK_TOOLS_PATH")?;
            }
            for cmd in &self.build_commands {
                c.exec_shell(ctx, cmd)?;
            }
            Ok(())
        })
    }
}

use serde::{Deserialize, Serialize};

use super::{BuildResult, CommonOpts, FirmwareModule, run_in_container};
use crate::executor::ExecCtx;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct URootOpts {
    #[serde(flatten)]
    pub common: CommonOpts,
    /// e.g. `go build; GOARCH=amd64 ./u-root -defaultsh gosh -o initramfs.cpio core`
    pub build_command: String,
}

impl FirmwareModule for URootOpts {
    fn kind(&self) -> &'static str {
        "uroot"
    }

    fn common(&self) -> &CommonOpts {
        &self.common
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let mut out = self.common.missing_fields();
        if self.build_command.trim().is_empty() {
            out.push("build_command");
        }
        out
    }

    fn build(&self, ctx: &ExecCtx) -> BuildResult {
        run_in_container(ctx, &self.common, Vec::new(), &self.artifacts(), |ctx, c| {
            c.exec_shell(ctx, &self.build_command)
        })
    }
}

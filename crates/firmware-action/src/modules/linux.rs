use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{
    BuildResult, CommonOpts, FirmwareModule, check_defconfig_name, file_name, kernel_arch_env,
    make_jobs, run_in_container,
};
use crate::arch;
use crate::container::Container;
use crate::error::Result;
use crate::executor::ExecCtx;
use crate::fsutil;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinuxOpts {
    #[serde(flatten)]
    pub common: CommonOpts,
    pub arch: String,
    pub defconfig_path: String,
}

impl LinuxOpts {
    /// Where the defconfig goes inside the kernel tree.
    pub fn defconfig_target(&self) -> Result<String> {
        let name = file_name(&self.defconfig_path)?;
        Ok(format!(
            "arch/{}/configs/{name}",
            arch::normalize_arch_for_linux(&self.arch)
        ))
    }

    fn steps(&self, ctx: &ExecCtx, c: &Container) -> Result<()> {
        let name = file_name(&self.defconfig_path)?;
        let target = self.defconfig_target()?;
        c.copy_in(ctx, Path::new(&self.defconfig_path), &c.path(&target))?;
        c.exec(ctx, &["rm", "-f", ".config"])?;
        c.exec(ctx, &["make", &name])?;
        c.exec(ctx, &["make", &make_jobs()])?;
        c.exec(ctx, &["make", "savedefconfig"])
    }
}

impl FirmwareModule for LinuxOpts {
    fn kind(&self) -> &'static str {
        "linux"
    }

    fn common(&self) -> &CommonOpts {
        &self.common
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let mut out = self.common.missing_fields();
        if self.arch.trim().is_empty() {
            out.push("arch");
        }
        if self.defconfig_path.trim().is_empty() {
            out.push("defconfig_path");
        }
        out
    }

    fn sources(&self) -> Vec<PathBuf> {
        let mut out = self.common.sources();
        out.push(PathBuf::from(&self.defconfig_path));
        out
    }

    fn build(&self, ctx: &ExecCtx) -> BuildResult {
        check_defconfig_name(&file_name(&self.defconfig_path)?)?;
        fsutil::check_is_file(Path::new(&self.defconfig_path))?;
        let env = kernel_arch_env(&self.arch, arch::normalize_arch_for_linux(&self.arch))?;
        run_in_container(ctx, &self.common, env, &self.artifacts(), |ctx, c| {
            self.steps(ctx, c)
        })
    }
}

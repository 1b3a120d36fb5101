use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{BuildResult, CommonOpts, FirmwareModule, file_name, make_jobs, run_in_container};
use crate::container::Container;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::fsutil::{self, PathKind};
use crate::git;
use crate::kconfig::{self, Kconfig};

/// Host environment passed through to the coreboot build.
pub const PASSTHROUGH_ENV: &[&str] = &["KERNELVERSION", "BUILD_TIMELESS"];
const VERSION_FILE: &str = ".coreboot-version";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorebootOpts {
    #[serde(flatten)]
    pub common: CommonOpts,
    pub defconfig_path: String,
    /// Kconfig key (e.g. `CONFIG_PAYLOAD_FILE`) -> host path of the blob.
    pub blobs: BTreeMap<String, String>,
}

impl CorebootOpts {
    fn check_blobs(&self) -> Result<()> {
        for (key, path) in &self.blobs {
            match fsutil::path_kind(Path::new(path))? {
                PathKind::File => {}
                PathKind::Missing => {
                    return Err(Error::new(
                        ErrorKind::NotExist,
                        format!("blob '{path}' for {key}"),
                    ));
                }
                PathKind::Dir => {
                    return Err(Error::new(
                        ErrorKind::PathIsDirectory,
                        format!("blob '{path}' for {key}"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn build_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = PASSTHROUGH_ENV
            .iter()
            .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
            .collect();

        let has_version = env.iter().any(|(k, _)| k == "KERNELVERSION");
        let repo = Path::new(&self.common.repo_path);
        if !has_version && !repo.join(VERSION_FILE).is_file() {
            match git::describe_version(repo) {
                Ok(v) => env.push(("KERNELVERSION".into(), v)),
                Err(e) => tracing::warn!("no coreboot version available: {e}"),
            }
        }
        env
    }

    fn steps(&self, ctx: &ExecCtx, c: &Container) -> Result<()> {
        let defconfig = file_name(&self.defconfig_path)?;
        c.copy_in(ctx, Path::new(&self.defconfig_path), &c.path(&defconfig))?;
        c.exec(
            ctx,
            &["make", &format!("KBUILD_DEFCONFIG={defconfig}"), "defconfig"],
        )?;

        if !self.blobs.is_empty() {
            // MAINBOARD_DIR only exists once .config has been generated.
            let raw = c.output(
                ctx,
                &["./util/scripts/config", "--file", ".config", "-s", "MAINBOARD_DIR"],
            )?;
            let mainboard = kconfig::unquote(raw.trim());
            if mainboard.is_empty() || mainboard == "undef" {
                return Err(Error::new(
                    ErrorKind::BuildFailed,
                    "CONFIG_MAINBOARD_DIR is not set in the generated .config",
                ));
            }
            let blob_dir = format!("3rdparty/blobs/mainboard/{mainboard}");
            c.mkdir(ctx, &c.path(&blob_dir))?;

            let mut config = Kconfig::parse(&c.output(ctx, &["cat", ".config"])?);
            for (key, host) in &self.blobs {
                let staged = format!("{blob_dir}/{}", file_name(host)?);
                c.copy_in(ctx, Path::new(host), &c.path(&staged))?;
                config.set_string(key, &staged);
                ctx.log(&format!("{key} -> {staged}"));
            }
            self.upload_config(ctx, c, &config)?;
            c.exec(ctx, &["make", "olddefconfig"])?;
        }

        c.exec(ctx, &["make", &make_jobs()])?;
        c.exec(ctx, &["make", "savedefconfig"])
    }

    fn upload_config(&self, ctx: &ExecCtx, c: &Container, config: &Kconfig) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(config.to_string().as_bytes())?;
        tmp.flush()?;
        c.copy_in(ctx, tmp.path(), &c.path(".config"))
    }
}

impl FirmwareModule for CorebootOpts {
    fn kind(&self) -> &'static str {
        "coreboot"
    }

    fn common(&self) -> &CommonOpts {
        &self.common
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let mut out = self.common.missing_fields();
        if self.defconfig_path.trim().is_empty() {
            out.push("defconfig_path");
        }
        out
    }

    fn sources(&self) -> Vec<PathBuf> {
        let mut out = self.common.sources();
        out.push(PathBuf::from(&self.defconfig_path));
        out.extend(self.blobs.values().map(PathBuf::from));
        out
    }

    fn build(&self, ctx: &ExecCtx) -> BuildResult {
        fsutil::check_is_file(Path::new(&self.defconfig_path))?;
        self.check_blobs()?;
        let env = self.build_env();
        run_in_container(ctx, &self.common, env, &self.artifacts(), |ctx, c| {
            self.steps(ctx, c)
        })
    }
}

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::arch;
use crate::container::{Artifact, Container, SetupOpts};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;

pub mod coreboot;
pub mod edk2;
pub mod linux;
pub mod stitching;
pub mod uboot;
pub mod universal;
pub mod uroot;

pub use coreboot::CorebootOpts;
pub use edk2::Edk2Opts;
pub use linux::LinuxOpts;
pub use stitching::{FirmwareStitchingOpts, InjectEntry};
pub use uboot::UBootOpts;
pub use universal::UniversalOpts;
pub use uroot::URootOpts;

pub const DEFAULT_CONTAINER_WORKDIR: &str = "/workdir";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonOpts {
    /// Image reference, or `file://` path to an archive or recipe.
    pub sdk_source: String,
    pub repo_path: String,
    pub container_workdir: String,
    pub output_dir: String,
    pub container_output_files: Vec<String>,
    pub container_output_dirs: Vec<String>,
    pub container_input_dir: String,
    pub input_files: Vec<String>,
    pub input_dirs: Vec<String>,
    pub depends: Vec<String>,
}

impl Default for CommonOpts {
    fn default() -> Self {
        Self {
            sdk_source: String::new(),
            repo_path: String::new(),
            container_workdir: DEFAULT_CONTAINER_WORKDIR.into(),
            output_dir: String::new(),
            container_output_files: Vec::new(),
            container_output_dirs: Vec::new(),
            container_input_dir: String::new(),
            input_files: Vec::new(),
            input_dirs: Vec::new(),
            depends: Vec::new(),
        }
    }
}

impl CommonOpts {
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        for (name, value) in [
            ("sdk_source", &self.sdk_source),
            ("repo_path", &self.repo_path),
            ("output_dir", &self.output_dir),
        ] {
            if value.trim().is_empty() {
                out.push(name);
            }
        }
        out
    }

    pub fn setup_opts(&self) -> SetupOpts {
        SetupOpts {
            container_url: self.sdk_source.clone(),
            mount_container_dir: self.container_workdir.clone(),
            mount_host_dir: self.repo_path.clone(),
            workdir_container: self.container_workdir.clone(),
            container_input_dir: self.container_input_dir.clone(),
            input_files: self.input_files.clone(),
            input_dirs: self.input_dirs.clone(),
        }
    }

    pub fn sources(&self) -> Vec<PathBuf> {
        let mut out = vec![PathBuf::from(&self.repo_path)];
        out.extend(self.input_files.iter().map(PathBuf::from));
        out.extend(self.input_dirs.iter().map(PathBuf::from));
        out
    }

    fn in_container(&self, p: &str) -> String {
        if p.starts_with('/') {
            p.to_string()
        } else {
            format!(
                "{}/{}",
                self.container_workdir.trim_end_matches('/'),
                p.trim_start_matches("./")
            )
        }
    }

    /// Every output lands directly under `output_dir`.
    pub fn artifacts(&self) -> Vec<Artifact> {
        let host = PathBuf::from(&self.output_dir);
        let dirs = self.container_output_dirs.iter().map(|d| Artifact {
            container_path: self.in_container(d),
            host_path: host.clone(),
            container_is_dir: true,
            host_is_dir: true,
        });
        let files = self.container_output_files.iter().map(|f| Artifact {
            container_path: self.in_container(f),
            host_path: host.clone(),
            container_is_dir: false,
            host_is_dir: true,
        });
        dirs.chain(files).collect()
    }

        pub fn expected_outputs(&self) -> Vec<PathBuf> {
        let host = Path::new(&self.output_dir);
        self.container_output_dirs
            .iter()
            .chain(&self.container_output_files)
            .filter_map(|p| Path::new(p.trim_end_matches('/')).file_name())
            .map(|name| host.join(name))
            .collect()
    }
}

/// Why a build did not succeed, plus the container it ran in when there was one.
#[derive(Debug)]
pub struct BuildFailure {
    pub error: Error,
    pub container: Option<Container>,
}

impl From<Error> for BuildFailure {
    fn from(error: Error) -> Self {
        Self {
            error,
            container: None,
        }
    }
}

pub type BuildResult = std::result::Result<(), BuildFailure>;

pub trait FirmwareModule {
    fn kind(&self) -> &'static str;
    fn common(&self) -> &CommonOpts;
    /// Kind-specific required fields that are empty.
    fn missing_fields(&self) -> Vec<&'static str>;
    fn build(&self, ctx: &ExecCtx) -> BuildResult;

    fn depends(&self) -> &[String] {
        &self.common().depends
    }

    fn sources(&self) -> Vec<PathBuf> {
        self.common().sources()
    }

    fn artifacts(&self) -> Vec<Artifact> {
        self.common().artifacts()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Module {
    Coreboot(CorebootOpts),
    Linux(LinuxOpts),
    Edk2(Edk2Opts),
    #[serde(rename = "uboot")]
    UBoot(UBootOpts),
    #[serde(rename = "uroot")]
    URoot(URootOpts),
    Universal(UniversalOpts),
    FirmwareStitching(FirmwareStitchingOpts),
}

macro_rules! dispatch {
    ($self:expr, $m:ident => $body:expr) => {
        match $self {
            Module::Coreboot($m) => $body,
            Module::Linux($m) => $body,
            Module::Edk2($m) => $body,
            Module::UBoot($m) => $body,
            Module::URoot($m) => $body,
            Module::Universal($m) => $body,
            Module::FirmwareStitching($m) => $body,
        }
    };
}

impl FirmwareModule for Module {
    fn kind(&self) -> &'static str {
        dispatch!(self, m => m.kind())
    }

    fn common(&self) -> &CommonOpts {
        dispatch!(self, m => m.common())
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        dispatch!(self, m => m.missing_fields())
    }

    fn build(&self, ctx: &ExecCtx) -> BuildResult {
        dispatch!(self, m => m.build(ctx))
    }

    fn sources(&self) -> Vec<PathBuf> {
        dispatch!(self, m => m.sources())
    }

    fn artifacts(&self) -> Vec<Artifact> {
        dispatch!(self, m => m.artifacts())
    }
}

/// Brings a container up for `common`, runs `steps` in it and exports the artifacts.
pub(crate) fn run_in_container<F>(
    ctx: &ExecCtx,
    common: &CommonOpts,
    env: Vec<(String, String)>,
    artifacts: &[Artifact],
    steps: F,
) -> BuildResult
where
    F: FnOnce(&ExecCtx, &Container) -> Result<()>,
{
    let mut container = Container::setup(ctx, &common.setup_opts())?;
    for (k, v) in env {
        container.set_env(k, v);
    }
    let res = steps(ctx, &container).and_then(|()| container.export(ctx, artifacts));
    match res {
        Ok(()) => Ok(()),
        Err(error) => Err(BuildFailure {
            error,
            container: Some(container),
        }),
    }
}

/// `ARCH` / `CROSS_COMPILE` for kernel-style builds.
pub(crate) fn kernel_arch_env(target: &str, arch_value: String) -> Result<Vec<(String, String)>> {
    let mut env = vec![("ARCH".to_string(), arch_value)];
    let host = arch::host_arch();
    let target_norm = arch::normalize_arch(target);
    if host != target_norm {
        let prefix = arch::cross_compile_prefix(&target_norm).ok_or_else(|| {
            Error::new(
                ErrorKind::UnknownArchCrossCompile,
                format!("no cross compiler known for '{target}' on a {host} host"),
            )
        })?;
        env.push(("CROSS_COMPILE".to_string(), prefix.to_string()));
    }
    Ok(env)
}

/// Kernel-style defconfig names end in `defconfig` and never contain `.defconfig`.
pub(crate) fn check_defconfig_name(name: &str) -> Result<()> {
    if name.ends_with("defconfig") && !name.contains(".defconfig") {
        return Ok(());
    }
    let stem = name
        .split(".defconfig")
        .next()
        .unwrap_or(name)
        .trim_end_matches(['.', '_']);
    let suggestion = if stem.is_empty() {
        "defconfig".to_string()
    } else {
        format!("{stem}_defconfig")
    };
    Err(Error::new(
        ErrorKind::FailedValidation,
        format!(
            "defconfig file name '{name}' must end with 'defconfig' and must not contain \
             '.defconfig'; make treats other names as unknown targets (rename it, e.g. to \
             '{suggestion}')"
        ),
    ))
}

pub(crate) fn file_name(p: &str) -> Result<String> {
    crate::fsutil::file_name_str(Path::new(p))
}

pub(crate) fn make_jobs() -> String {
    format!("-j{}", num_cpus::get().max(1))
}

pub(crate) fn known_arch(a: &str) -> bool {
    matches!(
        arch::normalize_arch(a).as_str(),
        "i386" | "amd64" | "arm" | "arm64"
    )
}

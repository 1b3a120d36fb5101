use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, ErrorKind, Result};
use crate::modules::{
    CommonOpts, CorebootOpts, Edk2Opts, FirmwareStitchingOpts, InjectEntry, LinuxOpts, Module,
    UBootOpts, URootOpts, UniversalOpts,
};

mod env;
mod validate;

pub use env::line_and_char;
pub use validate::validate;

/// Top-level configuration: module kind -> module id -> options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub coreboot: BTreeMap<String, CorebootOpts>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub linux: BTreeMap<String, LinuxOpts>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub edk2: BTreeMap<String, Edk2Opts>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub uboot: BTreeMap<String, UBootOpts>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub uroot: BTreeMap<String, URootOpts>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub universal: BTreeMap<String, UniversalOpts>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub firmware_stitching: BTreeMap<String, FirmwareStitchingOpts>,
}

impl Config {
    /// Every module keyed by id; ids must be unique across kinds.
    pub fn modules(&self) -> Result<BTreeMap<String, Module>> {
        let mut out = BTreeMap::new();
        let all = self
            .coreboot
            .iter()
            .map(|(k, v)| (k, Module::Coreboot(v.clone())))
            .chain(self.linux.iter().map(|(k, v)| (k, Module::Linux(v.clone()))))
            .chain(self.edk2.iter().map(|(k, v)| (k, Module::Edk2(v.clone()))))
            .chain(self.uboot.iter().map(|(k, v)| (k, Module::UBoot(v.clone()))))
            .chain(self.uroot.iter().map(|(k, v)| (k, Module::URoot(v.clone()))))
            .chain(self.universal.iter().map(|(k, v)| (k, Module::Universal(v.clone()))))
            .chain(
                self.firmware_stitching
                    .iter()
                    .map(|(k, v)| (k, Module::FirmwareStitching(v.clone()))),
            );
        for (id, m) in all {
            if out.insert(id.clone(), m).is_some() {
                return Err(Error::new(
                    ErrorKind::FailedValidation,
                    format!("module id '{id}' is used more than once"),
                ));
            }
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.coreboot.len()
            + self.linux.len()
            + self.edk2.len()
            + self.uboot.len()
            + self.uroot.len()
            + self.universal.len()
            + self.firmware_stitching.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parses configuration text, expanding environment variables via `lookup`.
pub fn parse<F>(text: &str, origin: &str, lookup: &F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    // Decode once as typed to get located errors for shape problems.
    serde_json::from_str::<Config>(text).map_err(|e| verbose_json(text, origin, &e))?;
    let mut value: Value = serde_json::from_str(text).map_err(|e| verbose_json(text, origin, &e))?;
    env::expand_value(&mut value, text, lookup)
        .map_err(|e| Error::new(e.kind(), format!("{origin}: {}", e.message())))?;
    serde_json::from_value(value).map_err(|e| {
        Error::new(
            ErrorKind::VerboseJson,
            format!("{origin}: after variable expansion: {e}"),
        )
    })
}

fn verbose_json(text: &str, origin: &str, e: &serde_json::Error) -> Error {
    let (line, column) = (e.line(), e.column());
    let snippet = text
        .lines()
        .nth(line.saturating_sub(1))
        .map(|l| format!("\n  {l}\n  {}^", " ".repeat(column.saturating_sub(1))))
        .unwrap_or_default();
    Error::new(
        ErrorKind::VerboseJson,
        format!("{origin}: line {line}, character {column}: {e}{snippet}"),
    )
}

pub fn read(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let lookup = |name: &str| std::env::var(name).ok();
    parse(&text, &path.display().to_string(), &lookup)
}

pub fn to_string(cfg: &Config) -> Result<String> {
    let mut s = serde_json::to_string_pretty(cfg)?;
    s.push('\n');
    Ok(s)
}

pub fn write(path: &Path, cfg: &Config) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        crate::fsutil::ensure_dir(parent)?;
    }
    fs::write(path, to_string(cfg)?)
        .map_err(|e| Error::msg(format!("failed to write config {}: {e}", path.display())))
}

/// Reads and merges several configuration files, then validates the result.
pub fn load_all<P: AsRef<Path>>(paths: &[P]) -> Result<Config> {
    let configs = paths
        .iter()
        .map(|p| read(p.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    let merged = merge(configs)?;
    validate(&merged)?;
    Ok(merged)
}

pub fn merge(configs: impl IntoIterator<Item = Config>) -> Result<Config> {
    fn take<T>(
        into: &mut BTreeMap<String, T>,
        from: BTreeMap<String, T>,
        kind: &str,
    ) -> Result<()> {
        for (id, v) in from {
            if into.contains_key(&id) {
                return Err(Error::new(
                    ErrorKind::FailedValidation,
                    format!("{kind} module '{id}' is defined in more than one configuration"),
                ));
            }
            into.insert(id, v);
        }
        Ok(())
    }

    let mut out = Config::default();
    for c in configs {
        take(&mut out.coreboot, c.coreboot, "coreboot")?;
        take(&mut out.linux, c.linux, "linux")?;
        take(&mut out.edk2, c.edk2, "edk2")?;
        take(&mut out.uboot, c.uboot, "uboot")?;
        take(&mut out.uroot, c.uroot, "uroot")?;
        take(&mut out.universal, c.universal, "universal")?;
        take(&mut out.firmware_stitching, c.firmware_stitching, "firmware_stitching")?;
    }
    // Same id under two different kinds.
    out.modules()?;
    Ok(out)
}

/// One example module of every kind.
pub fn template() -> Config {
    fn common(kind: &str, depends: &[&str]) -> CommonOpts {
        CommonOpts {
            sdk_source: format!("registry.example.com/firmware/{kind}:latest"),
            repo_path: format!("${{PWD}}/{kind}/"),
            output_dir: format!("output-{kind}/"),
            depends: depends.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    let mut cfg = Config::default();
    cfg.uroot.insert(
        "u-root-example".into(),
        URootOpts {
            common: CommonOpts {
                container_output_files: vec!["initramfs.cpio".into()],
                ..common("uroot", &[])
            },
            build_command: "go build; GOARCH=amd64 ./u-root -defaultsh gosh -o initramfs.cpio boot coreboot-app ./cmds/core/*".into(),
        },
    );
    cfg.linux.insert(
        "linux-example".into(),
        LinuxOpts {
            common: CommonOpts {
                container_output_files: vec!["vmlinux".into(), "defconfig".into()],
                ..common("linux", &["u-root-example"])
            },
            arch: "x86_64".into(),
            defconfig_path: "linux_defconfig".into(),
        },
    );
    cfg.uboot.insert(
        "u-boot-example".into(),
        UBootOpts {
            common: CommonOpts {
                container_output_files: vec!["u-boot".into(), "u-boot.bin".into()],
                ..common("uboot", &[])
            },
            arch: "arm64".into(),
            defconfig_path: "qemu_arm64_defconfig".into(),
        },
    );
    cfg.edk2.insert(
        "edk2-example".into(),
        Edk2Opts {
            common: CommonOpts {
                container_output_dirs: vec!["Build/".into()],
                ..common("edk2", &[])
            },
            arch: "X64".into(),
            build_commands: vec![
                "source ./edksetup.sh; build -a X64 -p OvmfPkg/OvmfPkgX64.dsc -b RELEASE -t GCC5"
                    .into(),
            ],
        },
    );
    cfg.coreboot.insert(
        "coreboot-example".into(),
        CorebootOpts {
            common: CommonOpts {
                container_output_files: vec!["build/coreboot.rom".into(), "defconfig".into()],
                ..common("coreboot", &["linux-example"])
            },
            defconfig_path: "seabios_defconfig".into(),
            blobs: BTreeMap::from([(
                "CONFIG_PAYLOAD_FILE".into(),
                "output-linux/vmlinux".into(),
            )]),
        },
    );
    cfg.universal.insert(
        "universal-example".into(),
        UniversalOpts {
            common: CommonOpts {
                container_output_files: vec!["artifact.bin".into()],
                ..common("universal", &[])
            },
            build_commands: vec!["echo 'hello' > artifact.bin".into()],
        },
    );
    cfg.firmware_stitching.insert(
        "stitching-example".into(),
        FirmwareStitchingOpts {
            common: CommonOpts {
                container_output_files: vec!["new_descriptor.bin".into()],
                ..common("stitching", &["coreboot-example"])
            },
            base_file_path: "stitching/descriptor.bin".into(),
            platform: String::new(),
            inject_commands: vec![InjectEntry {
                path: "stitching/me.bin".into(),
                target_region: "ME".into(),
                optional_arguments: Vec::new(),
                ignore_if_missing: true,
            }],
        },
    );
    cfg
}

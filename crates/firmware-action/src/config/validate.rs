use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::fsutil;
use crate::modules::{FirmwareModule, Module, known_arch};

/// Static checks on a freshly read configuration.
pub fn validate(cfg: &Config) -> Result<()> {
    let modules = cfg.modules()?;
    for (id, m) in &modules {
        check_module(id, m)?;
    }
    check_output_dirs(&modules)
}

fn check_module(id: &str, m: &Module) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::new(
            ErrorKind::FailedValidation,
            format!("a {} module has an empty identifier", m.kind()),
        ));
    }
    let missing = m.missing_fields();
    if !missing.is_empty() {
        return Err(Error::new(
            ErrorKind::FailedValidation,
            format!(
                "{} module '{id}' is missing required field(s): {}",
                m.kind(),
                missing.join(", ")
            ),
        ));
    }

    let workdir = m.common().container_workdir.trim();
    if !workdir.starts_with('/') || Path::new(workdir) == Path::new("/") {
        return Err(Error::new(
            ErrorKind::FailedValidation,
            format!("module '{id}': container_workdir must be an absolute path other than '/' (got '{workdir}')"),
        ));
    }

    let arch = match m {
        Module::Linux(o) => Some(&o.arch),
        Module::UBoot(o) => Some(&o.arch),
        _ => None,
    };
    if let Some(arch) = arch.filter(|a| !known_arch(a)) {
        return Err(Error::new(
            ErrorKind::FailedValidation,
            format!("module '{id}': unsupported arch '{arch}' (expected one of i386, amd64, arm, arm64)"),
        ));
    }

    // Outputs are exported by basename, so a path listed as both would land twice.
    let common = m.common();
    for f in &common.container_output_files {
        let f_norm = f.trim_end_matches('/');
        if common
            .container_output_dirs
            .iter()
            .any(|d| d.trim_end_matches('/') == f_norm)
        {
            return Err(Error::new(
                ErrorKind::FailedValidation,
                format!("module '{id}': '{f}' is listed as both an output file and an output directory"),
            ));
        }
    }
    Ok(())
}

fn check_output_dirs(modules: &BTreeMap<String, Module>) -> Result<()> {
    let dirs: Vec<(&str, PathBuf)> = modules
        .iter()
        .map(|(id, m)| (id.as_str(), fsutil::normalize(Path::new(&m.common().output_dir))))
        .collect();

    for (i, (a_id, a)) in dirs.iter().enumerate() {
        for (b_id, b) in &dirs[i + 1..] {
            if a == b {
                return Err(Error::new(
                    ErrorKind::DuplicateOutputDirs,
                    format!("'{a_id}' and '{b_id}' both write to {}", a.display()),
                ));
            }
            let (outer, outer_id, inner, inner_id) = if b.starts_with(a) {
                (a, a_id, b, b_id)
            } else if a.starts_with(b) {
                (b, b_id, a, a_id)
            } else {
                continue;
            };
            return Err(Error::new(
                ErrorKind::NestedOutputDirs,
                format!(
                    "output of '{inner_id}' ({}) is inside output of '{outer_id}' ({})",
                    inner.display(),
                    outer.display()
                ),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{CommonOpts, LinuxOpts, UniversalOpts};

    fn universal(output: &str) -> UniversalOpts {
        UniversalOpts {
            common: CommonOpts {
                sdk_source: "ghcr.io/example/universal:main".into(),
                repo_path: ".".into(),
                output_dir: output.into(),
                ..Default::default()
            },
            build_commands: vec!["true".into()],
        }
    }

    fn config(outputs: &[(&str, &str)]) -> Config {
        let mut cfg = Config::default();
        for (id, out) in outputs {
            cfg.universal.insert(id.to_string(), universal(out));
        }
        cfg
    }

    #[test]
    fn nested_output_dirs_fail() {
        let cfg = config(&[("a", "output/"), ("b", "output/linux/")]);
        assert!(validate(&cfg).unwrap_err().is(ErrorKind::NestedOutputDirs));

        let cfg = config(&[("a", "output/coreboot/"), ("b", "output/linux/")]);
        validate(&cfg).expect("siblings are fine");

        // Prefix of the string but not of the path.
        let cfg = config(&[("a", "output/lin"), ("b", "output/linux")]);
        validate(&cfg).expect("not nested");
    }

    #[test]
    fn duplicate_output_dirs_fail() {
        let cfg = config(&[("a", "output/x"), ("b", "./output/x/")]);
        assert!(validate(&cfg).unwrap_err().is(ErrorKind::DuplicateOutputDirs));
    }

    #[test]
    fn required_fields_and_workdir() {
        let mut cfg = config(&[("a", "out-a")]);
        cfg.universal.get_mut("a").unwrap().common.sdk_source.clear();
        let err = validate(&cfg).unwrap_err();
        assert!(err.is(ErrorKind::FailedValidation));
        assert!(err.to_string().contains("sdk_source"), "{err}");

        for bad in ["/", "relative/dir"] {
            let mut cfg = config(&[("a", "out-a")]);
            cfg.universal.get_mut("a").unwrap().common.container_workdir = bad.into();
            assert!(validate(&cfg).unwrap_err().is(ErrorKind::FailedValidation));
        }
    }

    #[test]
    fn overlapping_outputs_and_bad_arch() {
        let mut cfg = config(&[("a", "out-a")]);
        let common = &mut cfg.universal.get_mut("a").unwrap().common;
        common.container_output_files = vec!["build".into()];
        common.container_output_dirs = vec!["build/".into()];
        assert!(validate(&cfg).unwrap_err().is(ErrorKind::FailedValidation));

        let mut cfg = Config::default();
        cfg.linux.insert(
            "linux".into(),
            LinuxOpts {
                common: universal("out-linux").common,
                arch: "sparc".into(),
                defconfig_path: "linux_defconfig".into(),
            },
        );
        assert!(validate(&cfg).unwrap_err().is(ErrorKind::FailedValidation));
        cfg.linux.get_mut("linux").unwrap().arch = "x86_64".into();
        validate(&cfg).expect("valid");
    }
}

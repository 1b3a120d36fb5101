use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{BuildResult, CommonOpts, FirmwareModule, file_name, run_in_container};
use crate::container::Container;
use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::fsutil::{self, PathKind};

const DENSITY_FIELDS: [&str; 2] = ["Component 1 Density", "Component 2 Density"];
const ERASED: u8 = 0xFF;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectEntry {
    pub path: String,
    /// IFD region name, e.g. `ME` or `BIOS`.
    pub target_region: String,
    /// Extra `ifdtool` arguments placed before `--inject`.
    pub optional_arguments: Vec<String>,
    pub ignore_if_missing: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareStitchingOpts {
    #[serde(flatten)]
    pub common: CommonOpts,
    pub base_file_path: String,
    /// `ifdtool -p` platform, e.g. `adl`.
    pub platform: String,
    pub inject_commands: Vec<InjectEntry>,
}

impl FirmwareStitchingOpts {
    pub fn image_name(&self) -> Result<String> {
        Ok(format!("new_{}", file_name(&self.base_file_path)?))
    }

    fn ifdtool(&self) -> Vec<String> {
        let mut argv = vec!["ifdtool".to_string()];
        if !self.platform.trim().is_empty() {
            argv.push("-p".into());
            argv.push(self.platform.trim().into());
        }
        argv
    }

    /// Entries whose blob exists on the host; missing optional blobs are skipped.
    fn plan(&self) -> Result<Vec<&InjectEntry>> {
        let base = file_name(&self.base_file_path)?;
        let mut seen = BTreeSet::from([base]);
        for entry in &self.inject_commands {
            let name = file_name(&entry.path)?;
            if !seen.insert(name.clone()) {
                return Err(Error::new(
                    ErrorKind::Exist,
                    format!("more than one stitching input is named '{name}'"),
                ));
            }
        }

        let mut out = Vec::new();
        for entry in &self.inject_commands {
            match fsutil::path_kind(Path::new(&entry.path))? {
                PathKind::File => out.push(entry),
                PathKind::Missing if entry.ignore_if_missing => {
                    tracing::warn!(
                        region = %entry.target_region,
                        "blob '{}' not found, leaving region untouched",
                        entry.path
                    );
                }
                PathKind::Missing => {
                    return Err(Error::new(
                        ErrorKind::NotExist,
                        format!("blob '{}' for region {}", entry.path, entry.target_region),
                    ));
                }
                PathKind::Dir => {
                    return Err(Error::new(ErrorKind::PathIsDirectory, entry.path.clone()));
                }
            }
        }
        Ok(out)
    }

    fn steps(&self, ctx: &ExecCtx, c: &Container, entries: &[&InjectEntry]) -> Result<()> {
        let base_host = Path::new(&self.base_file_path);
        let base = file_name(&self.base_file_path)?;
        c.copy_in(ctx, base_host, &c.path(&base))?;
        for entry in entries {
            c.copy_in(ctx, Path::new(&entry.path), &c.path(&file_name(&entry.path)?))?;
        }

        let mut dump = self.ifdtool();
        dump.extend(["--dump".to_string(), base.clone()]);
        let out = c.output(ctx, &as_strs(&dump))?;
        let [first, second] = extract_size(&out)?;
        let declared = first + second;
        ctx.log(&format!("IFD declares {declared} bytes of flash"));

        let raw = fs::read(base_host)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", base_host.display())))?;
        let image = inflate(&raw, declared)?;
        let scratch = tempfile::tempdir()?;
        let name = self.image_name()?;
        let local = scratch.path().join(&name);
        fs::write(&local, &image)
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", local.display())))?;
        c.copy_in(ctx, &local, &c.path(&name))?;

        for entry in entries {
            let mut argv = self.ifdtool();
            argv.extend(entry.optional_arguments.iter().cloned());
            argv.push("--inject".into());
            argv.push(format!(
                "{}:{}",
                entry.target_region,
                file_name(&entry.path)?
            ));
            argv.push(name.clone());
            c.exec(ctx, &as_strs(&argv))?;
            c.exec(ctx, &["mv", &format!("{name}.new"), &name])?;
        }
        Ok(())
    }
}

fn as_strs(v: &[String]) -> Vec<&str> {
    v.iter().map(String::as_str).collect()
}

impl FirmwareModule for FirmwareStitchingOpts {
    fn kind(&self) -> &'static str {
        "firmware_stitching"
    }

    fn common(&self) -> &CommonOpts {
        &self.common
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let mut out = self.common.missing_fields();
        if self.base_file_path.trim().is_empty() {
            out.push("base_file_path");
        }
        for entry in &self.inject_commands {
            if entry.path.trim().is_empty() {
                out.push("inject_commands.path");
            }
            if entry.target_region.trim().is_empty() {
                out.push("inject_commands.target_region");
            }
        }
        out
    }

    fn sources(&self) -> Vec<PathBuf> {
        let mut out = self.common.sources();
        out.push(PathBuf::from(&self.base_file_path));
        out.extend(self.inject_commands.iter().map(|e| PathBuf::from(&e.path)));
        out
    }

    fn build(&self, ctx: &ExecCtx) -> BuildResult {
        fsutil::check_is_file(Path::new(&self.base_file_path))?;
        let entries = self.plan()?;
        run_in_container(ctx, &self.common, Vec::new(), &self.artifacts(), |ctx, c| {
            self.steps(ctx, c, &entries)
        })?;

        let exported = Path::new(&self.common.output_dir).join(self.image_name()?);
        if let Ok(bytes) = fs::read(&exported) {
            tracing::info!(
                image = %exported.display(),
                sha256 = %hex::encode(Sha256::digest(&bytes)),
                "stitched image"
            );
        }
        Ok(())
    }
}

/// Component 1 and 2 flash sizes from `ifdtool --dump` output.
pub fn extract_size(dump: &str) -> Result<[u64; 2]> {
    let mut out = [0u64; 2];
    for (i, field) in DENSITY_FIELDS.iter().enumerate() {
        let re = Regex::new(&format!(r"{}:\s*(\w+)", regex::escape(field)))
            .map_err(|e| Error::msg(format!("invalid density pattern: {e}")))?;
        match re.captures(dump).and_then(|c| c.get(1)) {
            Some(m) => out[i] = parse_size(m.as_str())?,
            None if i == 0 => {
                return Err(Error::new(
                    ErrorKind::FailedToDetectRomSize,
                    format!("'{field}' not found in ifdtool output"),
                ));
            }
            None => {}
        }
    }
    Ok(out)
}

/// Parses a density token such as `16MB`, `512KB` or `UNUSED`.
pub fn parse_size(token: &str) -> Result<u64> {
    let token: String = token.chars().filter(|c| !c.is_whitespace()).collect();
    if token.eq_ignore_ascii_case("unused") {
        return Ok(0);
    }
    let unit_re = Regex::new(r"([kKMGT])B$")
        .map_err(|e| Error::msg(format!("invalid unit pattern: {e}")))?;
    let token = unit_re.replace(&token, "${1}iB");

    let split = token
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(token.len());
    let (num, unit) = token.split_at(split);
    let bad = || {
        Error::new(
            ErrorKind::FailedToDetectRomSize,
            format!("unrecognized flash size '{token}'"),
        )
    };
    let n: u64 = num.parse().map_err(|_| bad())?;
    let mult: u64 = match unit {
        "" | "B" => 1,
        "kiB" | "KiB" => 1 << 10,
        "MiB" => 1 << 20,
        "GiB" => 1 << 30,
        "TiB" => 1 << 40,
        _ => return Err(bad()),
    };
    n.checked_mul(mult).ok_or_else(bad)
}

pub fn inflate(base: &[u8], size: u64) -> Result<Vec<u8>> {
    let len = base.len() as u64;
    if len > size {
        return Err(Error::new(
            ErrorKind::BaseFileBiggerThanIfd,
            format!("base file has {len} bytes, IFD declares {size}"),
        ));
    }
    let size = usize::try_from(size)
        .map_err(|_| Error::msg(format!("flash size {size} does not fit in memory")))?;
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(base);
    out.resize(size, ERASED);
    Ok(out)
}

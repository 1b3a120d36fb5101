use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use crate::error::{Error, ErrorKind, Result};
use crate::executor::BuildReport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiInputs {
    pub config: Vec<PathBuf>,
    pub target: String,
    pub recursive: bool,
    pub json: bool,
}

pub fn detected() -> bool {
    std::env::var_os("GITHUB_ACTIONS").is_some()
}

pub fn inputs() -> Result<CiInputs> {
    from_lookup(|name| std::env::var(name).ok())
}

/// Reads inputs through `lookup` (the runner upper-cases input names).
pub fn from_lookup<F>(lookup: F) -> Result<CiInputs>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(&format!("INPUT_{}", name.to_ascii_uppercase()));

    let config: Vec<PathBuf> = get("config")
        .unwrap_or_default()
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(PathBuf::from)
        .collect();
    if config.is_empty() {
        return Err(Error::new(ErrorKind::FailedValidation, "input 'config' is empty"));
    }
    let target = get("target").unwrap_or_default().trim().to_string();
    if target.is_empty() {
        return Err(Error::new(ErrorKind::FailedValidation, "input 'target' is empty"));
    }
    Ok(CiInputs {
        config,
        target,
        recursive: parse_bool("recursive", get("recursive"))?,
        json: parse_bool("json", get("json"))?,
    })
}

fn parse_bool(name: &str, raw: Option<String>) -> Result<bool> {
    match raw.as_deref().map(str::trim).unwrap_or("") {
        "" | "false" | "False" | "FALSE" | "0" => Ok(false),
        "true" | "True" | "TRUE" | "1" => Ok(true),
        other => Err(Error::new(
            ErrorKind::FailedValidation,
            format!("input '{name}' must be true or false, got '{other}'"),
        )),
    }
}

/// Appends a markdown summary to `$GITHUB_STEP_SUMMARY` when the runner provides one.
pub fn write_step_summary(report: &BuildReport) -> Result<()> {
    let Some(path) = std::env::var_os("GITHUB_STEP_SUMMARY") else {
        return Ok(());
    };
    let mut md = String::from("| Module | Status |\n|---|---|\n");
    for r in &report.results {
        md.push_str(&format!("| {} | {} |\n", r.module, r.status));
    }
    let mut f = OpenOptions::new().create(true).append(true).open(&path)?;
    f.write_all(md.as_bytes())?;
    Ok(())
}

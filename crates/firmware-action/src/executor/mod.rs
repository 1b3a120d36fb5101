use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Instant;

use serde::Serialize;

use crate::checkpoints::{ChangeDetector, StateDir, TimestampDetector};
use crate::config::Config;
use crate::container::{Container, ssh};
use crate::error::{Error, ErrorKind, Result};
use crate::fsutil::{self, PathKind};
use crate::graph::Graph;
use crate::modules::{BuildFailure, FirmwareModule, Module};

pub mod context;

pub use context::ExecCtx;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Success,
    #[serde(rename = "Up-to-date")]
    UpToDate,
    Fail,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Success => "Success",
            Status::UpToDate => "Up-to-date",
            Status::Fail => "Fail",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleResult {
    pub module: String,
    pub status: Status,
    pub elapsed_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-module outcomes of one invocation.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub results: Vec<ModuleResult>,
    /// The failure that stopped the queue, if any.
    pub error: Option<Error>,
}

impl BuildReport {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn status_of(&self, module: &str) -> Option<Status> {
        self.results
            .iter()
            .find(|r| r.module == module)
            .map(|r| r.status)
    }

    fn push(&mut self, module: &str, status: Status, started: Instant, error: Option<&Error>) {
        self.results.push(ModuleResult {
            module: module.to_string(),
            status,
            elapsed_secs: started.elapsed().as_secs(),
            error: error.map(ToString::to_string),
        });
    }

    pub fn summary_table(&self) -> String {
        let width = self
            .results
            .iter()
            .map(|r| r.module.len())
            .chain(["MODULE".len()])
            .max()
            .unwrap_or_default();
        let mut out = format!("{:<width$}  {:<10}  {}\n", "MODULE", "STATUS", "TIME");
        for r in &self.results {
            out.push_str(&format!(
                "{:<width$}  {:<10}  {}\n",
                r.module,
                r.status.to_string(),
                format_elapsed_hms(r.elapsed_secs)
            ));
        }
        out
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "results": self.results,
            "error": self.error.as_ref().map(ToString::to_string),
        })
    }
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Drives module builds in dependency order.
pub struct Executor {
    modules: BTreeMap<String, Module>,
    graph: Graph,
    state: StateDir,
    detectors: Vec<Box<dyn ChangeDetector>>,
    timestamps: TimestampDetector,
}

impl Executor {
    pub fn new(cfg: &Config, state: StateDir) -> Result<Self> {
        let modules = cfg.modules()?;
        let mut graph = Graph::new();
        for id in modules.keys() {
            graph.add_vertex(id);
        }
        for (id, m) in &modules {
            for dep in m.depends() {
                graph.add_edge(id, dep)?;
            }
        }
        let outputs: Vec<PathBuf> = modules
            .values()
            .map(|m| PathBuf::from(&m.common().output_dir))
            .collect();
        Ok(Self {
            detectors: state.detectors(&outputs),
            timestamps: TimestampDetector::new(state.clone()),
            modules,
            graph,
            state,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn run(&self, ctx: &mut ExecCtx, target: &str, recursive: bool) -> BuildReport {
        let mut report = BuildReport::default();
        let order = match self
            .state
            .create()
            .and_then(|()| self.graph.build_order(target, recursive))
        {
            Ok(order) => order,
            Err(e) => {
                report.error = Some(e);
                return report;
            }
        };
        tracing::info!(target, recursive, "build order: {}", order.join(" -> "));

        for id in &order {
            let Some(module) = self.modules.get(id) else {
                continue;
            };
            ctx.set_module(id.as_str());
            let started = Instant::now();

            match self.build_one(ctx, id, module) {
                Ok(()) => report.push(id, Status::Success, started, None),
                Err(BuildFailure { error, .. }) if error.is(ErrorKind::BuildUpToDate) => {
                    ctx.log(&error.to_string());
                    report.push(id, Status::UpToDate, started, None);
                }
                Err(BuildFailure { error, container }) => {
                    tracing::error!(module = %id, "build failed: {error}");
                    report.push(id, Status::Fail, started, Some(&error));
                    if ctx.interactive {
                        if let Some(c) = container.as_ref() {
                            if let Err(e) = debug_session(ctx, c) {
                                tracing::warn!(module = %id, "interactive session failed: {e}");
                            }
                        }
                    }
                    report.error = Some(Error::new(
                        error.kind(),
                        format!("module '{id}': {}", error.message()),
                    ));
                    break;
                }
            }
        }
        report
    }

    fn build_one(
        &self,
        ctx: &ExecCtx,
        id: &str,
        module: &Module,
    ) -> std::result::Result<(), BuildFailure> {
        ctx.check_cancelled()?;
        let out = Path::new(&module.common().output_dir);
        let changed = self.changed(id, module)?;

        let out_kind = fsutil::path_kind(out)?;
        let has_output = out_kind == PathKind::Dir && !fsutil::dir_is_empty(out)?;
        if !changed && has_output {
            return Err(Error::new(ErrorKind::BuildUpToDate, out.display().to_string()).into());
        }
        match out_kind {
            PathKind::Dir if has_output => {
                ctx.log(&format!("removing stale output {}", out.display()));
                fs::remove_dir_all(out).map_err(|e| {
                    Error::msg(format!("failed to clean {}: {e}", out.display()))
                })?;
            }
            PathKind::File => {
                return Err(Error::new(
                    ErrorKind::Exist,
                    format!("output_dir {} is a file", out.display()),
                )
                .into());
            }
            _ => {}
        }

        self.check_dependency_outputs(id, module)?;

        ctx.log(&format!("building {} module", module.kind()));
        module.build(ctx)?;

        for d in &self.detectors {
            d.save_checkpoint(id, module).map_err(|e| {
                e.wrap(ErrorKind::Other, format!("saving {} checkpoint", d.name()))
            })?;
        }
        ctx.log("build finished");
        Ok(())
    }

    /// Detector verdicts plus dependency freshness.
    fn changed(&self, id: &str, module: &Module) -> Result<bool> {
        for d in &self.detectors {
            if d.detect_changes(id, module)? {
                tracing::info!(module = %id, detector = d.name(), "change detected");
                return Ok(true);
            }
        }
        let Some(own) = self.timestamps.recorded(id)? else {
            return Ok(true);
        };
        for dep in module.depends() {
            if let Some(dep_at) = self.timestamps.recorded(dep)? {
                if dep_at > own {
                    tracing::info!(module = %id, dependency = %dep, "dependency rebuilt since last build");
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn check_dependency_outputs(&self, id: &str, module: &Module) -> Result<()> {
        for dep in module.depends() {
            let Some(dep_module) = self.modules.get(dep) else {
                return Err(Error::new(
                    ErrorKind::DependencyTreeUndefDep,
                    format!("module '{id}' depends on undefined module '{dep}'"),
                ));
            };
            for expected in dep_module.common().expected_outputs() {
                if fsutil::path_kind(&expected)? == PathKind::Missing {
                    return Err(Error::new(
                        ErrorKind::DependencyOutputMissing,
                        format!(
                            "module '{id}' needs {} from '{dep}'",
                            expected.display()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Exposes the failed container over SSH until the user presses Enter.
fn debug_session(ctx: &ExecCtx, container: &Container) -> Result<()> {
    let (ready_tx, ready_rx) = mpsc::sync_channel(1);
    let (done_tx, done_rx) = mpsc::sync_channel::<()>(1);

    std::thread::scope(|s| {
        let server = s.spawn(|| ssh::serve(ctx, container, ready_tx, done_rx));

        match ready_rx.recv() {
            Ok(Ok(info)) => {
                tracing::warn!("failed container is reachable: {info}");
                eprintln!("Press Enter to stop the SSH service and continue");
                let mut line = String::new();
                let _ = std::io::stdin().lock().read_line(&mut line);
            }
            Ok(Err(e)) => tracing::warn!("could not expose container: {e}"),
            Err(_) => {}
        }
        let _ = done_tx.send(());
        server
            .join()
            .map_err(|_| Error::msg("ssh service thread panicked"))?
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{CommonOpts, UniversalOpts};
    use chrono::{TimeDelta, Utc};

    fn universal(out: &Path, depends: &[&str]) -> UniversalOpts {
        UniversalOpts {
            common: CommonOpts {
                sdk_source: "registry.example.com/firmware/universal:latest".into(),
                repo_path: out.parent().unwrap().join("repo").display().to_string(),
                output_dir: out.display().to_string(),
                container_output_files: vec!["artifact.bin".into()],
                depends: depends.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            build_commands: vec!["echo hi > artifact.bin".into()],
        }
    }

    #[test]
    fn unknown_target_is_reported() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut cfg = Config::default();
        cfg.universal
            .insert("a".into(), universal(&tmp.path().join("out-a"), &[]));
        let exec = Executor::new(&cfg, StateDir::new(tmp.path().join("state"))).expect("executor");
        let report = exec.run(&mut ExecCtx::default(), "b", false);
        assert!(report.results.is_empty());
        assert!(
            report
                .error
                .expect("error")
                .is(ErrorKind::DependencyTreeUndefTarget)
        );
    }

    #[test]
    fn missing_dependency_output_aborts_before_container() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut cfg = Config::default();
        cfg.universal
            .insert("dep".into(), universal(&tmp.path().join("out-dep"), &[]));
        cfg.universal.insert(
            "top".into(),
            universal(&tmp.path().join("out-top"), &["dep"]),
        );
        let exec = Executor::new(&cfg, StateDir::new(tmp.path().join("state"))).expect("executor");
        let report = exec.run(&mut ExecCtx::default(), "top", false);
        assert_eq!(report.status_of("top"), Some(Status::Fail));
        let err = report.error.expect("error");
        assert!(err.is(ErrorKind::DependencyOutputMissing), "{err}");
        assert!(err.to_string().contains("artifact.bin"), "{err}");
    }

    #[test]
    fn unchanged_module_with_output_is_up_to_date() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(tmp.path().join("repo")).unwrap();
        let out = tmp.path().join("out-a");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("artifact.bin"), "hi").unwrap();

        let mut cfg = Config::default();
        cfg.universal.insert("a".into(), universal(&out, &[]));
        let state = StateDir::new(tmp.path().join("state"));
        let exec = Executor::new(&cfg, state.clone()).expect("executor");

        let module = cfg.modules().unwrap().remove("a").unwrap();
        state.create().unwrap();
        for d in state.detectors(&[]) {
            d.save_checkpoint("a", &module).unwrap();
        }

        let report = exec.run(&mut ExecCtx::default(), "a", true);
        assert!(report.ok(), "{:?}", report.error);
        assert_eq!(report.status_of("a"), Some(Status::UpToDate));
        assert!(out.join("artifact.bin").is_file());
    }

    fn save_all(state: &StateDir, cfg: &Config, id: &str) {
        let module = cfg.modules().unwrap().remove(id).unwrap();
        state.create().unwrap();
        for d in state.detectors(&[]) {
            d.save_checkpoint(id, &module).unwrap();
        }
    }

    // `top` depends on `dep`, whose outputs are never produced here, so any
    // attempt to rebuild `top` stops at the dependency check.
    fn top_with_missing_dep(tmp: &Path, top_out: &Path) -> Config {
        let mut cfg = Config::default();
        cfg.universal
            .insert("dep".into(), universal(&tmp.join("out-dep"), &[]));
        cfg.universal
            .insert("top".into(), universal(top_out, &["dep"]));
        cfg
    }

    #[test]
    fn newer_dependency_forces_rebuild() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let out = tmp.path().join("out-top");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("artifact.bin"), "old").unwrap();
        let cfg = top_with_missing_dep(tmp.path(), &out);
        let state = StateDir::new(tmp.path().join("state"));
        save_all(&state, &cfg, "top");
        let exec = Executor::new(&cfg, state.clone()).expect("executor");

        let report = exec.run(&mut ExecCtx::default(), "top", false);
        assert_eq!(report.status_of("top"), Some(Status::UpToDate));

        TimestampDetector::new(state)
            .save_at("dep", Utc::now() + TimeDelta::seconds(60))
            .unwrap();
        let report = exec.run(&mut ExecCtx::default(), "top", false);
        assert_eq!(report.status_of("top"), Some(Status::Fail));
        assert!(report.error.expect("error").is(ErrorKind::DependencyOutputMissing));
        assert!(!out.exists(), "stale output is cleaned before rebuilding");
    }

    #[test]
    fn empty_output_dir_is_not_up_to_date() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let out = tmp.path().join("out-top");
        fs::create_dir_all(&out).unwrap();
        let cfg = top_with_missing_dep(tmp.path(), &out);
        let state = StateDir::new(tmp.path().join("state"));
        save_all(&state, &cfg, "top");
        let exec = Executor::new(&cfg, state).expect("executor");

        let report = exec.run(&mut ExecCtx::default(), "top", false);
        assert_eq!(report.status_of("top"), Some(Status::Fail));
        assert!(report.error.expect("error").is(ErrorKind::DependencyOutputMissing));
    }

    #[test]
    fn config_change_removes_stale_output() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let out = tmp.path().join("out-top");
        fs::create_dir_all(out.join("sub")).unwrap();
        fs::write(out.join("artifact.bin"), "old").unwrap();
        fs::write(out.join("sub/leftover"), "old").unwrap();
        let cfg = top_with_missing_dep(tmp.path(), &out);
        let state = StateDir::new(tmp.path().join("state"));
        save_all(&state, &cfg, "top");

        let mut changed = cfg.clone();
        if let Some(top) = changed.universal.get_mut("top") {
            top.build_commands = vec!["make all".into()];
        }
        let exec = Executor::new(&changed, state).expect("executor");
        let report = exec.run(&mut ExecCtx::default(), "top", false);
        assert_eq!(report.status_of("top"), Some(Status::Fail));
        assert!(!out.exists());
    }

    #[test]
    fn cycles_are_rejected_at_construction() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut cfg = Config::default();
        cfg.universal
            .insert("a".into(), universal(&tmp.path().join("out-a"), &["b"]));
        cfg.universal
            .insert("b".into(), universal(&tmp.path().join("out-b"), &["a"]));
        let err = Executor::new(&cfg, StateDir::new(tmp.path().join("state")))
            .err()
            .expect("cycle");
        assert!(err.is(ErrorKind::DependencyTreeUndefDep));
    }

    #[test]
    fn summary_table_aligns_columns() {
        let mut report = BuildReport::default();
        let now = Instant::now();
        report.push("coreboot-example", Status::Success, now, None);
        report.push("u-root", Status::UpToDate, now, None);
        let table = report.summary_table();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("MODULE            STATUS"));
        assert!(lines[2].starts_with("u-root            Up-to-date"));

        let json = report.to_json();
        assert_eq!(json["results"][1]["status"], "Up-to-date");
        assert!(json["error"].is_null());
    }
}

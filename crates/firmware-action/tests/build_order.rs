use firmware_action::ErrorKind;
use firmware_action::checkpoints::StateDir;
use firmware_action::config::Config;
use firmware_action::executor::{ExecCtx, Executor};
use firmware_action::graph::Graph;
use firmware_action::modules::{CommonOpts, UniversalOpts};

// pizza needs dough and cheese; dough needs flour and water; cheese needs milk; milk needs water.
fn pizza() -> Graph {
    let mut g = Graph::new();
    for id in ["pizza", "dough", "cheese", "flour", "water", "milk"] {
        g.add_vertex(id);
    }
    for (from, to) in [
        ("pizza", "dough"),
        ("pizza", "cheese"),
        ("dough", "flour"),
        ("dough", "water"),
        ("cheese", "milk"),
        ("milk", "water"),
    ] {
        g.add_edge(from, to).expect("edge");
    }
    g
}

fn position(order: &[String], id: &str) -> usize {
    order.iter().position(|x| x == id).expect("present")
}

#[test]
fn recursive_order_puts_dependencies_first() {
    let order = pizza().build_order("pizza", true).expect("order");
    assert_eq!(order.len(), 6);
    assert_eq!(order.last().map(String::as_str), Some("pizza"));
    assert!(position(&order, "flour") < position(&order, "dough"));
    assert!(position(&order, "water") < position(&order, "dough"));
    assert!(position(&order, "milk") < position(&order, "cheese"));
    assert!(position(&order, "water") < position(&order, "milk"));
}

#[test]
fn subtree_target_excludes_unrelated_modules() {
    let order = pizza().build_order("cheese", true).expect("order");
    assert_eq!(order, vec!["water", "milk", "cheese"]);

    let single = pizza().build_order("cheese", false).expect("order");
    assert_eq!(single, vec!["cheese"]);
}

#[test]
fn cycles_are_refused() {
    let mut g = pizza();
    let err = g.add_edge("flour", "pizza").unwrap_err();
    assert!(err.is(ErrorKind::DependencyTreeUndefDep), "{err}");
}

fn module(id: &str, depends: &[&str]) -> UniversalOpts {
    UniversalOpts {
        common: CommonOpts {
            sdk_source: "ubuntu:latest".into(),
            repo_path: format!("repo-{id}"),
            output_dir: format!("out/{id}"),
            depends: depends.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        },
        build_commands: vec!["true".into()],
    }
}

#[test]
fn executor_rejects_undefined_dependency() {
    let mut cfg = Config::default();
    cfg.universal.insert("dough".into(), module("dough", &["flour"]));

    let tmp = tempfile::tempdir().expect("tempdir");
    let err = Executor::new(&cfg, StateDir::new(tmp.path().join("state")))
        .err()
        .expect("undefined dependency");
    assert!(err.is(ErrorKind::DependencyTreeUndefDep), "{err}");
}

#[test]
fn executor_reports_unknown_target() {
    let mut cfg = Config::default();
    cfg.universal.insert("flour".into(), module("flour", &[]));

    let tmp = tempfile::tempdir().expect("tempdir");
    let executor = Executor::new(&cfg, StateDir::new(tmp.path().join("state"))).expect("executor");
    let mut ctx = ExecCtx::new(false);
    let report = executor.run(&mut ctx, "pizza", true);

    assert!(!report.ok());
    assert!(report.results.is_empty());
    let err = report.error.expect("error");
    assert!(err.is(ErrorKind::DependencyTreeUndefTarget), "{err}");
}

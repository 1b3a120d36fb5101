use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use firmware_action::checkpoints::StateDir;
use firmware_action::container::Discontinued;
use firmware_action::executor::{BuildReport, ExecCtx, Executor};
use firmware_action::fsutil::{self, PathKind};
use firmware_action::logging::{self, LogOpts};
use firmware_action::{Error, ErrorKind, Result, ci, config};

#[derive(Debug, Parser)]
#[command(author, about, disable_version_flag = true)]
struct Args {
    /// Emit log records and the build report as JSON
    #[arg(long, global = true)]
    json: bool,
    /// Multi-line human-readable log records
    #[arg(long, global = true)]
    indent: bool,
    /// Debug logging with source locations
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build a target module (and optionally its dependencies)
    Build {
        /// Module id to build
        #[arg(long)]
        target: String,
        /// Build all dependencies of the target first
        #[arg(long)]
        recursive: bool,
        /// Config file; repeat to merge several
        #[arg(long, default_value = "firmware-action.json")]
        config: Vec<PathBuf>,
        /// Open an SSH session into the container when a build fails
        #[arg(long)]
        interactive: bool,
    },
    /// Write an example config with one module of each kind
    GenerateConfig {
        #[arg(long, default_value = "firmware-action.json")]
        config: PathBuf,
    },
    /// Print version information
    Version,
}

fn main() {
    dotenv::dotenv().ok();
    let args = Args::parse();

    // Under GitHub Actions inputs come from the environment, not argv.
    let ci_inputs = if args.cmd.is_none() && ci::detected() {
        match ci::inputs() {
            Ok(i) => Some(i),
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    logging::init(LogOpts {
        json: args.json || ci_inputs.as_ref().is_some_and(|i| i.json),
        indent: args.indent,
        debug: args.debug,
    });

    let res = match (args.cmd, ci_inputs) {
        (Some(Command::Build { target, recursive, config, interactive }), _) => {
            cmd_build(&config, &target, recursive, interactive, args.json)
        }
        (Some(Command::GenerateConfig { config }), _) => cmd_generate_config(&config),
        (Some(Command::Version), _) => {
            print_version();
            Ok(())
        }
        (None, Some(i)) => cmd_build(&i.config, &i.target, i.recursive, false, i.json),
        (None, None) => Err(Error::new(
            ErrorKind::FailedValidation,
            "no subcommand given (try --help)",
        )),
    };

    if let Err(e) = res {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn cmd_build(
    paths: &[PathBuf],
    target: &str,
    recursive: bool,
    interactive: bool,
    json: bool,
) -> Result<()> {
    let cfg = config::load_all(paths)?;
    let state = StateDir::default();
    let discontinued = Discontinued::load(state.root())?;

    let mut ctx = ExecCtx::new(interactive).with_discontinued(discontinued);
    {
        let handler_ctx = ctx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            tracing::warn!("interrupt received, stopping");
            handler_ctx.request_cancel();
        }) {
            tracing::warn!("failed to install interrupt handler: {e}");
        }
    }

    let executor = Executor::new(&cfg, state)?;
    let report = executor.run(&mut ctx, target, recursive);
    print_report(&report, json)?;
    if ci::detected() {
        if let Err(e) = ci::write_step_summary(&report) {
            tracing::warn!("failed to write step summary: {e}");
        }
    }

    match report.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn print_report(report: &BuildReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&report.to_json())?);
    } else {
        print!("{}", report.summary_table());
    }
    Ok(())
}

fn cmd_generate_config(path: &Path) -> Result<()> {
    if fsutil::path_kind(path)? != PathKind::Missing {
        return Err(Error::new(
            ErrorKind::Exist,
            format!("refusing to overwrite {}", path.display()),
        ));
    }
    config::write(path, &config::template())?;
    tracing::info!(path = %path.display(), "wrote example config");
    Ok(())
}

fn print_version() {
    println!("firmware-action {}", env!("CARGO_PKG_VERSION"));
    println!("commit: {}", option_env!("FIRMWARE_ACTION_COMMIT").unwrap_or("unknown"));
    println!("built: {}", option_env!("FIRMWARE_ACTION_BUILD_DATE").unwrap_or("unknown"));
}

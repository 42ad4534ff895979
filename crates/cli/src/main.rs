// # -----------------------------
// # crates/cli/src/main.rs
// # -----------------------------
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use relay_catalog::SelectionFilter;
use relay_cli::logging::{init_logging, LoggingOptions};
use relay_cli::{
    CleanupGuard, ExitCode, LaunchConfig, LaunchError, LaunchOrchestrator, LaunchOutcome,
    LaunchRequest, PromptSelector,
};
use relay_common::RelayPaths;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("RELAY_GIT_SHA"), ")");
const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("RELAY_GIT_SHA"),
    ")\nbuilt:    ",
    env!("RELAY_BUILD_TIME"),
    "\nbuild id: ",
    env!("RELAY_BUILD_ID")
);

#[derive(Parser, Debug)]
#[command(
    name = "launch",
    version = VERSION,
    long_version = LONG_VERSION,
    about = "Start the assistant CLI against a catalog provider, through a managed proxy when needed",
    long_about = None
)]
struct Cli {
    /// Provider key or display name; skips the provider prompt
    #[arg(long, value_name = "NAME")]
    provider: Option<String>,
    /// Model id; skips preferred-model matching and the model prompt
    #[arg(long, value_name = "ID")]
    model: Option<String>,
    /// Configuration file (overrides RELAY_CONFIG and the default locations)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Model filter: none, free or reasoning
    #[arg(long, value_name = "FILTER")]
    filter: Option<String>,
    /// Only print errors
    #[arg(long, short = 'q')]
    quiet: bool,
    /// Resolve everything and print the plan without starting anything
    #[arg(long = "dry-run")]
    dry_run: bool,
    /// Log level (trace, debug, info, warn, error, off). Overrides RUST_LOG if set.
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,
    /// Passed verbatim to the assistant
    #[arg(last = true, value_name = "ASSISTANT_ARGS")]
    assistant_args: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // --help and --version print to stdout and exit 0
        Err(err) if !err.use_stderr() => err.exit(),
        Err(err) => {
            let _ = err.print();
            std::process::exit(ExitCode::Configuration.as_i32());
        }
    };
    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let paths = match RelayPaths::from_env() {
        Ok(paths) => paths,
        Err(err) => return report(&LaunchError::Io(err)),
    };
    let env = |name: &str| std::env::var(name).ok();
    let mut config = match LaunchConfig::load(cli.config.as_deref(), &paths, env) {
        Ok((config, _)) => config,
        Err(err) => return report(&err),
    };
    if let Err(err) = config.apply_env(env) {
        return report(&err);
    }
    let filter = match cli
        .filter
        .as_deref()
        .map(str::parse::<SelectionFilter>)
        .transpose()
    {
        Ok(filter) => filter,
        Err(message) => return report(&LaunchError::Configuration(message)),
    };

    let logging = LoggingOptions {
        cli_level: cli.log_level.clone(),
        config_level: config.logging.level.clone(),
        quiet: cli.quiet,
        file_dir: config.logging.file.then(|| paths.log_dir.clone()),
        retain_files: config.logging.retain_files,
    };
    let log_guard = match init_logging(&logging) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Warning: logging disabled: {:#}", err);
            None
        }
    };
    tracing::debug!("launch starting with version {}", VERSION);
    tracing::debug!("build id: {}", env!("RELAY_BUILD_ID"));
    tracing::debug!("CLI arguments: {:?}", cli);

    let cleanup = Arc::new(CleanupGuard::new());
    if let Err(err) = cleanup.spawn_signal_listener() {
        tracing::warn!("signal handling unavailable: {}", err);
    }

    let request = LaunchRequest {
        provider: cli.provider,
        model: cli.model,
        filter,
        dry_run: cli.dry_run,
        assistant_args: cli.assistant_args,
    };
    let mut orchestrator =
        LaunchOrchestrator::new(config, paths, PromptSelector::stdio(), Arc::clone(&cleanup));
    let result = orchestrator.run(request).await;
    cleanup.run().await;

    let code = match result {
        Ok(LaunchOutcome::DryRun(plan)) => {
            print!("{}", plan.summary());
            let _ = std::io::stdout().flush();
            ExitCode::Success.as_i32()
        }
        Ok(LaunchOutcome::Exited { code }) => code,
        Err(err) => {
            tracing::debug!(stage = ?orchestrator.stage(), "launch failed: {}", err);
            report(&err)
        }
    };

    drop(log_guard);
    code
}

fn report(err: &LaunchError) -> i32 {
    eprintln!("error[{}]: {}", err.error_code(), err);
    if let Some(hint) = err.hint() {
        eprintln!("  hint: {}", hint);
    }
    let tail = err.log_tail();
    if !tail.is_empty() {
        eprintln!("  last proxy log lines:");
        for line in tail {
            eprintln!("    {}", line);
        }
    }
    err.exit_code().as_i32()
}

//! `iac` CLI entrypoint.
//!
//! Resolves flags, environment and `.env` values, then runs one of the
//! plan/apply/show/list commands. Plan identifiers and reports go to stdout;
//! logs, progress and errors go to stderr.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use iacplan::cli::{parse_args, write_block, Cli, Commands, OutputFormatter, ProviderKind};
use iacplan::config::{load_dotenv, ResourceLoader, Settings};
use iacplan::error::{ConfigError, IacError, Result};
use iacplan::planner::{
    cancel_pair, format_duration, handle_interrupts, ApplyExecutor, ApplyOptions, PlanGenerator,
};
use iacplan::provider::{CommandProvider, InfraProvider, LoggingProvider};
use iacplan::store::{PlanStore, StateStore};

use colored::Colorize;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    // Must run before parsing so clap sees `.env` values as environment.
    let dotenv = load_dotenv(Path::new("."));

    let cli = parse_args();

    // Initialize logging
    init_logging(cli.verbose, cli.log_json);

    if let Err(e) = dotenv {
        eprintln!("{} {e}", "error:".red().bold());
        return ExitCode::FAILURE;
    }

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    let context = cli.command.describe();
    let started = Instant::now();

    match runtime.block_on(run(cli, &formatter)) {
        Ok(()) => {
            eprintln!("Done in {}", format_duration(started.elapsed()));
            ExitCode::SUCCESS
        }
        Err(e) => {
            if let Some(report) = e.report()
                && let Err(write_err) = write_stdout(&formatter.format_report(report))
            {
                warn!("Could not print the apply report: {write_err}");
            }
            eprintln!("{} {context}: {e}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over the verbosity flag.
fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli, formatter: &OutputFormatter) -> Result<()> {
    let settings = cli.settings();
    let options = cli.command.apply_options();

    match cli.command {
        Commands::Plan { resource } => cmd_plan(&settings, &resource, formatter).await,
        Commands::Apply {
            plan,
            provider,
            hook,
            simulate_latency_ms,
            ..
        } => {
            let provider = build_provider(provider, hook, simulate_latency_ms)?;
            cmd_apply(&settings, &plan, provider, options, formatter).await
        }
        Commands::Show { plan } => cmd_show(&settings, &plan, formatter).await,
        Commands::List => cmd_list(&settings, formatter).await,
    }
}

/// Opens the plan and state stores on the configured backend.
async fn open_stores(settings: &Settings) -> Result<(PlanStore, StateStore)> {
    let backend = settings.open_backend().await?;
    Ok((PlanStore::new(Arc::clone(&backend)), StateStore::new(backend)))
}

/// Generate and store a plan.
async fn cmd_plan(settings: &Settings, resource: &Path, formatter: &OutputFormatter) -> Result<()> {
    let descriptor = ResourceLoader::new().load(resource).await?;
    let (plans, state) = open_stores(settings).await?;

    let artifact = PlanGenerator::new(plans, state).generate(&descriptor).await?;

    if formatter.is_json() {
        write_stdout(&formatter.format_plan(&artifact))?;
    } else {
        eprint!("{}", formatter.format_plan(&artifact));
        write_stdout(&artifact.name)?;
    }

    if artifact.is_empty() {
        eprintln!("Plan has no changes; applying it only confirms the state is current.");
    }

    Ok(())
}

/// Apply a stored plan.
async fn cmd_apply(
    settings: &Settings,
    plan: &str,
    provider: Arc<dyn InfraProvider>,
    options: ApplyOptions,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (plans, state) = open_stores(settings).await?;

    let (cancel, signal) = cancel_pair();
    let interrupt = tokio::spawn(async move {
        if handle_interrupts(cancel, tokio::signal::ctrl_c).await {
            std::process::exit(130);
        }
    });

    let executor = ApplyExecutor::new(plans, state, provider)
        .with_options(options)
        .with_cancel_signal(signal);
    debug!("Executor: {executor:?}");

    let result = executor.apply(plan).await;
    interrupt.abort();

    let report = result?;
    write_stdout(&formatter.format_report(&report))
}

/// Show a stored plan.
async fn cmd_show(settings: &Settings, plan: &str, formatter: &OutputFormatter) -> Result<()> {
    let (plans, _) = open_stores(settings).await?;
    let artifact = plans.get(plan).await?;
    write_stdout(&formatter.format_plan(&artifact))
}

/// List stored plans.
async fn cmd_list(settings: &Settings, formatter: &OutputFormatter) -> Result<()> {
    let (plans, _) = open_stores(settings).await?;
    let names = plans.list().await?;
    debug!("Found {} plans in {}", names.len(), plans.location());
    write_stdout(&formatter.format_plan_list(&names))
}

/// Builds the provider selected on the command line.
fn build_provider(
    kind: ProviderKind,
    hook: Option<String>,
    simulate_latency_ms: Option<u64>,
) -> Result<Arc<dyn InfraProvider>> {
    match kind {
        ProviderKind::Log => {
            let provider = simulate_latency_ms.map_or_else(LoggingProvider::new, |ms| {
                LoggingProvider::new().with_latency(Duration::from_millis(ms))
            });
            Ok(Arc::new(provider))
        }
        ProviderKind::Command => {
            let hook = hook.ok_or_else(|| ConfigError::MissingValue {
                name: String::from("--hook"),
            })?;
            Ok(Arc::new(CommandProvider::new(hook)))
        }
    }
}

/// Writes a block of output to stdout.
fn write_stdout(text: &str) -> Result<()> {
    write_block(&mut std::io::stdout().lock(), text).map_err(IacError::Output)
}

//! CLI command definitions.
//!
//! Every option can also be supplied through an `IAC_*` environment variable
//! or a `.env` file in the working directory. Flags win over the environment.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{BackendKind, Settings, DEFAULT_STORE_DIR};
use crate::planner::{ApplyOptions, FailurePolicy};

/// Two-phase infrastructure-as-code: plan now, apply later.
#[derive(Parser, Debug)]
#[command(name = "iac")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Directory holding plans and applied state for the local backend.
    #[arg(long, global = true, env = "IAC_STORE_DIR", default_value = DEFAULT_STORE_DIR)]
    pub store_dir: PathBuf,

    /// Where plans and applied state are stored.
    #[arg(long, global = true, env = "IAC_BACKEND", value_enum, default_value = "local")]
    pub backend: BackendKind,

    /// S3 bucket for the s3 backend.
    #[arg(long, global = true, env = "IAC_S3_BUCKET")]
    pub bucket: Option<String>,

    /// Key prefix inside the S3 bucket.
    #[arg(long, global = true, env = "IAC_S3_PREFIX")]
    pub prefix: Option<String>,

    /// AWS region of the S3 bucket.
    #[arg(long, global = true, env = "IAC_S3_REGION")]
    pub region: Option<String>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compute the changes for a resource file and store them as a plan.
    Plan {
        /// Resource file to plan.
        #[arg(short, long, env = "IAC_RESOURCE")]
        resource: PathBuf,
    },

    /// Execute a stored plan.
    Apply {
        /// Plan identifier printed by `iac plan`.
        #[arg(short, long, env = "IAC_PLAN")]
        plan: String,

        /// Keep going after a change fails.
        #[arg(long)]
        continue_on_error: bool,

        /// Maximum seconds for a single change.
        #[arg(long, value_name = "SECS", env = "IAC_CHANGE_TIMEOUT")]
        change_timeout: Option<u64>,

        /// Maximum seconds for the whole apply.
        #[arg(long, value_name = "SECS", env = "IAC_TIMEOUT")]
        timeout: Option<u64>,

        /// Provider that carries out the changes.
        #[arg(long, value_enum, env = "IAC_PROVIDER", default_value = "log")]
        provider: ProviderKind,

        /// Shell command run for each change by the command provider.
        #[arg(long, env = "IAC_HOOK", required_if_eq("provider", "command"))]
        hook: Option<String>,

        /// Simulated time per change for the log provider.
        #[arg(long, value_name = "MS")]
        simulate_latency_ms: Option<u64>,
    },

    /// Show the contents of a stored plan.
    Show {
        /// Plan identifier.
        #[arg(short, long, env = "IAC_PLAN")]
        plan: String,
    },

    /// List stored plans, oldest first.
    List,
}

/// Output format for CLI.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output.
    Json,
}

/// Infrastructure provider selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// Log each change without touching infrastructure.
    #[default]
    Log,
    /// Run a shell hook per change.
    Command,
}

impl Cli {
    /// Resolves the storage settings from the global options.
    #[must_use]
    pub fn settings(&self) -> Settings {
        Settings {
            backend: self.backend,
            store_dir: self.store_dir.clone(),
            bucket: self.bucket.clone(),
            prefix: self.prefix.clone(),
            region: self.region.clone(),
        }
    }
}

impl Commands {
    /// Describes what the command attempts, for error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Plan { resource } => format!("planning {}", resource.display()),
            Self::Apply { plan, .. } => format!("applying {plan}"),
            Self::Show { plan } => format!("showing {plan}"),
            Self::List => String::from("listing plans"),
        }
    }

    /// Builds executor options from the apply flags.
    ///
    /// Returns defaults for every other command.
    #[must_use]
    pub fn apply_options(&self) -> ApplyOptions {
        match self {
            Self::Apply {
                continue_on_error,
                change_timeout,
                timeout,
                ..
            } => ApplyOptions {
                policy: if *continue_on_error {
                    FailurePolicy::ContinueOnError
                } else {
                    FailurePolicy::FailFast
                },
                change_timeout: change_timeout.map(Duration::from_secs),
                run_timeout: timeout.map(Duration::from_secs),
            },
            _ => ApplyOptions::default(),
        }
    }
}

/// Parse CLI arguments.
#[must_use]
pub fn parse_args() -> Cli {
    Cli::parse()
}

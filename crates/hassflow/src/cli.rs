//! Clap derive structures for the `hassflow` CLI.
//!
//! Defines the command tree, global flags, and shared types.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// hassflow -- watch and drive Home Assistant entities
#[derive(Debug, Parser)]
#[command(
    name = "hassflow",
    version,
    about = "Watch and drive Home Assistant entities from the command line",
    long_about = "Query entity state, stream edge-triggered changes, and call services\n\
        on a Home Assistant instance over its WebSocket API.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Instance profile to use
    #[arg(long, short = 'p', env = "HASSFLOW_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Home Assistant URL (overrides profile)
    #[arg(long, short = 'u', env = "HASSFLOW_URL", global = true)]
    pub url: Option<String>,

    /// Long-lived access token
    #[arg(long, env = "HASSFLOW_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Entity/service definitions file (TOML)
    #[arg(long, short = 'd', env = "HASSFLOW_DEFINITIONS", global = true)]
    pub definitions: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "HASSFLOW_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Accept self-signed TLS certificates (REST only)
    #[arg(long, short = 'k', env = "HASSFLOW_INSECURE", global = true)]
    pub insecure: bool,

    /// Connection and request timeout in seconds
    #[arg(long, env = "HASSFLOW_TIMEOUT", global = true)]
    pub timeout: Option<u64>,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check that the instance is reachable and the token is accepted
    Check,

    /// List entity states
    #[command(alias = "ls")]
    States(StatesArgs),

    /// Show one entity (or one of its attributes)
    Get(GetArgs),

    /// Stream state or attribute changes until interrupted
    #[command(alias = "w")]
    Watch(WatchArgs),

    /// Call a service ("domain.service")
    Call(CallArgs),

    /// Manage CLI configuration and profiles
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Entity commands ──────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct StatesArgs {
    /// Only entities of this domain (e.g., "light")
    #[arg(long)]
    pub domain: Option<String>,
}

#[derive(Debug, Args)]
pub struct GetArgs {
    /// Entity id (e.g., "sensor.living_room_temperature")
    pub entity: String,

    /// Print a single attribute instead of the whole entity
    #[arg(long, short = 'a')]
    pub attr: Option<String>,

    /// Read from the snapshot before the latest update
    #[arg(long)]
    pub previous: bool,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Entity ids to watch
    #[arg(required = true, num_args = 1..)]
    pub entities: Vec<String>,

    /// Watch this attribute instead of the state
    #[arg(long, short = 'a')]
    pub attr: Option<String>,
}

#[derive(Debug, Args)]
pub struct CallArgs {
    /// Service id, "domain.service" (e.g., "light.turn_on")
    pub action: String,

    /// Service data as a JSON object
    #[arg(long)]
    pub data: Option<String>,

    /// Target entity id (repeatable)
    #[arg(long, short = 'e')]
    pub entity: Vec<String>,

    /// Target area id (repeatable)
    #[arg(long)]
    pub area: Vec<String>,

    /// Target device id (repeatable)
    #[arg(long)]
    pub device: Vec<String>,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display current configuration (tokens masked)
    Show,

    /// Print the config file location
    Path,

    /// List configured profiles
    Profiles,

    /// Add or replace a profile
    Init {
        /// Profile name
        #[arg(long, default_value = "default")]
        name: String,

        /// Instance base URL
        #[arg(long)]
        instance_url: String,

        /// Environment variable holding the token
        #[arg(long)]
        token_env: Option<String>,

        /// Definitions file for this profile
        #[arg(long)]
        definitions_file: Option<PathBuf>,

        /// Make this the default profile
        #[arg(long)]
        make_default: bool,
    },
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}

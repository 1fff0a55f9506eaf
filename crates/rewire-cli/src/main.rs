mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rewire_core::config::get_data_dir;
use std::path::PathBuf;

use commands::{
    budget::{handle_budget_command, handle_reset_command},
    config::{handle_config_get, handle_config_list, handle_config_set},
    daemon::{run_daemon_process, run_foreground, show_status, start_daemon, stop_daemon},
    init::init_command,
    lists::{handle_apps_command, handle_blocker_command, handle_urls_command},
    replay::{handle_replay_command, ReplayOptions},
    report::handle_report_command,
};

#[derive(Parser)]
#[command(name = "rewire")]
#[command(about = "Attention budget firewall", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize rewire (database and default config)
    Init,
    /// Start the firewall daemon
    Start {
        /// Newline-delimited JSON event log to follow ("-" for stdin, foreground only)
        #[arg(short, long)]
        events: Option<PathBuf>,
        /// Run in this terminal instead of detaching
        #[arg(short, long)]
        foreground: bool,
    },
    /// (Internal) Run the daemon process
    #[command(hide = true)]
    DaemonInternalStart {
        #[arg(long)]
        events: Option<PathBuf>,
    },
    /// Stop the firewall daemon
    Stop,
    /// Live status from the running daemon
    Status {
        /// Print the raw status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Budget and cost figures read straight from the store
    Budget,
    /// Run an event log through the firewall and print what it enforces
    Replay {
        file: PathBuf,
        /// Pass every gate as soon as it is shown
        #[arg(short, long)]
        approve: bool,
        /// Work on a copy of the stored state and leave the database untouched
        #[arg(short = 'n', long)]
        dry_run: bool,
    },
    /// Session log report
    Report {
        /// Time period: today or week
        #[arg(default_value = "today")]
        period: String,
    },
    /// Force a daily budget reset now
    Reset,
    /// Engine configuration (config.toml)
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Extractive apps, gated as soon as they reach the foreground
    Apps {
        #[command(subcommand)]
        action: ListAction,
    },
    /// Forbidden URL patterns, matched as substrings of committed URLs
    Urls {
        #[command(subcommand)]
        action: ListAction,
    },
    /// Switch the blocker on or off
    Blocker {
        #[command(subcommand)]
        state: BlockerState,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Get a configuration value, e.g. budget.decay_step
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List the whole configuration
    List,
}

#[derive(Subcommand, Debug)]
pub enum ListAction {
    Add { entry: String },
    Remove { entry: String },
    List,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum BlockerState {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if !matches!(cli.command, Commands::DaemonInternalStart { .. }) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .init();
    }

    let data_dir = get_data_dir()?;

    match cli.command {
        Commands::Init => init_command(),
        Commands::Start {
            events,
            foreground: true,
        } => run_foreground(events).await,
        Commands::Start {
            events,
            foreground: false,
        } => start_daemon(&data_dir, events.as_deref()),
        Commands::DaemonInternalStart { events } => run_daemon_process(events).await,
        Commands::Stop => stop_daemon(&data_dir).await,
        Commands::Status { json } => show_status(&data_dir, json).await,
        Commands::Budget => handle_budget_command(),
        Commands::Replay {
            file,
            approve,
            dry_run,
        } => handle_replay_command(&file, ReplayOptions { approve, dry_run }).await,
        Commands::Report { period } => handle_report_command(&period),
        Commands::Reset => handle_reset_command(),
        Commands::Config { action } => match action {
            ConfigAction::Get { key } => handle_config_get(&key),
            ConfigAction::Set { key, value } => handle_config_set(&key, &value),
            ConfigAction::List => handle_config_list(),
        },
        Commands::Apps { action } => handle_apps_command(&data_dir, action).await,
        Commands::Urls { action } => handle_urls_command(&data_dir, action).await,
        Commands::Blocker { state } => {
            handle_blocker_command(&data_dir, matches!(state, BlockerState::On)).await
        }
    }
}

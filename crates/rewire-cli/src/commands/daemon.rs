/// Daemon lifecycle management commands
use anyhow::{Context, Result};
use rewire_core::{
    config::{get_data_dir, EngineConfig},
    firewall::FirewallStatus,
    ipc::{IpcClient, IpcRequest, IpcResponse},
    source::{EventSource, JsonLinesSource},
    Daemon,
};
use rewire_storage::Database;
use std::{
    env, fs, io,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
    thread::sleep,
    time,
};
use sysinfo::{Pid, System};

use super::helpers::{format_duration_ms, format_units, rule};

pub fn start_daemon(data_dir: &Path, events: Option<&Path>) -> Result<()> {
    let pid_file_path = data_dir.join("rewire.pid");
    let sock_path = data_dir.join("rewire.sock");

    // 1. Check if daemon is already running
    if pid_file_path.exists() {
        if let Ok(pid_str) = fs::read_to_string(&pid_file_path) {
            if let Ok(pid) = pid_str.trim().parse::<usize>() {
                let mut sys = System::new();
                if sys.refresh_process(Pid::from(pid)) {
                    log::info!("Daemon is already running (PID: {pid}).");
                    return Ok(());
                }
            }
        }
        log::warn!("Removing stale PID file.");
        let _ = fs::remove_file(&pid_file_path);
    }

    // 2. Clean up old socket if it exists
    if sock_path.exists() {
        log::warn!("Removing stale socket file.");
        fs::remove_file(&sock_path)?;
    }

    if events.is_some_and(is_stdin) {
        anyhow::bail!("Reading events from stdin needs --foreground");
    }

    log::info!("Starting Rewire daemon...");

    // 3. Spawn a new process for the daemon
    let current_exe = env::current_exe()?;
    let current_dir = env::current_dir()?;
    let mut command = Command::new(current_exe);
    command.arg("daemon-internal-start").current_dir(current_dir);
    if let Some(path) = events {
        let path = path
            .canonicalize()
            .with_context(|| format!("Event log not found: {}", path.display()))?;
        command.arg("--events").arg(path);
    }
    let child = command.spawn()?;

    // 4. In parent process, write PID and exit
    fs::create_dir_all(data_dir)?;
    log::info!("Daemon process started with PID: {}", child.id());
    fs::write(&pid_file_path, child.id().to_string())?;

    Ok(())
}

pub async fn run_daemon_process(events: Option<PathBuf>) -> Result<()> {
    // Detached process: nobody sees stderr, so log to a file
    if let Err(e) = setup_daemon_logging() {
        panic!("Failed to set up daemon logging: {e}");
    }
    log::info!("Daemon process started internally.");

    if let Err(e) = daemon_main_logic(events).await {
        log::error!("Daemon main logic exited with a fatal error: {e:#}");
        return Err(e);
    }

    Ok(())
}

/// Run the daemon attached to this terminal
pub async fn run_foreground(events: Option<PathBuf>) -> Result<()> {
    log::info!("Running Rewire in the foreground, Ctrl-C to stop");
    daemon_main_logic(events).await
}

async fn daemon_main_logic(events: Option<PathBuf>) -> Result<()> {
    let db = Database::new(None)?;
    let config = EngineConfig::load_default()?;
    let source = open_source(events.as_deref()).await?;

    let mut daemon = Daemon::new(Arc::new(db), config)?;
    daemon.run_with_signals(source).await
}

fn is_stdin(path: &Path) -> bool {
    path == Path::new("-")
}

async fn open_source(events: Option<&Path>) -> Result<Option<Box<dyn EventSource>>> {
    let Some(path) = events else {
        return Ok(None);
    };
    let source: Box<dyn EventSource> = if is_stdin(path) {
        Box::new(JsonLinesSource::stdin())
    } else {
        Box::new(JsonLinesSource::open(path).await?)
    };
    Ok(Some(source))
}

pub async fn stop_daemon(data_dir: &Path) -> Result<()> {
    let pid_file_path = data_dir.join("rewire.pid");
    let sock_path = data_dir.join("rewire.sock");

    if !pid_file_path.exists() {
        log::info!("Daemon is not running (no PID file).");
        if sock_path.exists() {
            fs::remove_file(&sock_path)?;
        }
        return Ok(());
    }

    let pid_str = fs::read_to_string(&pid_file_path)?;
    let pid = pid_str
        .trim()
        .parse::<usize>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    log::info!("Stopping Rewire daemon (PID: {pid})...");
    let client = IpcClient::new(&sock_path);

    match client.send_command(IpcRequest::Shutdown).await {
        Ok(IpcResponse::Shutdown) => {
            log::info!("Daemon shutdown signal sent. Waiting for process to exit...");
            sleep(time::Duration::from_secs(2));

            let mut sys = System::new();
            if sys.refresh_process(Pid::from(pid)) {
                log::warn!("Daemon did not stop gracefully. Force killing...");
                if let Some(process) = sys.process(Pid::from(pid)) {
                    process.kill();
                }
            } else {
                log::info!("Daemon stopped successfully.");
            }
        }
        Ok(resp) => log::error!("Received unexpected response from daemon: {resp:?}"),
        Err(e) => {
            log::error!("Failed to send shutdown command: {e}. Forcing cleanup.");
            let mut sys = System::new();
            if sys.refresh_process(Pid::from(pid)) {
                if let Some(process) = sys.process(Pid::from(pid)) {
                    process.kill();
                    log::info!("Process killed.");
                }
            }
        }
    }

    // Cleanup
    fs::remove_file(&pid_file_path)?;
    if sock_path.exists() {
        fs::remove_file(&sock_path)?;
    }

    Ok(())
}

pub async fn show_status(data_dir: &Path, json: bool) -> Result<()> {
    let sock_path = data_dir.join("rewire.sock");

    if !sock_path.exists() {
        println!("Daemon Status: Not running");
        println!("Run 'rewire budget' for stored figures.");
        return Ok(());
    }

    let client = IpcClient::new(&sock_path);
    match client.send_command(IpcRequest::Status).await {
        Ok(IpcResponse::Status {
            status,
            pending_gate,
        }) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }
            print_status(&status);
            if let Some(gate) = pending_gate {
                println!(
                    "\nGate pending: {} ({}), wait {}s",
                    gate.package,
                    gate.reason.as_str(),
                    gate.wait_seconds
                );
                if let Some(pattern) = gate.pattern {
                    println!("  Pattern: {pattern}");
                }
            }
        }
        Ok(IpcResponse::Error(e)) => anyhow::bail!("Daemon could not read its store: {e}"),
        Ok(_) => anyhow::bail!("Unexpected response from daemon"),
        Err(e) => {
            log::error!("Failed to get status: {e}");
            println!("Daemon Status: Not running (or not responding)");
        }
    }
    Ok(())
}

fn print_status(status: &FirewallStatus) {
    println!(
        "Daemon Status: Running, blocker {}",
        if status.blocker_active { "on" } else { "off" }
    );
    println!("{}", rule(40));
    println!("Remaining:        {}", format_units(status.remaining_units));
    println!("Sessions today:   {}", status.daily_session_count);
    println!("Entry multiplier: {:.2}x", status.entry_multiplier);
    println!("Compulsion index: {:.2}", status.compulsion_index);
    println!("Cost factor:      {:.2}", status.cost_factor_base);
    println!("Gate wait:        {}s", status.wait_seconds);

    let session = &status.session;
    match &session.active_package {
        Some(package) => {
            println!("\nActive session: {package}");
            println!(
                "  Forbidden time: {}{}",
                format_duration_ms(session.live_forbidden_ms),
                if session.forbidden { " (running)" } else { "" }
            );
            println!(
                "  Live cost: {} DU at {:.2}x",
                status.live_cost_units, status.instantaneous_multiplier
            );
        }
        None => println!("\nNo active session"),
    }
    if session.pending_session_counts > 0 {
        println!(
            "\nWarning: {} session start(s) not yet counted",
            session.pending_session_counts
        );
    }
    if session.pending_depletions > 0 {
        println!(
            "\nWarning: {} session(s) not yet charged",
            session.pending_depletions
        );
    }
}

/// Ask a running daemon to re-read settings; silent when none is running
pub async fn notify_settings_changed(data_dir: &Path) {
    let sock_path = data_dir.join("rewire.sock");
    if !sock_path.exists() {
        return;
    }
    match IpcClient::new(&sock_path)
        .send_command(IpcRequest::ReloadSettings)
        .await
    {
        Ok(IpcResponse::Ok) => log::info!("Daemon reloaded settings"),
        Ok(resp) => log::warn!("Daemon did not reload settings: {resp:?}"),
        Err(e) => log::warn!("Could not reach daemon: {e}"),
    }
}

fn setup_daemon_logging() -> Result<()> {
    use std::fs::{create_dir_all, OpenOptions};

    let log_path = get_data_dir()?.join("rewire.log");

    if let Some(parent) = log_path.parent() {
        create_dir_all(parent)?;
    }

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .filter_level(log::LevelFilter::Debug)
        .init();

    Ok(())
}

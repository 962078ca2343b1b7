//! Kiln - incremental build daemon
//!
//! CLI entry point for the daemon and its clients.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, FromArgMatches};
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use kiln::action::ActionExecutor;
use kiln::api::DaemonServer;
use kiln::cli::{Cli, Command, DaemonCommand, OutputFormat, generate_after_help, get_log_path};
use kiln::config::Config;
use kiln::daemon::DaemonManager;
use kiln::engine::{Engine, RepoInfo};
use kiln::events::{ActionEvent, ProgressLevel};
use kiln::ipc::{self, DaemonClient, EventStream};
use kiln::repo::Repo;
use kiln::value::{Args, Value};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Logging isn't initialized yet, so nothing here can be traced
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Priority: CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Cli::command().after_help(generate_after_help());
    let cli = Cli::from_arg_matches(&cmd.get_matches()).context("Failed to parse arguments")?;

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let project_dir = match &cli.project {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    debug!(?project_dir, command = ?cli.command, "main: dispatching");

    match cli.command {
        Command::Daemon { command } => match command {
            DaemonCommand::Start { foreground } => {
                cmd_start(&project_dir, &config, cli.config.as_deref(), foreground).await
            }
            DaemonCommand::Stop => cmd_stop(&project_dir, &config).await,
            DaemonCommand::Status { format } => cmd_status(&project_dir, &config, format),
            DaemonCommand::Ping => cmd_ping(&project_dir, &config).await,
        },
        Command::Build { target, local } => cmd_build(&project_dir, config, &target, local).await,
        Command::Run {
            action,
            args,
            stream,
            cancel_on_disconnect,
            local,
        } => {
            let args: Args = args.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
            if local {
                cmd_run_local(&project_dir, config, &action, args, stream).await
            } else {
                cmd_run(&project_dir, &config, &action, args, stream, cancel_on_disconnect).await
            }
        }
        Command::Info { format } => cmd_info(&project_dir, &config, format).await,
        Command::Reload => cmd_reload(&project_dir, &config).await,
        Command::Watch { run_id } => cmd_watch(&project_dir, &config, &run_id).await,
        Command::Cancel { run_id } => cmd_cancel(&project_dir, &config, &run_id).await,
        Command::RunDaemon => run_daemon(&project_dir, config).await,
    }
}

fn open_repo(project_dir: &Path, config: &Config) -> Result<Repo> {
    Repo::open(project_dir, &config.project.repo_dir)
}

fn client_for(repo: &Repo, config: &Config) -> DaemonClient {
    DaemonClient::with_socket_path(ipc::socket_path(&repo.socket_path()))
        .with_timeout(std::time::Duration::from_millis(config.daemon.request_timeout_ms))
}

/// Client for a running daemon, or an error telling the user to start one
fn connected_client(project_dir: &Path, config: &Config) -> Result<DaemonClient> {
    let repo = open_repo(project_dir, config)?;
    let client = client_for(&repo, config);
    if !DaemonManager::for_repo(&repo).is_running() || !client.socket_exists() {
        return Err(eyre::eyre!(
            "No daemon is running for {}. Start one with `kd daemon start` or pass --local.",
            repo.project_dir().display()
        ));
    }
    Ok(client)
}

/// Start the daemon
async fn cmd_start(project_dir: &Path, config: &Config, config_path: Option<&Path>, foreground: bool) -> Result<()> {
    debug!(foreground, "cmd_start: called");
    let repo = open_repo(project_dir, config)?;
    let daemon = DaemonManager::for_repo(&repo);

    if let Some(pid) = daemon.running_pid() {
        println!("Kiln daemon is already running (PID: {})", pid);
        if !daemon.version_matches() {
            println!("{}", "Warning: the running daemon is a different version; restart it".yellow());
        }
        return Ok(());
    }

    if foreground {
        println!("Starting kiln daemon in foreground mode...");
        run_daemon(project_dir, config.clone()).await
    } else {
        let pid = daemon.start(repo.project_dir(), config_path)?;
        println!("Kiln daemon started (PID: {})", pid);
        Ok(())
    }
}

/// Stop the daemon
///
/// Tries IPC shutdown first, falls back to SIGTERM.
async fn cmd_stop(project_dir: &Path, config: &Config) -> Result<()> {
    debug!("cmd_stop: called");
    let repo = open_repo(project_dir, config)?;
    let daemon = DaemonManager::for_repo(&repo);

    let Some(pid) = daemon.running_pid() else {
        println!("Kiln daemon is not running");
        return Ok(());
    };

    let client = client_for(&repo, config);
    if client.socket_exists() {
        match client.shutdown().await {
            Ok(()) => {
                let mut attempts = 0;
                while daemon.is_running() && attempts < 50 {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    attempts += 1;
                }
                if !daemon.is_running() {
                    println!("Kiln daemon stopped gracefully via IPC (was PID: {})", pid);
                    return Ok(());
                }
                debug!("cmd_stop: IPC shutdown timed out, falling back to SIGTERM");
            }
            Err(e) => {
                debug!(error = %e, "cmd_stop: IPC shutdown failed, falling back to SIGTERM");
            }
        }
    }

    daemon.stop()?;
    println!("Kiln daemon stopped (was PID: {})", pid);
    Ok(())
}

fn cmd_status(project_dir: &Path, config: &Config, format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_status: called");
    let repo = open_repo(project_dir, config)?;
    let status = DaemonManager::for_repo(&repo).status();

    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "running": status.running,
                "pid": status.pid,
                "pid_file": status.pid_file.to_string_lossy(),
                "version": status.version,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            println!("Kiln Daemon Status");
            println!("------------------");
            if status.running {
                println!("Status: {}", "running".green());
                if let Some(pid) = status.pid {
                    println!("PID: {}", pid);
                }
                if let Some(version) = &status.version {
                    println!("Version: {}", version);
                }
            } else {
                println!("Status: {}", "stopped".red());
            }
            println!("PID file: {}", status.pid_file.display());
        }
    }
    Ok(())
}

/// Ping the daemon via IPC to check if it's alive and responsive
async fn cmd_ping(project_dir: &Path, config: &Config) -> Result<()> {
    debug!("cmd_ping: called");
    let repo = open_repo(project_dir, config)?;
    if !DaemonManager::for_repo(&repo).is_running() {
        println!("Kiln daemon is not running");
        return Ok(());
    }

    let client = client_for(&repo, config);
    if !client.socket_exists() {
        println!("Daemon PID file exists but IPC socket not found");
        println!("The daemon may be starting up or in an inconsistent state");
        return Ok(());
    }

    match client.ping().await {
        Ok(version) => {
            println!("Daemon is alive and responsive");
            println!("Version: {}", version);
        }
        Err(e) => {
            println!("Daemon PID file exists but not responding to IPC");
            println!("Error: {}", e);
        }
    }
    Ok(())
}

async fn cmd_build(project_dir: &Path, config: Config, target: &str, local: bool) -> Result<()> {
    debug!(%target, local, "cmd_build: called");
    let built = if local {
        let executor = ActionExecutor::new(Engine::open(project_dir, config)?);
        executor.build_target(target).await.map_err(ipc::RemoteError)?
    } else {
        connected_client(project_dir, &config)?.build_target(target).await?
    };

    println!("{} {}", "Built".green().bold(), built.target);
    println!("  value:  {}", built.value);
    println!("  output: {}", built.output_dir.display());
    println!("  run:    {}", built.run_id);
    Ok(())
}

async fn cmd_run(
    project_dir: &Path,
    config: &Config,
    action: &str,
    args: Args,
    stream: bool,
    cancel_on_disconnect: bool,
) -> Result<()> {
    debug!(%action, stream, "cmd_run: called");
    let client = connected_client(project_dir, config)?;
    if stream {
        let events = client.stream_action(action, args, cancel_on_disconnect).await?;
        return print_stream(events).await;
    }

    let result = client.invoke_action(action, args).await?;
    print_action_done(&result.action, result.value.as_ref());
    Ok(())
}

async fn cmd_run_local(project_dir: &Path, config: Config, action: &str, args: Args, stream: bool) -> Result<()> {
    debug!(%action, stream, "cmd_run_local: called");
    let executor = ActionExecutor::new(Engine::open(project_dir, config)?);
    if !stream {
        let result = executor.invoke_action(action, args).await.map_err(ipc::RemoteError)?;
        print_action_done(&result.action, result.value.as_ref());
        return Ok(());
    }

    let run = executor.start_action(action, args).map_err(ipc::RemoteError)?;
    let mut observer = run.observe();
    let mut failed = None;
    while let Some(event) = observer.next().await {
        if let ActionEvent::Failed { error, .. } = &event {
            failed = Some(error.clone());
        }
        print_event(&event);
    }
    match failed {
        Some(error) => Err(ipc::RemoteError(error).into()),
        None => Ok(()),
    }
}

async fn cmd_info(project_dir: &Path, config: &Config, format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_info: called");
    let info = connected_client(project_dir, config)?.repo_info().await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
        OutputFormat::Text => print_repo_info(&info),
    }
    Ok(())
}

async fn cmd_reload(project_dir: &Path, config: &Config) -> Result<()> {
    debug!("cmd_reload: called");
    let info = connected_client(project_dir, config)?.reload().await?;
    println!("{}", "Reloaded".green().bold());
    print_repo_info(&info);
    Ok(())
}

async fn cmd_watch(project_dir: &Path, config: &Config, run_id: &str) -> Result<()> {
    debug!(%run_id, "cmd_watch: called");
    let events = connected_client(project_dir, config)?.observe_run(run_id).await?;
    print_stream(events).await
}

async fn cmd_cancel(project_dir: &Path, config: &Config, run_id: &str) -> Result<()> {
    debug!(%run_id, "cmd_cancel: called");
    connected_client(project_dir, config)?.cancel_run(run_id).await?;
    println!("Cancelled run {}", run_id);
    Ok(())
}

/// Print streamed events; a `Failed` terminal event becomes the command's error
async fn print_stream(mut events: EventStream) -> Result<()> {
    while let Some(event) = events.next().await? {
        print_event(&event);
        if let ActionEvent::Failed { error, .. } = event {
            return Err(ipc::RemoteError(error).into());
        }
    }
    Ok(())
}

fn print_event(event: &ActionEvent) {
    match event {
        ActionEvent::Started { run_id, target, rule } => {
            println!("{} {} ({}) run {}", "started".cyan(), target, rule, run_id.dimmed());
        }
        ActionEvent::Progress {
            rule, level, message, ..
        } => match level {
            ProgressLevel::Verbose => println!("{}", format!("[{}] {}", rule, message).dimmed()),
            ProgressLevel::Info => println!("[{}] {}", rule, message),
            ProgressLevel::Error => println!("{}", format!("[{}] {}", rule, message).red()),
        },
        ActionEvent::Output { line, stderr, .. } => {
            if *stderr {
                eprintln!("{}", line);
            } else {
                println!("{}", line);
            }
        }
        ActionEvent::Finished { value, .. } => match value {
            Some(value) => println!("{} {}", "finished".green().bold(), value),
            None => println!("{}", "finished".green().bold()),
        },
        ActionEvent::Failed { error, .. } => {
            println!("{} {}", "failed".red().bold(), error.kind);
        }
    }
}

fn print_action_done(action: &str, value: Option<&Value>) {
    match value {
        Some(value) => println!("{} {}: {}", "Done".green().bold(), action, value),
        None => println!("{} {}", "Done".green().bold(), action),
    }
}

fn print_repo_info(info: &RepoInfo) {
    println!("Project:  {}", info.project_dir.display());
    println!("Repo:     {}", info.repo_dir.display());
    match &info.manifest {
        Some(path) => println!("Manifest: {} (loaded {})", path.display(), info.manifest_loaded_at),
        None => println!("Manifest: {}", "none".dimmed()),
    }
    println!("Targets:  {}", info.targets.join(", "));
    println!("Actions:  {}", info.actions.join(", "));
    println!("Rules:    {}", info.rules.join(", "));
    if let Some(count) = info.cached_objects {
        println!("Cached:   {}", count);
    }
    println!("Daemon:   {} (since {})", info.version, info.started_at);
}

/// Daemon main loop: serve IPC until shutdown
async fn run_daemon(project_dir: &Path, config: Config) -> Result<()> {
    debug!(?project_dir, "run_daemon: called");
    info!("Daemon starting...");

    let engine = Engine::open(project_dir, config).context("Failed to open project")?;
    let repo = engine.repo().clone();
    let daemon = DaemonManager::for_repo(&repo);
    daemon.register_self()?;

    let socket_path: PathBuf = ipc::socket_path(&repo.socket_path());
    let (listener, socket_path) = ipc::create_listener_at(&socket_path)?;
    info!(?socket_path, "IPC socket listening");

    let executor = ActionExecutor::new(Arc::clone(&engine));
    let server = DaemonServer::new(executor);
    let shutdown_tx = server.shutdown_handle();
    let mut server_handle = tokio::spawn(server.run(listener));

    info!("Daemon running. SIGHUP reloads the manifest.");

    use tokio::signal::unix::{SignalKind, signal};
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("SIGHUP received - reloading manifest");
                if let Err(e) = engine.reload() {
                    tracing::error!(error = %e, "Failed to reload manifest");
                }
            }
            _ = sigint.recv() => {
                warn!("SIGINT received");
                let _ = shutdown_tx.send(()).await;
                break;
            }
            _ = sigterm.recv() => {
                warn!("SIGTERM received");
                let _ = shutdown_tx.send(()).await;
                break;
            }
            result = &mut server_handle => {
                debug!(?result, "run_daemon: server stopped");
                cleanup(&socket_path, &daemon);
                return Ok(());
            }
        }
    }

    info!("Daemon shutting down...");
    let _ = server_handle.await;
    cleanup(&socket_path, &daemon);
    debug!("run_daemon: shutdown complete");
    Ok(())
}

fn cleanup(socket_path: &Path, daemon: &DaemonManager) {
    ipc::cleanup_socket(socket_path);
    if let Err(e) = daemon.cleanup() {
        warn!(error = %e, "Failed to remove daemon files");
    }
}

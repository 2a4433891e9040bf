// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! codi-swarm main entry point - CLI, session runner and control commands.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use codi_swarm::config::{self, ChannelMode, CliOptions, ResolvedConfig};
use codi_swarm::orchestrate::isolation::find_repo_root;
use codi_swarm::orchestrate::types::short_id;
use codi_swarm::orchestrate::{
    render_status, socket_path_for_session, DispatchInterpreter, GitWorktreeIsolator, IpcClient,
    IpcServer, MergeResolution, Session, SessionRecord, SessionState, StatusReport,
    WorkspaceIsolator,
};
use codi_swarm::telemetry::{init_telemetry, TelemetryConfig, GLOBAL_METRICS};

/// codi-swarm version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// codi-swarm - parallel coding workers in isolated git worktrees.
#[derive(Parser)]
#[command(name = "codi-swarm")]
#[command(author, version, about = "Run coding workers in parallel git worktrees", long_about = None)]
struct Cli {
    /// Repository to work in (defaults to the current directory)
    #[arg(short, long, env = "CODI_SWARM_REPO", global = true)]
    repo: Option<PathBuf>,

    /// Maximum concurrent workers
    #[arg(short = 'j', long, env = "CODI_SWARM_MAX_WORKERS", global = true)]
    max_workers: Option<usize>,

    /// Per-worker timeout ceiling in seconds
    #[arg(short, long, global = true)]
    timeout: Option<u64>,

    /// Worker command to launch
    #[arg(long, env = "CODI_SWARM_WORKER_COMMAND", global = true)]
    worker_command: Option<String>,

    /// Model passed to workers
    #[arg(short, long, env = "CODI_SWARM_MODEL", global = true)]
    model: Option<String>,

    /// How responses reach the supervisor
    #[arg(long, value_enum, global = true)]
    channel: Option<ChannelArg>,

    /// Hold every result for approval instead of merging
    #[arg(long, global = true)]
    no_auto_merge: bool,

    /// Show verbose output
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Show debug output
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn options(&self) -> CliOptions {
        CliOptions {
            max_workers: self.max_workers,
            timeout_secs: self.timeout,
            worker_command: self.worker_command.clone(),
            worker_model: self.model.clone(),
            channel_mode: self.channel.map(Into::into),
            auto_merge: if self.no_auto_merge { Some(false) } else { None },
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ChannelArg {
    /// Append responses to a markdown file in the repository
    Artifact,
    /// Send responses to control socket clients
    Socket,
}

impl From<ChannelArg> for ChannelMode {
    fn from(arg: ChannelArg) -> Self {
        match arg {
            ChannelArg::Artifact => ChannelMode::Artifact,
            ChannelArg::Socket => ChannelMode::Socket,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ResolutionArg {
    /// Leave conflicting branches unmerged
    Abort,
    /// Resolve conflicts with the base side
    Ours,
    /// Resolve conflicts with the worker side
    Theirs,
}

impl From<ResolutionArg> for MergeResolution {
    fn from(arg: ResolutionArg) -> Self {
        match arg {
            ResolutionArg::Abort => MergeResolution::Abort,
            ResolutionArg::Ours => MergeResolution::Ours,
            ResolutionArg::Theirs => MergeResolution::Theirs,
        }
    }
}

/// Subcommands for codi-swarm.
#[derive(Subcommand)]
enum Commands {
    /// Run the dispatch blocks in supervisor output (file or stdin)
    Run {
        /// File holding supervisor output; reads stdin when absent
        file: Option<PathBuf>,
        /// Also open the control socket while running
        #[arg(long)]
        serve: bool,
        /// Print the session record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Interpret dispatch blocks without running anything
    Parse {
        /// File holding supervisor output; reads stdin when absent
        file: Option<PathBuf>,
    },

    /// Open a session and take dispatches over the control socket
    Serve,

    /// Show worker status for a running session
    Status {
        #[arg(short, long)]
        session: String,
    },

    /// Stop launching queued workers
    Pause {
        #[arg(short, long)]
        session: String,
    },

    /// Resume launching queued workers
    Resume {
        #[arg(short, long)]
        session: String,
    },

    /// Cancel one worker
    CancelWorker {
        #[arg(short, long)]
        session: String,
        worker_id: String,
    },

    /// Merge held workers (all held workers when none are named)
    Approve {
        #[arg(short, long)]
        session: String,
        worker_ids: Vec<String>,
        /// Conflict resolution
        #[arg(long, value_enum, default_value = "abort")]
        resolution: ResolutionArg,
    },

    /// Cancel a running session
    Cancel {
        #[arg(short, long)]
        session: String,
    },

    /// Remove worktrees and sockets left behind by earlier runs
    Cleanup,

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Initialize a new configuration file
    Init,

    /// Show version information
    Version,
}

/// Config subcommand actions.
#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
}

/// Control socket request sent by the session control commands.
enum ControlAction {
    Status,
    Pause,
    Resume,
    CancelWorker(String),
    Approve(Vec<String>, MergeResolution),
    Cancel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _telemetry = init_telemetry(&TelemetryConfig::from_flags(cli.verbose, cli.debug))?;

    let repo = match &cli.repo {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };
    let options = cli.options();
    let verbose = cli.verbose;

    match cli.command {
        Commands::Run { file, serve, json } => {
            let config = load(&repo, options)?;
            let output = read_input(file.as_deref())?;
            run(&repo, config, &output, serve, json, verbose).await
        }
        Commands::Parse { file } => {
            let config = load(&repo, options)?;
            let output = read_input(file.as_deref())?;
            let batch = DispatchInterpreter::new(config.worker.timeout_ceiling()).interpret(&output);
            println!("{}", serde_json::to_string_pretty(&batch)?);
            Ok(())
        }
        Commands::Serve => {
            let config = load(&repo, options)?;
            serve(&repo, config, verbose).await
        }
        Commands::Status { session } => {
            control(&load(&repo, options)?, &session, ControlAction::Status).await
        }
        Commands::Pause { session } => {
            control(&load(&repo, options)?, &session, ControlAction::Pause).await
        }
        Commands::Resume { session } => {
            control(&load(&repo, options)?, &session, ControlAction::Resume).await
        }
        Commands::CancelWorker { session, worker_id } => {
            let config = load(&repo, options)?;
            control(&config, &session, ControlAction::CancelWorker(worker_id)).await
        }
        Commands::Approve {
            session,
            worker_ids,
            resolution,
        } => {
            let config = load(&repo, options)?;
            control(
                &config,
                &session,
                ControlAction::Approve(worker_ids, resolution.into()),
            )
            .await
        }
        Commands::Cancel { session } => {
            control(&load(&repo, options)?, &session, ControlAction::Cancel).await
        }
        Commands::Cleanup => cleanup(&repo, &load(&repo, options)?).await,
        Commands::Config { action } => match action {
            Some(ConfigAction::Show) | None => {
                let config = load(&repo, options)?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
        },
        Commands::Init => {
            let path = config::init_config(&repo, None)?;
            println!("Created config file: {}", path.display());
            Ok(())
        }
        Commands::Version => {
            println!("codi-swarm {}", VERSION);
            Ok(())
        }
    }
}

fn load(repo: &Path, options: CliOptions) -> anyhow::Result<ResolvedConfig> {
    let root = config::find_workspace_root(repo).unwrap_or_else(|| repo.to_path_buf());
    Ok(config::load_config(&root, options)?)
}

fn read_input(file: Option<&Path>) -> anyhow::Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display())),
        None => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            Ok(text)
        }
    }
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Control socket tasks for a session.
struct Control {
    server: Arc<IpcServer>,
    accept: JoinHandle<()>,
    serve: JoinHandle<()>,
}

impl Control {
    async fn stop(self) {
        self.accept.abort();
        self.serve.abort();
        if let Err(e) = self.server.stop().await {
            tracing::warn!("control socket shutdown: {}", e);
        }
    }
}

async fn open_session(
    repo: &Path,
    config: ResolvedConfig,
    with_socket: bool,
) -> anyhow::Result<(Session, Option<Control>)> {
    let id = short_id("s");
    let with_socket = with_socket || config.channel.mode == ChannelMode::Socket;
    if !with_socket {
        return Ok((Session::builder(repo, config).session_id(id).build().await, None));
    }

    let mut server = IpcServer::new(socket_path_for_session(&config.channel.socket_dir, &id));
    server.start().await?;
    let incoming = server
        .take_receiver()
        .context("control receiver already taken")?;
    let server = Arc::new(server);

    let session = Session::builder(repo, config)
        .session_id(id)
        .control_server(Arc::clone(&server))
        .build()
        .await;
    let accept = server.spawn_accept_loop();
    let serve = {
        let session = session.clone();
        let server = Arc::clone(&server);
        tokio::spawn(async move { session.serve_control(server, incoming).await })
    };
    Ok((
        session,
        Some(Control {
            server,
            accept,
            serve,
        }),
    ))
}

fn print_banner(session: &Session, control: Option<&Control>) {
    println!(
        "{} session {} on {}",
        "→".cyan(),
        session.id().bold(),
        session.repo_root().display()
    );
    println!("  responses: {}", session.response_location().dimmed());
    if let Some(control) = control {
        println!(
            "  control:   {}",
            control.server.socket_path().display().to_string().dimmed()
        );
    }
}

fn print_record(record: &SessionRecord, json: bool, verbose: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(record)?);
    }
    let merged = record.outcomes.iter().filter(|o| o.applied).count();
    let state = match &record.state {
        SessionState::Completed => record.state.to_string().green(),
        SessionState::Cancelled => record.state.to_string().yellow(),
        other => other.to_string().red(),
    };
    println!(
        "{} session {} {}: {} workers, {} merged, {} diagnostics, ${:.4}",
        "■".cyan(),
        record.id.bold(),
        state,
        record.workers.len(),
        merged,
        record.diagnostics.len(),
        record.budget.total_cost
    );
    for diagnostic in &record.diagnostics {
        println!("  {} {}", "!".yellow(), diagnostic);
    }
    if verbose {
        println!("\n{}", GLOBAL_METRICS.snapshot().format_report().dimmed());
    }
    Ok(())
}

fn check_finished(record: &SessionRecord) -> anyhow::Result<()> {
    match &record.state {
        SessionState::Aborted { reason } => anyhow::bail!("session aborted: {}", reason),
        _ => Ok(()),
    }
}

async fn run(
    repo: &Path,
    config: ResolvedConfig,
    output: &str,
    with_socket: bool,
    json: bool,
    verbose: bool,
) -> anyhow::Result<()> {
    let (session, control) = open_session(repo, config, with_socket).await?;
    if let SessionState::Aborted { reason } = session.state() {
        anyhow::bail!("{}", reason);
    }
    print_banner(&session, control.as_ref());

    let bar = spinner("running dispatches");
    let replies = session.handle_output(output).await;
    bar.finish_and_clear();

    for reply in replies? {
        println!("\n{} {}", "■".green(), reply.marker.bold());
        println!("{}", reply.text);
        if reply.location.is_none() {
            eprintln!("{}", "response was not delivered".red());
        }
    }

    let record = session.finish().await?;
    if let Some(control) = control {
        control.stop().await;
    }
    print_record(&record, json, verbose)?;
    check_finished(&record)
}

async fn serve(repo: &Path, config: ResolvedConfig, verbose: bool) -> anyhow::Result<()> {
    let (session, control) = open_session(repo, config, true).await?;
    if let SessionState::Aborted { reason } = session.state() {
        anyhow::bail!("{}", reason);
    }
    let control = control.context("control socket not started")?;
    print_banner(&session, Some(&control));
    println!("{}", "Waiting for dispatches. Ctrl-C cancels the session.".dimmed());

    let Control {
        server,
        accept,
        mut serve,
    } = control;
    tokio::select! {
        _ = &mut serve => {}
        signal = tokio::signal::ctrl_c() => {
            signal?;
            println!("\n{}", "Cancelling session...".yellow());
            if let Err(e) = session.cancel().await {
                tracing::warn!("cancel: {}", e);
            }
        }
    }

    let record = session.finish().await?;
    Control {
        server,
        accept,
        serve,
    }
    .stop()
    .await;
    print_record(&record, false, verbose)?;
    check_finished(&record)
}

async fn control(config: &ResolvedConfig, session: &str, action: ControlAction) -> anyhow::Result<()> {
    let path = socket_path_for_session(&config.channel.socket_dir, session);
    let mut client = IpcClient::new(&path);
    client
        .connect()
        .await
        .with_context(|| format!("no session listening at {}", path.display()))?;

    let result = match action {
        ControlAction::Status => client.status().await,
        ControlAction::Pause => client.pause_queue().await,
        ControlAction::Resume => client.resume_queue().await,
        ControlAction::CancelWorker(worker_id) => client.cancel_worker(&worker_id).await,
        ControlAction::Approve(worker_ids, resolution) => {
            client.approve(worker_ids, resolution).await
        }
        ControlAction::Cancel => client.cancel_session().await,
    };
    client.disconnect().await;
    let payload = result?;

    match serde_json::from_value::<StatusReport>(payload.clone()) {
        Ok(report) => print!("{}", render_status(&report)),
        Err(_) => println!("{}", serde_json::to_string_pretty(&payload)?),
    }
    Ok(())
}

async fn cleanup(repo: &Path, config: &ResolvedConfig) -> anyhow::Result<()> {
    let root = find_repo_root(repo).context("not inside a git repository")?;
    let isolator = GitWorktreeIsolator::new(&root, &config.worktree.base_dir, short_id("cleanup"));
    let removed = isolator.cleanup_stale().await?;
    println!("{} removed {} stale worktrees", "✓".green(), removed);

    let mut sockets = 0;
    for entry in WalkDir::new(&config.channel.socket_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let name = entry.file_name().to_string_lossy();
        if !(name.starts_with("codi-swarm-") && name.ends_with(".sock")) {
            continue;
        }
        if std::os::unix::net::UnixStream::connect(entry.path()).is_ok() {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => sockets += 1,
            Err(e) => eprintln!("{} {}: {}", "!".yellow(), entry.path().display(), e),
        }
    }
    println!("{} removed {} stale sockets", "✓".green(), sockets);
    Ok(())
}

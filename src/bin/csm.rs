//! csm - watch interactive Claude CLI sessions
//!
//! Polls the process table, classifies each session as running, idle or
//! done, and flags sessions that finished work until they are acknowledged.
//!
//! # Usage
//!
//! ```bash
//! # Watch sessions (default)
//! csm
//! csm watch --interval 1
//!
//! # One-off listing
//! csm list
//! csm list --json
//!
//! # Show the effective configuration
//! csm config
//!
//! # Enable debug logging to a file
//! RUST_LOG=csmd=debug csm watch --log-file /tmp/csm.log
//! ```
//!
//! While watching, type a command and press Enter:
//! `a`/`ack` acknowledges all finished sessions, `ack <pid>` one session,
//! `go <pid>` switches tmux to the session's pane, `q`/`quit` exits.
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown

use std::fs::OpenOptions;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use csm_core::{reconcile, Session, SessionCounts, SessionMap, SessionState};
use csmd::config::{Config, SamplerBackend};
use csmd::poller::PollScheduler;
use csmd::registry::{spawn_registry, RegistryHandle, RegistrySettings, Snapshot};
use csmd::sampler::{ProcessSource, PsSampler, SysinfoSampler};
use csmd::tmux::{display_label, LabelResolver, TerminalActivator, TmuxActivator, TmuxLabels};

/// Log directives used when `RUST_LOG` is not set.
const DEFAULT_LOG_DIRECTIVES: &str = "csm=info,csmd=info,csm_core=info";

// ============================================================================
// CLI Arguments
// ============================================================================

/// csm - monitor interactive Claude CLI sessions
#[derive(Parser, Debug)]
#[command(name = "csm", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Config file (default: $CSM_CONFIG, then <config_dir>/csm/config.toml)
    #[arg(long, short = 'c', global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Command basename to track
    #[arg(long, short = 't', global = true)]
    target: Option<String>,

    /// Seconds between samples
    #[arg(long, short = 'i', global = true, value_name = "SECS")]
    interval: Option<f64>,

    /// Process table reader (ps or sysinfo)
    #[arg(long, global = true)]
    backend: Option<SamplerBackend>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Watch sessions and flag finished ones (default)
    Watch,
    /// Sample once and print the sessions
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as TOML
    Config,
}

// ============================================================================
// Setup
// ============================================================================

/// Installs the tracing subscriber, writing to `log_file` or stderr.
fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_DIRECTIVES))
        .context("Invalid log filter")?;

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Loads the config file and applies command-line overrides.
fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::load(args.config.as_deref()).context("Failed to load config")?;

    if let Some(target) = &args.target {
        config.target_command = target.clone();
    }
    if let Some(interval) = args.interval {
        config.poll_interval_secs = interval;
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn make_source(config: &Config) -> Arc<dyn ProcessSource> {
    let filter = config.command_filter();
    match config.backend {
        SamplerBackend::Ps => Arc::new(PsSampler::new(filter)),
        SamplerBackend::Sysinfo => Arc::new(SysinfoSampler::new(filter)),
    }
}

async fn load_labels() -> TmuxLabels {
    tokio::task::spawn_blocking(TmuxLabels::load)
        .await
        .unwrap_or_default()
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_file.as_deref())?;

    let config = load_config(&args)?;

    match args.command.unwrap_or(Command::Watch) {
        Command::Watch => run_watch(config).await,
        Command::List { json } => run_list(config, json).await,
        Command::Config => {
            print!("{}", config.to_toml_string());
            Ok(())
        }
    }
}

// ============================================================================
// List
// ============================================================================

/// Samples once and prints every session classified from scratch.
async fn run_list(config: Config, json: bool) -> Result<()> {
    let source = make_source(&config);
    let records = tokio::task::spawn_blocking(move || source.sample())
        .await
        .context("Sampling task failed")?
        .context("Failed to sample the process table")?;

    let result = reconcile(
        &SessionMap::new(),
        &records,
        Utc::now(),
        &config.thresholds()?,
    );
    let labels = load_labels().await;

    if json {
        let rows: Vec<serde_json::Value> = result
            .sessions
            .values()
            .map(|session| {
                serde_json::json!({
                    "pid": session.pid,
                    "state": session.state,
                    "cpu_percent": session.cpu_percent,
                    "tty": session.tty,
                    "label": display_label(&labels, &session.tty),
                    "command": session.command_name,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&rows).context("Failed to encode JSON")?
        );
    } else {
        let counts = SessionCounts::from_sessions(&result.sessions);
        println!("{}", summary_line(&config.target_command, counts, false));
        print!(
            "{}",
            render_table(result.sessions.values(), &labels, Utc::now())
        );
    }
    Ok(())
}

// ============================================================================
// Watch
// ============================================================================

/// A command typed while watching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Input {
    AckAll,
    Ack(u32),
    Go(u32),
    Quit,
    Help,
}

const HELP: &str = "commands: a|ack, ack <pid>, go <pid>, q|quit";

/// Parses one stdin line. Blank lines yield `Ok(None)`.
fn parse_input(line: &str) -> Result<Option<Input>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let arg = words.next();
    if words.next().is_some() {
        return Err(format!("too many arguments: {}", line.trim()));
    }

    let pid = |arg: Option<&str>| -> Result<u32, String> {
        let arg = arg.ok_or_else(|| format!("{verb} needs a pid"))?;
        arg.parse().map_err(|_| format!("not a pid: {arg}"))
    };

    let input = match (verb, arg) {
        ("a", None) | ("ack", None) => Input::AckAll,
        ("ack", some) => Input::Ack(pid(some)?),
        ("go", some) => Input::Go(pid(some)?),
        ("q", None) | ("quit", None) => Input::Quit,
        ("h", None) | ("help", None) | ("?", None) => Input::Help,
        _ => return Err(format!("unknown command: {}", line.trim())),
    };
    Ok(Some(input))
}

/// Reads stdin lines on a dedicated thread.
///
/// A blocking stdin read cannot be cancelled, so it stays off the runtime;
/// the thread ends with the process.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
        debug!("stdin reader finished");
    });
    rx
}

/// Runs the scheduler and redraws whenever session states change.
async fn run_watch(config: Config) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        target = %config.target_command,
        backend = %config.backend,
        interval_secs = config.poll_interval_secs,
        "csm starting"
    );

    let cancel_token = CancellationToken::new();

    // Setup signal handlers
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let registry = spawn_registry(RegistrySettings {
        thresholds: config.thresholds()?,
        attention_clear: config.attention_clear(),
    });
    let mut events = registry.subscribe();

    let scheduler = PollScheduler::spawn(
        make_source(&config),
        registry.clone(),
        config.poll_interval(),
        cancel_token.clone(),
    );

    let activator = TmuxActivator::new();
    let mut stdin = spawn_stdin_reader();
    let mut stdin_open = true;
    let mut view = WatchView::new(config.target_command.clone());

    loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => break,

            event = events.recv() => match event {
                Ok(snapshot) => view.update(&snapshot).await,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Display fell behind, skipping snapshots");
                }
                Err(RecvError::Closed) => {
                    warn!("Registry stopped");
                    break;
                }
            },

            line = stdin.recv(), if stdin_open => {
                let Some(line) = line else {
                    // EOF: keep watching until a signal arrives.
                    stdin_open = false;
                    continue;
                };
                match parse_input(&line) {
                    Ok(Some(Input::Quit)) => break,
                    Ok(Some(input)) => handle_input(input, &registry, &activator).await?,
                    Ok(None) => {}
                    Err(message) => eprintln!("{message} ({HELP})"),
                }
            }
        }
    }

    scheduler.stop().await;
    info!("csm stopped");
    Ok(())
}

async fn handle_input(
    input: Input,
    registry: &RegistryHandle,
    activator: &dyn TerminalActivator,
) -> Result<()> {
    match input {
        Input::AckAll => {
            let count = registry.acknowledge_all().await?;
            println!("acknowledged {count} session(s)");
        }
        Input::Ack(pid) => {
            if !registry.acknowledge_one(pid).await? {
                println!("no finished session with pid {pid}");
            }
        }
        Input::Go(pid) => {
            let Some(snapshot) = registry.snapshot().await else {
                bail!("registry stopped");
            };
            match snapshot.session(pid) {
                Some(session) => activator.activate(&session.tty).await,
                None => println!("no session with pid {pid}"),
            }
        }
        Input::Help => println!("{HELP}"),
        Input::Quit => {}
    }
    Ok(())
}

/// Terminal rendering state for `csm watch`.
struct WatchView {
    target: String,
    labels: TmuxLabels,
    /// Pid/state pairs and attention flag of the last drawn snapshot
    last_drawn: Option<(Vec<(u32, SessionState)>, bool)>,
}

impl WatchView {
    fn new(target: String) -> Self {
        Self {
            target,
            labels: TmuxLabels::default(),
            last_drawn: None,
        }
    }

    /// Redraws if states or attention changed since the last draw.
    async fn update(&mut self, snapshot: &Snapshot) {
        let key = (
            snapshot.sessions().map(|s| (s.pid, s.state)).collect::<Vec<_>>(),
            snapshot.attention,
        );
        if self.last_drawn.as_ref() == Some(&key) {
            return;
        }

        let pids_changed = self.last_drawn.as_ref().map_or(true, |(last, _)| {
            !last.iter().map(|(pid, _)| pid).eq(key.0.iter().map(|(pid, _)| pid))
        });
        if pids_changed {
            self.labels = load_labels().await;
        }

        for pid in &snapshot.newly_completed {
            info!(pid, "Session finished");
        }

        println!(
            "{}",
            summary_line(&self.target, snapshot.counts(), snapshot.attention)
        );
        if let Some(hint) = done_hint(&snapshot.done_pids()) {
            println!("{hint}");
        }
        if snapshot.is_empty() {
            self.last_drawn = Some(key);
            return;
        }
        print!(
            "{}",
            render_table(snapshot.sessions(), &self.labels, snapshot.taken_at)
        );
        self.last_drawn = Some(key);
    }
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

// ============================================================================
// Rendering
// ============================================================================

/// `claude: 2 running, 1 idle, 1 done [!]`
fn summary_line(target: &str, counts: SessionCounts, attention: bool) -> String {
    let flag = if attention { " [!]" } else { "" };
    if counts.total() == 0 {
        return format!("{target}: no sessions{flag}");
    }
    format!("{target}: {counts}{flag}")
}

/// `finished: 412, 588 (ack to clear)`, or nothing if no session is Done.
fn done_hint(done: &[u32]) -> Option<String> {
    if done.is_empty() {
        return None;
    }
    let pids: Vec<String> = done.iter().map(u32::to_string).collect();
    Some(format!("finished: {} (ack to clear)", pids.join(", ")))
}

fn render_table<'a>(
    sessions: impl Iterator<Item = &'a Session>,
    labels: &dyn LabelResolver,
    now: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    for session in sessions {
        out.push_str(&format!(
            "  {} {:>7}  {:<8} {:>5.1}%  {:>5}  {}\n",
            session.state.icon(),
            session.pid,
            session.state.label(),
            session.cpu_percent,
            format_age(session.time_in_state(now)),
            display_label(labels, &session.tty),
        ));
    }
    out
}

/// Compact age: `42s`, `7m`, `3h`, `2d`.
fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m", secs / 60),
        3600..=86_399 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86_400),
    }
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinError;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, fmt::time::ChronoUtc, prelude::*, EnvFilter};

use mirrorsync::daemon::MANUAL_COMMIT_MESSAGE;
use mirrorsync::health::CheckResult;
use mirrorsync::linker::CopyMethod;
use mirrorsync::server::{self, AppState};
use mirrorsync::{EnvConfig, GitCli, HealthCheck, LinkAction, Settings, SyncDaemon};

#[derive(Parser)]
#[command(name = "mirrorsync")]
#[command(about = "Mirror live directories into a git repository and keep them synchronized")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync daemon and the management server (default)
    Run,

    /// Run the sync daemon without the management server
    Daemon,

    /// Bootstrap once, link targets and push the result
    Init,

    /// Run a single pull/commit/push cycle
    SyncNow,

    /// Migrate targets and repair their symlinks
    Relink,

    /// Write .gitkeep sentinels into empty directories
    TrackEmpty,

    /// Show mirror status
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// System health check and diagnostics
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;
    info!("Starting mirrorsync v{}", env!("CARGO_PKG_VERSION"));

    let env = Arc::new(EnvConfig::from_env().context("Failed to load configuration")?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(env, true).await,
        Commands::Daemon => cmd_run(env, false).await,
        Commands::Init => cmd_init(&env).await,
        Commands::SyncNow => cmd_sync_now(&env).await,
        Commands::Relink => cmd_relink(&env).await,
        Commands::TrackEmpty => cmd_track_empty(&env).await,
        Commands::Status { json } => cmd_status(&env, json).await,
        Commands::Doctor => cmd_doctor(&env),
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_timer(ChronoUtc::new("%Y-%m-%d %H:%M:%S".to_string())),
        )
        .with(filter)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}

fn new_daemon(env: &EnvConfig) -> SyncDaemon {
    SyncDaemon::new(Settings::resolve(env), Arc::new(GitCli::new()))
}

/// Run the daemon, optionally with the management server, until a signal arrives
async fn cmd_run(env: Arc<EnvConfig>, with_server: bool) -> Result<()> {
    let daemon = Arc::new(new_daemon(&env));
    let (shutdown_sender, _) = broadcast::channel::<()>(1);

    // Spawn shutdown signal handler
    tokio::spawn({
        let daemon = Arc::clone(&daemon);
        let shutdown_sender = shutdown_sender.clone();
        async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received, stopping...");
            daemon.request_stop();
            let _ = shutdown_sender.send(());
        }
    });

    let mut daemon_task = tokio::spawn({
        let daemon = Arc::clone(&daemon);
        async move { daemon.run().await }
    });

    if !with_server {
        return flatten(daemon_task.await);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], env.port));
    let state = AppState::new(Arc::clone(&daemon), Arc::clone(&env));
    let mut shutdown_receiver = shutdown_sender.subscribe();
    let mut server_task = tokio::spawn(server::serve(state, addr, async move {
        let _ = shutdown_receiver.recv().await;
    }));

    tokio::select! {
        joined = &mut daemon_task => {
            let _ = shutdown_sender.send(());
            if let Err(e) = flatten(server_task.await) {
                warn!("Management server exited with error: {:#}", e);
            }
            flatten(joined)
        }
        joined = &mut server_task => {
            daemon.request_stop();
            if let Err(e) = flatten(daemon_task.await) {
                warn!("Daemon exited with error: {:#}", e);
            }
            flatten(joined)
        }
    }
}

fn flatten(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    joined.context("Task panicked")?
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => debug!("Ctrl+C received"),
                    _ = terminate.recv() => debug!("SIGTERM received"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    debug!("Ctrl+C received");
}

async fn cmd_init(env: &EnvConfig) -> Result<()> {
    println!("🚀 Initializing mirror...");

    let daemon = new_daemon(env);
    let report = daemon.init_once(daemon.settings()).await?;

    println!("✅ Mirror initialized on branch {}", report.branch);
    if !report.aligned {
        println!("⚠️  HEAD is not aligned with the remote yet");
    }
    println!("   Targets linked: {}", report.linked);
    println!(
        "   {}",
        if report.committed { "Committed and pushed link changes" } else { "Nothing to commit" }
    );
    Ok(())
}

async fn cmd_sync_now(env: &EnvConfig) -> Result<()> {
    let daemon = new_daemon(env);
    let outcome = daemon
        .pull_commit_push(daemon.settings(), MANUAL_COMMIT_MESSAGE)
        .await?;

    match (outcome.committed, outcome.pushed) {
        (true, true) => println!("✅ Committed and pushed changes"),
        (true, false) => println!("⚠️  Committed changes, push failed"),
        (false, _) => println!("✅ Nothing to commit"),
    }
    Ok(())
}

async fn cmd_relink(env: &EnvConfig) -> Result<()> {
    let daemon = new_daemon(env);
    let report = daemon.link_and_track(daemon.settings()).await?;

    for outcome in &report.outcomes {
        println!("🔗 {} -> {}", outcome.source.display(), outcome.destination.display());
        println!("   {}", describe(&outcome.action));
    }
    println!("✅ {} target(s) linked, {} sentinel(s) written", report.outcomes.len(), report.sentinels);
    Ok(())
}

fn describe(action: &LinkAction) -> String {
    match action {
        LinkAction::AlreadyLinked => "already linked".to_string(),
        LinkAction::Relinked => "symlink repaired".to_string(),
        LinkAction::MigratedDirectory { method: CopyMethod::Rsync } => {
            "directory migrated with rsync".to_string()
        }
        LinkAction::MigratedDirectory {
            method: CopyMethod::Manual { copied, skipped },
        } => format!("directory migrated ({} copied, {} already present)", copied, skipped),
        LinkAction::MigratedFile { moved: true } => "file moved into mirror".to_string(),
        LinkAction::MigratedFile { moved: false } => {
            "mirror copy kept, local file removed".to_string()
        }
        LinkAction::CreatedPlaceholder { directory: true } => "empty directory created".to_string(),
        LinkAction::CreatedPlaceholder { directory: false } => "empty file created".to_string(),
    }
}

async fn cmd_track_empty(env: &EnvConfig) -> Result<()> {
    let daemon = new_daemon(env);
    let written = daemon.track(daemon.settings()).await?;
    println!("✅ {} sentinel(s) written", written);
    Ok(())
}

async fn cmd_status(env: &EnvConfig, json: bool) -> Result<()> {
    let daemon = new_daemon(env);
    let report = daemon.report(daemon.settings()).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("📊 Mirror Status");
    println!();
    println!("   Base:       {}", report.base);
    println!("   Mirror:     {}", report.hist_dir);
    println!("   Repository: {} ({})", report.repo, report.branch);
    println!("   Targets:    {}", report.targets.join(" "));
    if !report.excludes.is_empty() {
        println!("   Excludes:   {}", report.excludes.join(" "));
    }
    println!();

    if !report.git_initialized {
        println!("⚠️  Mirror is not a git repository yet. Run: mirrorsync init");
        return Ok(());
    }

    let short = |hash: &str| hash.chars().take(8).collect::<String>();
    println!("   HEAD:        {}", short(&report.head));
    println!("   Remote HEAD: {}", short(&report.remote_head));
    println!("   Dirty:       {}", if report.dirty { "yes" } else { "no" });
    println!("   Ready:       {}", if report.ready { "yes" } else { "no" });
    Ok(())
}

fn cmd_doctor(env: &EnvConfig) -> Result<()> {
    let health = HealthCheck::run(&Settings::resolve(env));
    print_health_report(&health);
    Ok(())
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 mirrorsync System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}

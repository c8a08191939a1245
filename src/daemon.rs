//! Sync Daemon - bootstrap, HEAD alignment, migration and the periodic cycle
//!
//! The daemon drives one mirror through a fixed sequence of phases:
//!
//! ```text
//! Idle -> Bootstrapping -> Aligned -> Linked -> Cycling -> Stopped
//! ```
//!
//! Bootstrapping retries until the local `HEAD` equals the remote branch tip,
//! so live directories are never migrated into a half-fetched tree. Every
//! sequence that mutates the repository runs under a single async mutex,
//! shared with the management interface.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::exclude::sync_private_exclude;
use crate::git::{Vcs, REMOTE};
use crate::linker::{migrate_and_link, precreate_dirlike, LinkOutcome};
use crate::tracker::track_empty_dirs;

pub const LINK_COMMIT_MESSAGE: &str = "chore(sync): initial link & empty dirs";
pub const INIT_COMMIT_MESSAGE: &str = "chore(sync): link and track empty dirs";
pub const PERIODIC_COMMIT_MESSAGE: &str = "chore(sync): periodic commit";
pub const MANUAL_COMMIT_MESSAGE: &str = "chore(sync): manual commit";

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(3);
const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Lifecycle phase of the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Bootstrapping,
    Aligned,
    Linked,
    Cycling,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Bootstrapping => "bootstrapping",
            Phase::Aligned => "aligned",
            Phase::Linked => "linked",
            Phase::Cycling => "cycling",
            Phase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// How the bootstrap loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bootstrap {
    Aligned { branch: String, attempts: u32 },
    Interrupted,
}

/// Result of a single bootstrap attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub branch: String,
    pub aligned: bool,
}

/// Result of migration plus empty-directory tracking
#[derive(Debug, Clone)]
pub struct LinkReport {
    pub outcomes: Vec<LinkOutcome>,
    pub sentinels: usize,
}

/// Result of one pull/commit/push cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleOutcome {
    pub committed: bool,
    pub pushed: bool,
    pub sentinels: usize,
}

/// Result of a manual initialization
#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    pub branch: String,
    pub aligned: bool,
    pub linked: usize,
    pub committed: bool,
}

/// Cycle statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleStats {
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_commit_at: Option<DateTime<Utc>>,
}

/// Snapshot of the mirror served by `status` endpoints and commands
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub base: String,
    pub hist_dir: String,
    pub branch: String,
    pub repo: String,
    pub targets: Vec<String>,
    pub excludes: Vec<String>,
    pub ready: bool,
    pub git_initialized: bool,
    pub dirty: bool,
    pub head: String,
    pub remote_head: String,
    pub phase: Phase,
    pub stats: CycleStats,
}

/// The synchronization daemon
pub struct SyncDaemon {
    settings: Settings,
    vcs: Arc<dyn Vcs>,
    lock: Mutex<()>,
    stop: AtomicBool,
    phase: watch::Sender<Phase>,
    branch: RwLock<Option<String>>,
    stats: std::sync::Mutex<CycleStats>,
    retry_backoff: Duration,
    tick: Duration,
}

impl SyncDaemon {
    /// Create a daemon for `settings`; nothing runs until [`SyncDaemon::run`]
    pub fn new(settings: Settings, vcs: Arc<dyn Vcs>) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            settings,
            vcs,
            lock: Mutex::new(()),
            stop: AtomicBool::new(false),
            phase,
            branch: RwLock::new(None),
            stats: std::sync::Mutex::new(CycleStats::default()),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            tick: DEFAULT_TICK,
        }
    }

    /// Delay between failed bootstrap attempts
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Granularity at which sleeps observe a stop request
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Watch phase transitions
    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn stats(&self) -> CycleStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Ask every loop to exit at its next check
    pub fn request_stop(&self) {
        info!("Stop requested");
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Branch actually checked out, falling back to the configured one
    pub fn effective_branch(&self, settings: &Settings) -> String {
        self.branch
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| settings.branch.clone())
    }

    /// Run every phase until a stop is requested.
    ///
    /// Returns an error only for fatal configuration problems.
    pub async fn run(&self) -> Result<()> {
        info!("Starting sync daemon");
        let settings = &self.settings;
        best_effort("Removing ready file", remove_ready_file(&settings.ready_file));

        let branch = match self.ensure_remote_ready(settings).await {
            Ok(Bootstrap::Aligned { branch, .. }) => branch,
            Ok(Bootstrap::Interrupted) => {
                self.set_phase(Phase::Stopped);
                return Ok(());
            }
            Err(e) => {
                self.set_phase(Phase::Stopped);
                return Err(e);
            }
        };

        if let Err(e) = self.initial_link(settings, &branch).await {
            error!("Link phase failed: {:#}", e);
        }

        self.set_phase(Phase::Cycling);
        info!("Sync loop started with interval: {:?}", settings.interval);

        while !self.is_stopping() {
            let started = Instant::now();
            match self.pull_commit_push(settings, PERIODIC_COMMIT_MESSAGE).await {
                Ok(outcome) => debug!(
                    "Sync cycle finished in {:.2}s: committed={}, pushed={}",
                    started.elapsed().as_secs_f64(),
                    outcome.committed,
                    outcome.pushed
                ),
                Err(e) => error!("Sync cycle failed: {:#}", e),
            }

            if !self.sleep_interruptible(settings.interval).await {
                break;
            }
        }

        self.set_phase(Phase::Stopped);
        info!("Sync daemon stopped");
        Ok(())
    }

    /// Retry bootstrap attempts until `HEAD` is aligned with the remote.
    ///
    /// Missing credentials fail immediately; every other error is retried after
    /// the backoff, without limit.
    pub async fn ensure_remote_ready(&self, settings: &Settings) -> Result<Bootstrap> {
        if let Err(e) = settings.require_remote() {
            error!("Cannot bootstrap: {}", e);
            return Err(e.into());
        }

        self.set_phase(Phase::Bootstrapping);
        let mut attempts = 0;

        loop {
            if self.is_stopping() {
                return Ok(Bootstrap::Interrupted);
            }

            attempts += 1;
            match self.bootstrap_attempt(settings).await {
                Ok(attempt) if attempt.aligned => {
                    info!("Initial fetch complete and HEAD aligned with {}/{}", REMOTE, attempt.branch);
                    self.set_branch(&attempt.branch);
                    self.set_phase(Phase::Aligned);
                    return Ok(Bootstrap::Aligned {
                        branch: attempt.branch,
                        attempts,
                    });
                }
                Ok(_) => info!("HEAD not aligned with {}, retrying", REMOTE),
                Err(e) => error!("Bootstrap attempt {} failed: {:#}", attempts, e),
            }

            if !self.sleep_interruptible(self.retry_backoff).await {
                return Ok(Bootstrap::Interrupted);
            }
        }
    }

    /// One pass of repo setup, remote config and fetch or initial push
    pub async fn bootstrap_attempt(&self, settings: &Settings) -> Result<Attempt> {
        let dir = &settings.hist_dir;
        let _guard = self.lock.lock().await;

        self.vcs
            .ensure_repo(dir, &settings.branch, &settings.identity)
            .await?;
        best_effort(
            "Updating private exclude file",
            sync_private_exclude(dir, &settings.private_excludes()),
        );
        self.vcs.set_remote(dir, &settings.remote_url()).await?;

        let branch = if self.vcs.remote_is_empty(dir).await? {
            info!("Remote is empty, creating initial commit and pushing");
            self.vcs.initial_commit_if_needed(dir).await?;
            self.vcs.push(dir, &settings.branch).await?;
            settings.branch.clone()
        } else {
            self.vcs.fetch_and_checkout(dir, &settings.branch).await?
        };

        let aligned = self.head_matches_origin(dir, &branch).await?;
        Ok(Attempt { branch, aligned })
    }

    /// True when `HEAD` and `origin/<branch>` resolve to the same commit
    pub async fn head_matches_origin(&self, dir: &Path, branch: &str) -> Result<bool> {
        let head = self.vcs.rev_parse(dir, "HEAD").await?;
        let remote = self
            .vcs
            .rev_parse(dir, &format!("{}/{}", REMOTE, branch))
            .await?;

        Ok(matches!((head, remote), (Some(local), Some(remote)) if local == remote))
    }

    /// Precreate, migrate and track empty directories.
    ///
    /// Runs without the repository lock; every step is idempotent.
    pub async fn link_and_track(&self, settings: &Settings) -> Result<LinkReport> {
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || -> Result<LinkReport> {
            info!("Pre-creating directory targets");
            precreate_dirlike(&settings.hist_dir, &settings.targets)?;

            info!("Migrating targets and creating symlinks");
            let outcomes = migrate_and_link(&settings.base, &settings.hist_dir, &settings.targets)?;

            info!("Tracking empty directories");
            let sentinels =
                track_empty_dirs(&settings.hist_dir, &settings.targets, &settings.excludes)?;

            Ok(LinkReport { outcomes, sentinels })
        })
        .await
        .context("Link task panicked")?
    }

    /// Link phase after alignment: link, commit once, push best-effort
    pub async fn initial_link(&self, settings: &Settings, branch: &str) -> Result<LinkReport> {
        let report = self.link_and_track(settings).await?;

        {
            let _guard = self.lock.lock().await;
            let dir = &settings.hist_dir;
            if self.vcs.commit_if_dirty(dir, LINK_COMMIT_MESSAGE).await? {
                self.record_commit();
                best_effort("Initial push", self.vcs.push(dir, branch).await);
            }
        }

        best_effort("Writing ready file", write_ready_file(&settings.ready_file));
        self.set_phase(Phase::Linked);
        info!("Linked {} target(s)", report.outcomes.len());
        Ok(report)
    }

    /// One pull/commit/push cycle under the lock; the push is best-effort
    pub async fn pull_commit_push(&self, settings: &Settings, message: &str) -> Result<CycleOutcome> {
        let result = self.cycle(settings, message).await;

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        stats.total_cycles += 1;
        stats.last_cycle_at = Some(now);
        match &result {
            Ok(outcome) => {
                stats.successful_cycles += 1;
                if outcome.committed {
                    stats.last_commit_at = Some(now);
                }
            }
            Err(_) => stats.failed_cycles += 1,
        }

        result
    }

    async fn cycle(&self, settings: &Settings, message: &str) -> Result<CycleOutcome> {
        let branch = self.effective_branch(settings);
        let dir = &settings.hist_dir;
        let _guard = self.lock.lock().await;

        self.vcs
            .pull_rebase(dir, &branch)
            .await
            .context("Pull failed, skipping this cycle")?;

        let sentinels = self.track(settings).await?;
        let committed = self.vcs.commit_if_dirty(dir, message).await?;
        let pushed = best_effort("Push", self.vcs.push(dir, &branch).await).is_some();

        if committed && pushed {
            info!("Committed and pushed changes");
        }

        Ok(CycleOutcome {
            committed,
            pushed,
            sentinels,
        })
    }

    /// Single bootstrap attempt followed by linking, for manual initialization.
    ///
    /// Unlike the daemon's link phase, a failed push is returned to the caller.
    pub async fn init_once(&self, settings: &Settings) -> Result<InitReport> {
        settings.require_remote()?;

        let attempt = self.bootstrap_attempt(settings).await?;
        if attempt.aligned {
            self.set_branch(&attempt.branch);
        } else {
            warn!("HEAD not aligned with {}/{}", REMOTE, attempt.branch);
        }

        let report = self.link_and_track(settings).await?;

        let committed = {
            let _guard = self.lock.lock().await;
            let dir = &settings.hist_dir;
            let committed = self.vcs.commit_if_dirty(dir, INIT_COMMIT_MESSAGE).await?;
            if committed {
                self.record_commit();
                self.vcs.push(dir, &attempt.branch).await?;
            }
            committed
        };

        best_effort("Writing ready file", write_ready_file(&settings.ready_file));

        Ok(InitReport {
            branch: attempt.branch,
            aligned: attempt.aligned,
            linked: report.outcomes.len(),
            committed,
        })
    }

    /// Rebase onto the remote branch under the lock
    pub async fn pull(&self, settings: &Settings) -> Result<()> {
        let branch = self.effective_branch(settings);
        let _guard = self.lock.lock().await;
        self.vcs.pull_rebase(&settings.hist_dir, &branch).await?;
        Ok(())
    }

    /// Push the current branch under the lock
    pub async fn push(&self, settings: &Settings) -> Result<()> {
        let branch = self.effective_branch(settings);
        let _guard = self.lock.lock().await;
        self.vcs.push(&settings.hist_dir, &branch).await?;
        Ok(())
    }

    /// Write sentinels for empty directories, outside the lock
    pub async fn track(&self, settings: &Settings) -> Result<usize> {
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || {
            track_empty_dirs(&settings.hist_dir, &settings.targets, &settings.excludes)
        })
        .await
        .context("Tracking task panicked")?
    }

    /// Collect the mirror status for `settings`
    pub async fn report(&self, settings: &Settings) -> StatusReport {
        let dir = &settings.hist_dir;
        let branch = self.effective_branch(settings);
        let git_initialized = dir.join(".git").is_dir();

        let (dirty, head, remote_head) = if git_initialized {
            let dirty = self.vcs.is_dirty(dir).await.unwrap_or(false);
            let head = self.vcs.rev_parse(dir, "HEAD").await.ok().flatten();
            let remote_head = self
                .vcs
                .rev_parse(dir, &format!("{}/{}", REMOTE, branch))
                .await
                .ok()
                .flatten();
            (dirty, head.unwrap_or_default(), remote_head.unwrap_or_default())
        } else {
            (false, String::new(), String::new())
        };

        StatusReport {
            base: settings.base.display().to_string(),
            hist_dir: dir.display().to_string(),
            branch,
            repo: settings.github_repo.clone(),
            targets: settings.target_strings(),
            excludes: settings.excludes.clone(),
            ready: settings.ready_file.exists(),
            git_initialized,
            dirty,
            head,
            remote_head,
            phase: self.phase(),
            stats: self.stats(),
        }
    }

    fn set_phase(&self, phase: Phase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!("Daemon phase: {} -> {}", previous, phase);
        }
    }

    fn set_branch(&self, branch: &str) {
        *self.branch.write().unwrap_or_else(PoisonError::into_inner) = Some(branch.to_string());
    }

    fn record_commit(&self) {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_commit_at = Some(Utc::now());
    }

    /// Sleep in ticks; false when a stop was requested.
    ///
    /// A duration past the clock's range never elapses and only a stop ends it.
    async fn sleep_interruptible(&self, total: Duration) -> bool {
        let deadline = Instant::now().checked_add(total);
        loop {
            if self.is_stopping() {
                return false;
            }
            let step = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return true;
                    }
                    (deadline - now).min(self.tick)
                }
                None => self.tick,
            };
            tokio::time::sleep(step).await;
        }
    }
}

/// Log and discard the error of a step whose failure must not stop the caller
pub fn best_effort<T, E: fmt::Display>(what: &str, result: std::result::Result<T, E>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{} failed (ignored): {:#}", what, e);
            None
        }
    }
}

fn write_ready_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, Utc::now().to_rfc3339())
        .with_context(|| format!("Failed to write ready file {}", path.display()))?;
    debug!("Ready file written: {}", path.display());
    Ok(())
}

fn remove_ready_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove ready file {}", path.display())),
    }
}

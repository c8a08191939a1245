//! mirrorsync - keep live directories mirrored into a git repository
//!
//! Configured targets are moved into a local clone of a remote repository and
//! replaced by symbolic links. A daemon then keeps the clone in sync with
//! periodic pull, commit and push cycles.
//!
//! ## Modules
//!
//! - [`config`]: environment and override-file configuration
//! - [`exclude`]: exclusion prefixes and the private ignore file
//! - [`git`]: the version-control adapter
//! - [`linker`]: migration of targets into the mirror
//! - [`tracker`]: `.gitkeep` sentinels for empty directories
//! - [`daemon`]: bootstrap, alignment and the sync loop
//! - [`server`]: management HTTP interface
//! - [`health`]: preflight checks

pub mod config;
pub mod daemon;
pub mod exclude;
pub mod git;
pub mod health;
pub mod linker;
pub mod server;
pub mod tracker;

pub use config::{ConfigError, EnvConfig, Settings, Target};
pub use daemon::{Phase, SyncDaemon};
pub use git::{GitCli, GitError, Vcs};
pub use health::HealthCheck;
pub use linker::{LinkAction, LinkOutcome};

//! Common test utilities and helpers for mirrorsync tests
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use mirrorsync::{EnvConfig, GitCli, Settings};
use tempfile::TempDir;

/// A bare remote, a mirror location and a base directory inside one temp dir
pub struct Fixture {
    pub temp_dir: TempDir,
    pub remote: PathBuf,
    pub mirror: PathBuf,
    pub base: PathBuf,
    pub gitconfig: PathBuf,
}

impl Fixture {
    /// Fixture whose remote has no commits and `main` as its default branch
    pub fn new() -> Self {
        Self::with_default_branch("main")
    }

    pub fn with_default_branch(branch: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path().to_path_buf();

        let fixture = Self {
            remote: root.join("remote.git"),
            mirror: root.join("mirror"),
            base: root.join("base"),
            gitconfig: root.join("gitconfig"),
            temp_dir,
        };

        std::fs::create_dir_all(&fixture.base).expect("Failed to create base dir");
        fixture.git(
            &root,
            &["init", "--bare", "-b", branch, &fixture.remote.to_string_lossy()],
        );
        fixture
    }

    /// Run git with the isolated global config, panicking on failure
    pub fn git(&self, dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_CONFIG_GLOBAL", &self.gitconfig)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .expect("Failed to execute git");

        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    pub fn remote_url(&self) -> String {
        format!("file://{}", self.remote.display())
    }

    /// Push one commit with `files` to `branch` of the remote
    pub fn seed_remote(&self, branch: &str, files: &[(&str, &str)]) -> String {
        let seed = self.temp_dir.path().join(format!("seed-{}", branch));
        if !seed.exists() {
            self.git(
                self.temp_dir.path(),
                &["clone", &self.remote_url(), &seed.to_string_lossy()],
            );
        }
        self.git(&seed, &["checkout", "-B", branch]);
        if !self.git(&seed, &["ls-remote", "origin", branch]).is_empty() {
            self.git(&seed, &["fetch", "origin", branch]);
            self.git(&seed, &["reset", "--hard", "FETCH_HEAD"]);
        }

        for (path, content) in files {
            let file = seed.join(path);
            if let Some(parent) = file.parent() {
                std::fs::create_dir_all(parent).expect("Failed to create seed dir");
            }
            std::fs::write(&file, content).expect("Failed to write seed file");
        }

        self.git(&seed, &["add", "-A"]);
        self.git(
            &seed,
            &[
                "-c",
                "user.name=seed",
                "-c",
                "user.email=seed@local",
                "commit",
                "-m",
                "seed",
            ],
        );
        self.git(&seed, &["push", "origin", branch]);
        self.git(&seed, &["rev-parse", "HEAD"])
    }

    /// Tip of `branch` in the bare remote
    pub fn remote_head(&self, branch: &str) -> String {
        self.git(&self.remote, &["rev-parse", branch])
    }

    /// Files tracked at the tip of `branch` in the remote
    pub fn remote_files(&self, branch: &str) -> Vec<String> {
        self.git(&self.remote, &["ls-tree", "-r", "--name-only", branch])
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Subject of the tip commit of `branch` in the remote
    pub fn remote_subject(&self, branch: &str) -> String {
        self.git(&self.remote, &["log", "-1", "--format=%s", branch])
    }

    pub fn git_cli(&self) -> GitCli {
        GitCli::new().with_env("GIT_CONFIG_GLOBAL", self.gitconfig.to_string_lossy())
    }

    /// Environment snapshot pointing at the fixture
    pub fn env(&self, targets: &str, excludes: &str) -> EnvConfig {
        let base = self.base.to_string_lossy().into_owned();
        let mirror = self.mirror.to_string_lossy().into_owned();
        let remote_url = self.remote_url();

        EnvConfig::from_lookup(|key| match key {
            "BASE" => Some(base.clone()),
            "HIST_DIR" => Some(mirror.clone()),
            "GITHUB_PAT" => Some("test-token".to_string()),
            "GITHUB_REPO" => Some("owner/mirror".to_string()),
            "SYNC_TARGETS" => Some(targets.to_string()),
            "EXCLUDE_PATHS" => Some(excludes.to_string()),
            "SYNC_REMOTE_URL" => Some(remote_url.clone()),
            _ => None,
        })
        .expect("Failed to build env config")
    }

    pub fn settings(&self, targets: &str, excludes: &str) -> Settings {
        let mut settings = Settings::resolve(&self.env(targets, excludes));
        settings.interval = Duration::from_millis(50);
        settings
    }
}

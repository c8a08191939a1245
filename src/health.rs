//! Preflight checks for the `doctor` command
//!
//! Errors mean the daemon cannot work; warnings describe degraded behavior.

use crate::config::{mask_credentials, Settings};
use std::path::Path;
use std::process::Command;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Git installation status
    pub git: CheckResult,
    /// Credential and repository configuration
    pub remote: CheckResult,
    /// Base directory status
    pub base_dir: CheckResult,
    /// Mirror repository state (warning only)
    pub mirror: CheckResult,
    /// rsync availability (warning only, manual copy is the fallback)
    pub rsync: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub fn run(settings: &Settings) -> Self {
        Self {
            git: Self::check_git(),
            remote: Self::check_remote(settings),
            base_dir: Self::check_base_dir(&settings.base),
            mirror: Self::check_mirror(&settings.hist_dir),
            rsync: Self::check_rsync(),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.git.passed && self.remote.passed && self.base_dir.passed
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, result)| result)
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, result)| result)
            .filter(|r| r.is_warning)
            .collect()
    }

    fn check_git() -> CheckResult {
        match Command::new("git").arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                CheckResult::ok_with_details("Git installed", version.trim().to_string())
            }
            Ok(_) => CheckResult::error("Git command failed"),
            Err(_) => CheckResult::error_with_details(
                "Git not found in PATH",
                "Install git: https://git-scm.com/downloads",
            ),
        }
    }

    fn check_remote(settings: &Settings) -> CheckResult {
        match settings.require_remote() {
            Ok(()) => CheckResult::ok_with_details(
                "Remote configured",
                mask_credentials(&settings.remote_url()),
            ),
            Err(e) => CheckResult::error_with_details(
                "Remote not configured",
                format!("{}\nSet GITHUB_PAT and GITHUB_REPO", e),
            ),
        }
    }

    fn check_base_dir(base: &Path) -> CheckResult {
        if base.is_dir() {
            CheckResult::ok_with_details("Base directory exists", base.display().to_string())
        } else {
            CheckResult::error_with_details(
                "Base directory does not exist",
                format!("Run: mkdir -p {}", base.display()),
            )
        }
    }

    fn check_mirror(hist_dir: &Path) -> CheckResult {
        if hist_dir.join(".git").is_dir() {
            CheckResult::ok_with_details("Mirror repository initialized", hist_dir.display().to_string())
        } else {
            CheckResult::warning_with_details(
                "Mirror repository not initialized yet",
                format!("{} is created on first bootstrap. Run: mirrorsync init", hist_dir.display()),
            )
        }
    }

    fn check_rsync() -> CheckResult {
        match Command::new("rsync").arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                let first_line = version.lines().next().unwrap_or_default().trim().to_string();
                CheckResult::ok_with_details("rsync installed", first_line)
            }
            _ => CheckResult::warning_with_details(
                "rsync not found",
                "Directories are migrated with the built-in copy instead",
            ),
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 5] {
        [
            ("Git Installation", &self.git),
            ("Remote Configuration", &self.remote),
            ("Base Directory", &self.base_dir),
            ("Mirror Repository", &self.mirror),
            ("rsync", &self.rsync),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GitIdentity;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    fn ok(message: &str) -> CheckResult {
        CheckResult::ok_with_details(message, "details")
    }

    fn settings(base: PathBuf, hist_dir: PathBuf) -> Settings {
        Settings {
            ready_file: hist_dir.join(".sync.ready"),
            base,
            hist_dir,
            branch: "main".to_string(),
            github_pat: "ghp_secret".to_string(),
            github_repo: "owner/saves".to_string(),
            targets: Vec::new(),
            excludes: Vec::new(),
            interval: Duration::from_secs(180),
            identity: GitIdentity::default(),
            remote_url_override: None,
        }
    }

    #[test]
    fn test_check_result_constructors() {
        let warning = CheckResult::warning_with_details("Test warning", "Warning details");
        assert!(warning.passed); // Warnings still "pass"
        assert!(warning.is_warning);
        assert_eq!(warning.details, Some("Warning details".to_string()));

        let error = CheckResult::error("Test failed");
        assert!(!error.passed);
        assert!(!error.is_warning);
        assert!(error.details.is_none());
    }

    #[test]
    fn test_git_check() {
        let result = HealthCheck::check_git();
        // Git is required by the integration tests as well
        assert!(result.passed);
        assert!(result.details.is_some());
    }

    #[test]
    fn test_remote_check_masks_credential() {
        let temp_dir = TempDir::new().unwrap();
        let mut settings = settings(temp_dir.path().to_path_buf(), temp_dir.path().join("mirror"));

        let result = HealthCheck::check_remote(&settings);
        assert!(result.passed);
        let details = result.details.unwrap();
        assert!(details.contains("owner/saves"));
        assert!(!details.contains("ghp_secret"));

        settings.github_repo.clear();
        let result = HealthCheck::check_remote(&settings);
        assert!(!result.passed);
        assert!(!result.is_warning);
    }

    #[test]
    fn test_base_and_mirror_checks() {
        let temp_dir = TempDir::new().unwrap();
        let mirror = temp_dir.path().join("mirror");

        assert!(HealthCheck::check_base_dir(temp_dir.path()).passed);
        assert!(!HealthCheck::check_base_dir(&temp_dir.path().join("missing")).passed);

        let result = HealthCheck::check_mirror(&mirror);
        assert!(result.passed);
        assert!(result.is_warning);

        std::fs::create_dir_all(mirror.join(".git")).unwrap();
        assert!(!HealthCheck::check_mirror(&mirror).is_warning);
    }

    #[test]
    fn test_run_reports_missing_base_as_error() {
        let temp_dir = TempDir::new().unwrap();
        let settings = settings(temp_dir.path().join("missing"), temp_dir.path().join("mirror"));

        let health = HealthCheck::run(&settings);
        assert!(!health.all_passed());
        assert!(health.errors().iter().any(|r| r.message == "Base directory does not exist"));
        assert!(health.rsync.passed);
    }

    #[test]
    fn test_warnings_do_not_fail() {
        let health = HealthCheck {
            git: ok("Git OK"),
            remote: ok("Remote OK"),
            base_dir: ok("Dir OK"),
            mirror: CheckResult::warning_with_details("Not initialized", "details"),
            rsync: CheckResult::warning_with_details("No rsync", "details"),
        };
        assert!(health.all_passed());
        assert!(health.errors().is_empty());
        assert_eq!(health.warnings().len(), 2);
    }

    #[test]
    fn test_errors_returns_only_errors() {
        let health = HealthCheck {
            git: CheckResult::error("Git error"),
            remote: ok("Remote OK"),
            base_dir: CheckResult::error("Dir error"),
            mirror: ok("Mirror OK"),
            rsync: CheckResult::warning_with_details("No rsync", "details"),
        };
        let errors = health.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|r| !r.passed));
    }

    #[test]
    fn test_all_checks_returns_all_five() {
        let health = HealthCheck {
            git: ok("Git OK"),
            remote: ok("Remote OK"),
            base_dir: ok("Dir OK"),
            mirror: ok("Mirror OK"),
            rsync: ok("rsync OK"),
        };
        let names: Vec<&str> = health.all_checks().iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            vec![
                "Git Installation",
                "Remote Configuration",
                "Base Directory",
                "Mirror Repository",
                "rsync"
            ]
        );
    }
}

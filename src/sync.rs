//! Smart sync: publish a build's output to production paths
//!
//! Mirrors the structure of the source directory into each configured
//! target path while leaving a fixed-plus-project-configured preserve set
//! untouched. Follows a "shell out with a timeout, fall back on failure"
//! shape: an external `rsync` is tried first, then a manual two-pass
//! copy/prune.

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::process::Command;

use crate::error::{EngineError, EngineResult};
use crate::glob::matches_preserve_pattern;

const RSYNC_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The fixed system preserve-set patterns, independent of any project
/// configuration. Built once per process: `publish` consults it on
/// every file visited during a sync, so it is worth not re-allocating the
/// list on every call.
static FIXED_PRESERVE_PATTERNS: Lazy<Vec<String>> = Lazy::new(|| {
    [
        // Environment / config files
        ".env", ".env.*", ".user.ini", ".htaccess", "web.config", "php.ini", "php-fpm.conf",
        ".deploy-center",
        // ACME / TLS material
        ".well-known/**", "ssl/**", "certs/**",
        // Dependency artefacts and lock files
        "node_modules", "package-lock.json", "yarn.lock", "pnpm-lock.yaml", "composer.lock",
        // User data
        "uploads/**", "storage/**", "public/uploads/**", "public/storage/**",
        // Caches and temp
        "Cache", "cache", "tmp", "temp",
        // Logs
        "Logs", "logs", "*.log", "*-debug.log",
        // Embedded databases
        "*.sqlite", "*.sqlite3", "*.db",
        // Sessions
        "sessions",
        // Backups
        "backups/**", "*.bak", "*.backup",
        // OS junk
        ".DS_Store", "Thumbs.db", "desktop.ini",
        // VCS directories
        ".git", ".svn", ".hg",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
});

pub fn fixed_preserve_patterns() -> Vec<String> {
    FIXED_PRESERVE_PATTERNS.clone()
}

/// The union of the fixed system list and a project's `SyncIgnorePatterns`.
pub fn preserve_set(project_patterns: &[String]) -> Vec<String> {
    let mut patterns = FIXED_PRESERVE_PATTERNS.clone();
    patterns.extend(project_patterns.iter().cloned());
    patterns
}

/// True if `relative_path` (forward-slash, relative to the sync root)
/// matches any pattern in the preserve set.
pub fn is_preserved(relative_path: &str, preserve_patterns: &[String]) -> bool {
    preserve_patterns.iter().any(|pattern| matches_preserve_pattern(relative_path, pattern))
}

/// Publish `source` into every path in `target_paths`. If `build_output` is
/// set, publish `source.join(build_output)` instead (failing with a
/// diagnostic if that subdirectory doesn't exist). Aggregates per-path
/// failures into a single error naming every failing path.
pub async fn publish(
    source: &Path,
    target_paths: &[String],
    build_output: Option<&str>,
    preserve_patterns: &[String],
    rsync_options: Option<&[String]>,
) -> EngineResult<()> {
    let effective_source = match build_output {
        Some(sub) => {
            let path = source.join(sub);
            if !path.is_dir() {
                return Err(EngineError::PublishFailure {
                    paths: format!("build output directory '{sub}' does not exist in workspace"),
                });
            }
            path
        }
        None => source.to_path_buf(),
    };

    let mut failures = Vec::new();
    for target in target_paths {
        if let Err(e) = sync_one(&effective_source, Path::new(target), preserve_patterns, rsync_options).await {
            tracing::error!(target = %target, error = %e, "smart sync failed for target path");
            failures.push(format!("{target}: {e}"));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(EngineError::PublishFailure { paths: failures.join("; ") })
    }
}

async fn sync_one(
    source: &Path,
    target: &Path,
    preserve_patterns: &[String],
    rsync_options: Option<&[String]>,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(target).await?;

    if rsync_available().await {
        match sync_with_rsync(source, target, preserve_patterns, rsync_options).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "rsync sync failed, falling back to manual sync");
            }
        }
    }

    sync_manual(source, target, preserve_patterns).await
}

async fn rsync_available() -> bool {
    Command::new("rsync").arg("--version").output().await.map(|o| o.status.success()).unwrap_or(false)
}

/// Default "archive + delete-extraneous" rsync flags used when a project
/// does not configure its own `RsyncOptions`.
fn default_rsync_options() -> Vec<String> {
    vec!["-a".to_string(), "--delete".to_string()]
}

async fn sync_with_rsync(
    source: &Path,
    target: &Path,
    preserve_patterns: &[String],
    rsync_options: Option<&[String]>,
) -> anyhow::Result<()> {
    let options = rsync_options.map(<[String]>::to_vec).unwrap_or_else(default_rsync_options);

    let mut command = Command::new("rsync");
    command.args(&options);
    for pattern in preserve_patterns {
        command.arg("--exclude").arg(pattern);
    }
    // Trailing slash on the source copies its *contents* into target,
    // matching the manual algorithm's semantics.
    let mut source_arg = source.to_string_lossy().to_string();
    if !source_arg.ends_with('/') {
        source_arg.push('/');
    }
    command.arg(source_arg).arg(target);

    let output = tokio::time::timeout(RSYNC_TIMEOUT, command.output())
        .await
        .map_err(|_| anyhow::anyhow!("rsync timed out after {:?}", RSYNC_TIMEOUT))??;

    if output.status.success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("rsync exited with {}: {}", output.status, String::from_utf8_lossy(&output.stderr)))
    }
}

/// Two-pass manual algorithm: copy everything from `source` not matched by
/// the preserve set, overwriting existing files; then remove anything from
/// `target` that's absent from `source` and not preserved.
async fn sync_manual(source: &Path, target: &Path, preserve_patterns: &[String]) -> anyhow::Result<()> {
    let source = source.to_path_buf();
    let target = target.to_path_buf();
    let preserve_patterns = preserve_patterns.to_vec();
    tokio::task::spawn_blocking(move || sync_manual_blocking(&source, &target, &preserve_patterns)).await?
}

fn sync_manual_blocking(source: &Path, target: &Path, preserve_patterns: &[String]) -> anyhow::Result<()> {
    copy_pass(source, target, "", preserve_patterns)?;
    prune_pass(source, target, "", preserve_patterns)?;
    Ok(())
}

fn copy_pass(source_root: &Path, target_root: &Path, relative: &str, preserve_patterns: &[String]) -> anyhow::Result<()> {
    let source_dir = join_relative(source_root, relative);
    for entry in std::fs::read_dir(&source_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let child_relative = if relative.is_empty() { name.clone() } else { format!("{relative}/{name}") };

        if is_preserved(&child_relative, preserve_patterns) {
            continue;
        }

        let source_path = entry.path();
        let target_path = join_relative(target_root, &child_relative);

        if source_path.is_dir() {
            std::fs::create_dir_all(&target_path)?;
            copy_pass(source_root, target_root, &child_relative, preserve_patterns)?;
        } else {
            if let Some(parent) = target_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&source_path, &target_path)?;
        }
    }
    Ok(())
}

fn prune_pass(source_root: &Path, target_root: &Path, relative: &str, preserve_patterns: &[String]) -> anyhow::Result<()> {
    let target_dir = join_relative(target_root, relative);
    if !target_dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(&target_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let child_relative = if relative.is_empty() { name.clone() } else { format!("{relative}/{name}") };

        if is_preserved(&child_relative, preserve_patterns) {
            continue;
        }

        let target_path = entry.path();
        let source_path = join_relative(source_root, &child_relative);

        if !source_path.exists() {
            if target_path.is_dir() {
                std::fs::remove_dir_all(&target_path)?;
            } else {
                std::fs::remove_file(&target_path)?;
            }
            continue;
        }

        if target_path.is_dir() && source_path.is_dir() {
            prune_pass(source_root, target_root, &child_relative, preserve_patterns)?;
        }
    }
    Ok(())
}

fn join_relative(root: &Path, relative: &str) -> PathBuf {
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

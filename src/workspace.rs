//! Workspace lifecycle: preparation, pre-flight disk space, cleanup
//!
//! Directory preparation follows a "remove and re-clone" pattern, and a
//! busy-handle recovery ladder uses the `ProcessGroup` abstraction to
//! reclaim workspaces a stuck child process is still holding open. The
//! disk-space probe uses `libc`'s `statvfs` directly on POSIX, in the same
//! low-level-FFI style as `process_group.rs`'s direct `nix` use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Minimum bytes free required at the deployments base path before a clone
/// proceeds.
pub const DEFAULT_MIN_FREE_DISK_BYTES: u64 = 5 * 1024 * 1024 * 1024;
/// Number of most-recent per-project deployment workspaces kept during
/// auto-pruning.
pub const DEFAULT_KEEP_LAST_N: usize = 5;

const IMMEDIATE_ATTEMPTS: u32 = 3;
const DEFERRED_RETRIES: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_millis(500);

/// Owns the deployment base directory: where per-deployment workspaces
/// live, where quarantined directories are relocated, and the pre-flight
/// capacity check.
#[derive(Clone)]
pub struct WorkspaceManager {
    base_path: PathBuf,
    min_free_bytes: u64,
    keep_last_n: usize,
}

impl WorkspaceManager {
    pub fn new(base_path: PathBuf, min_free_bytes: u64, keep_last_n: usize) -> Self {
        Self { base_path, min_free_bytes, keep_last_n }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// `<base>/project-<pid>/deployment-<did>`.
    pub fn workspace_path(&self, project_id: Uuid, deployment_id: Uuid) -> PathBuf {
        self.base_path
            .join(format!("project-{project_id}"))
            .join(format!("deployment-{deployment_id}"))
    }

    fn project_dir(&self, project_id: Uuid) -> PathBuf {
        self.base_path.join(format!("project-{project_id}"))
    }

    fn quarantine_dir(&self) -> PathBuf {
        self.base_path.join("_quarantine")
    }

    /// Pre-flight capacity check: require `min_free_bytes` free at the
    /// deployment base path. If short, prune old per-project deployment
    /// workspaces (keeping the most recent `keep_last_n`) across every
    /// project directory present, then re-check. Fatal ("Insufficient disk
    /// space") if still short afterwards.
    pub async fn ensure_capacity(&self) -> EngineResult<()> {
        std::fs::create_dir_all(&self.base_path)
            .map_err(|e| EngineError::Capacity(format!("failed to create deployments base path: {e}")))?;

        if free_bytes(&self.base_path) >= self.min_free_bytes {
            return Ok(());
        }

        tracing::warn!(
            base = %self.base_path.display(),
            "disk space below threshold, pruning old deployment workspaces"
        );
        self.prune_old_workspaces().await;

        if free_bytes(&self.base_path) >= self.min_free_bytes {
            return Ok(());
        }

        Err(EngineError::Capacity("Insufficient disk space".to_string()))
    }

    /// Keep only the `keep_last_n` most-recently-modified deployment
    /// directories under each `project-*` directory; delete the rest.
    async fn prune_old_workspaces(&self) {
        let Ok(project_dirs) = std::fs::read_dir(&self.base_path) else {
            return;
        };
        for project_entry in project_dirs.flatten() {
            let path = project_entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if !name.starts_with("project-") {
                continue;
            }
            self.prune_project_dir(&path).await;
        }
    }

    async fn prune_project_dir(&self, project_dir: &Path) {
        let Ok(entries) = std::fs::read_dir(project_dir) else {
            return;
        };
        let mut deployments: Vec<(PathBuf, std::time::SystemTime)> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.metadata().ok().and_then(|m| m.modified().ok()).map(|t| (e.path(), t)))
            .collect();
        deployments.sort_by(|a, b| b.1.cmp(&a.1));

        for (path, _) in deployments.into_iter().skip(self.keep_last_n) {
            tracing::info!(path = %path.display(), "pruning old deployment workspace to free disk space");
            let _ = remove_workspace_tree(&path).await;
        }
    }

    /// Create a fresh, empty workspace directory for one deployment.
    /// Proactively terminates any process whose working directory or
    /// command line references the path.
    pub async fn prepare(&self, project_id: Uuid, deployment_id: Uuid) -> EngineResult<PathBuf> {
        let path = self.workspace_path(project_id, deployment_id);
        if path.exists() {
            terminate_processes_referencing(&path).await;
            remove_workspace_tree(&path)
                .await
                .map_err(|e| EngineError::Transient(format!("failed to clear stale workspace: {e}")))?;
        }
        std::fs::create_dir_all(&path)
            .map_err(|e| EngineError::Transient(format!("failed to create workspace {}: {e}", path.display())))?;
        Ok(path)
    }

    /// Delete the per-deployment workspace, refusing if it resolves equal
    /// to any configured target path. Cleanup errors are never fatal to
    /// the deployment: this always returns `Ok` and logs internally,
    /// except the refusal case which the caller should have avoided by
    /// construction.
    pub async fn cleanup(&self, workspace: &Path, target_paths: &[String]) {
        if target_paths.iter().any(|t| paths_equal(Path::new(t), workspace)) {
            tracing::error!(workspace = %workspace.display(), "refusing to delete workspace: equals a configured target path");
            return;
        }
        if !workspace.exists() {
            return;
        }

        #[cfg(not(unix))]
        terminate_processes_referencing(workspace).await;

        for attempt in 1..=IMMEDIATE_ATTEMPTS {
            match remove_workspace_tree(workspace).await {
                Ok(()) => return,
                Err(e) if is_busy(&e) => {
                    tracing::warn!(workspace = %workspace.display(), attempt, error = %e, "workspace busy, retrying");
                    tokio::time::sleep(BASE_BACKOFF * attempt).await;
                }
                Err(e) => {
                    tracing::warn!(workspace = %workspace.display(), error = %e, "failed to remove workspace");
                    break;
                }
            }
        }

        if !workspace.exists() {
            return;
        }

        // Sustained busy: try clearing contents while keeping the
        // directory handle, which sometimes succeeds when a lock is held
        // on the directory entry itself rather than its children.
        if let Err(e) = clear_contents(workspace).await {
            tracing::warn!(workspace = %workspace.display(), error = %e, "failed to clear workspace contents");
        } else if std::fs::read_dir(workspace).map(|mut d| d.next().is_none()).unwrap_or(false) {
            let _ = tokio::fs::remove_dir(workspace).await;
            if !workspace.exists() {
                return;
            }
        }

        self.quarantine(workspace).await;
    }

    async fn quarantine(&self, workspace: &Path) {
        let quarantine_dir = self.quarantine_dir();
        if let Err(e) = std::fs::create_dir_all(&quarantine_dir) {
            tracing::error!(error = %e, "failed to create quarantine directory");
            self.schedule_deferred_retry(workspace.to_path_buf());
            return;
        }

        let destination = quarantine_dir.join(format!(
            "{}-{}",
            workspace.file_name().and_then(|n| n.to_str()).unwrap_or("workspace"),
            Uuid::new_v4().simple()
        ));

        match tokio::fs::rename(workspace, &destination).await {
            Ok(()) => {
                tracing::warn!(from = %workspace.display(), to = %destination.display(), "quarantined busy workspace");
                self.schedule_deferred_retry(destination);
            }
            Err(e) => {
                tracing::error!(workspace = %workspace.display(), error = %e, "failed to quarantine workspace");
                #[cfg(not(unix))]
                self.schedule_detached_rmdir(workspace.to_path_buf());
                #[cfg(unix)]
                self.schedule_deferred_retry(workspace.to_path_buf());
            }
        }
    }

    /// Background attempts at a longer delay that do not block the caller,
    /// for a directory that's still busy after quarantine.
    fn schedule_deferred_retry(&self, path: PathBuf) {
        tokio::spawn(async move {
            for attempt in 1..=DEFERRED_RETRIES {
                tokio::time::sleep(BASE_BACKOFF * 4 * attempt).await;
                match remove_workspace_tree(&path).await {
                    Ok(()) => {
                        tracing::info!(path = %path.display(), attempt, "deferred cleanup succeeded");
                        return;
                    }
                    Err(e) => {
                        tracing::debug!(path = %path.display(), attempt, error = %e, "deferred cleanup still busy");
                    }
                }
            }
            tracing::warn!(path = %path.display(), "deferred cleanup exhausted retries, leaving for manual sweep");
        });
    }

    #[cfg(not(unix))]
    fn schedule_detached_rmdir(&self, path: PathBuf) {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            let _ = tokio::process::Command::new("cmd")
                .args(["/C", "rmdir", "/S", "/Q"])
                .arg(&path)
                .output()
                .await;
        });
    }
}

fn paths_equal(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

async fn remove_workspace_tree(path: &Path) -> std::io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&path))
        .await
        .unwrap_or_else(|e| Err(std::io::Error::other(e)))
}

async fn clear_contents(path: &Path) -> std::io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        for entry in std::fs::read_dir(&path)?.flatten() {
            let entry_path = entry.path();
            if entry_path.is_dir() {
                std::fs::remove_dir_all(&entry_path)?;
            } else {
                std::fs::remove_file(&entry_path)?;
            }
        }
        Ok(())
    })
    .await
    .unwrap_or_else(|e| Err(std::io::Error::other(e)))
}

fn is_busy(error: &std::io::Error) -> bool {
    EngineError::classify_transient(&error.to_string())
}

/// Best-effort: terminate any process whose working directory or command
/// line references `path`, so a lingering shell or build tool doesn't hold
/// the workspace open across cleanup. On Linux this walks `/proc`; on
/// other platforms it's a no-op (the non-POSIX cleanup path relies on
/// `taskkill`/detached `rmdir` instead).
async fn terminate_processes_referencing(path: &Path) {
    #[cfg(target_os = "linux")]
    {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || kill_processes_referencing_linux(&path))
            .await
            .ok();
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = path;
    }
}

#[cfg(target_os = "linux")]
fn kill_processes_referencing_linux(path: &Path) {
    let needle = path.to_string_lossy().to_string();
    let my_pid = std::process::id();
    let Ok(procs) = std::fs::read_dir("/proc") else { return };
    for entry in procs.flatten() {
        let Some(pid_str) = entry.file_name().to_str().map(str::to_string) else { continue };
        let Ok(pid) = pid_str.parse::<u32>() else { continue };
        if pid == my_pid {
            continue;
        }

        let cwd_matches = std::fs::read_link(entry.path().join("cwd"))
            .map(|cwd| cwd.to_string_lossy().starts_with(&needle))
            .unwrap_or(false);
        let cmdline_matches = std::fs::read(entry.path().join("cmdline"))
            .map(|bytes| {
                String::from_utf8_lossy(&bytes).split('\0').any(|arg| arg.contains(&needle))
            })
            .unwrap_or(false);

        if cwd_matches || cmdline_matches {
            tracing::debug!(pid, path = %needle, "terminating process referencing workspace path");
            #[cfg(unix)]
            {
                let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGKILL);
            }
        }
    }
}

#[cfg(unix)]
fn free_bytes(path: &Path) -> u64 {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let Ok(c_path) = CString::new(path.as_os_str().as_encoded_bytes()) else {
        return u64::MAX;
    };
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: `c_path` is a valid NUL-terminated C string and `stat` is
    // large enough for libc to fill; `statvfs` writes through the pointer
    // on success and leaves it untouched on failure, which we check below.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return u64::MAX;
    }
    // SAFETY: `rc == 0` guarantees `statvfs` initialised the struct.
    let stat = unsafe { stat.assume_init() };
    (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn free_bytes(_path: &Path) -> u64 {
    u64::MAX
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn prepare_creates_a_fresh_empty_directory() {
        let base = tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path().to_path_buf(), 0, DEFAULT_KEEP_LAST_N);
        let project_id = Uuid::new_v4();
        let deployment_id = Uuid::new_v4();

        let workspace = manager.prepare(project_id, deployment_id).await.unwrap();
        assert!(workspace.exists());
        assert_eq!(std::fs::read_dir(&workspace).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn prepare_clears_a_stale_existing_directory() {
        let base = tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path().to_path_buf(), 0, DEFAULT_KEEP_LAST_N);
        let project_id = Uuid::new_v4();
        let deployment_id = Uuid::new_v4();

        let workspace = manager.workspace_path(project_id, deployment_id);
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::write(workspace.join("stale.txt"), b"old").unwrap();

        manager.prepare(project_id, deployment_id).await.unwrap();
        assert_eq!(std::fs::read_dir(&workspace).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn cleanup_removes_the_workspace_directory() {
        let base = tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path().to_path_buf(), 0, DEFAULT_KEEP_LAST_N);
        let workspace = manager.prepare(Uuid::new_v4(), Uuid::new_v4()).await.unwrap();

        manager.cleanup(&workspace, &[]).await;
        assert!(!workspace.exists());
    }

    #[tokio::test]
    async fn cleanup_refuses_when_workspace_equals_a_target_path() {
        let base = tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path().to_path_buf(), 0, DEFAULT_KEEP_LAST_N);
        let workspace = manager.prepare(Uuid::new_v4(), Uuid::new_v4()).await.unwrap();
        let target = workspace.to_string_lossy().to_string();

        manager.cleanup(&workspace, &[target]).await;
        assert!(workspace.exists());
    }

    #[tokio::test]
    async fn ensure_capacity_passes_when_threshold_is_zero() {
        let base = tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path().to_path_buf(), 0, DEFAULT_KEEP_LAST_N);
        manager.ensure_capacity().await.unwrap();
    }

    #[tokio::test]
    async fn ensure_capacity_fails_fatally_when_threshold_is_unreachable() {
        let base = tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path().to_path_buf(), u64::MAX, 0);
        let result = manager.ensure_capacity().await;
        assert!(matches!(result, Err(EngineError::Capacity(_))));
    }

    #[tokio::test]
    async fn prune_keeps_only_the_most_recent_n_deployments() {
        let base = tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path().to_path_buf(), 0, 2);
        let project_id = Uuid::new_v4();

        let mut paths = vec![];
        for _ in 0..4 {
            let path = manager.prepare(project_id, Uuid::new_v4()).await.unwrap();
            paths.push(path);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        manager.prune_old_workspaces().await;

        let project_dir = manager.project_dir(project_id);
        let remaining = std::fs::read_dir(&project_dir).unwrap().count();
        assert_eq!(remaining, 2);
        // The two most recently created survive.
        assert!(paths[2].exists());
        assert!(paths[3].exists());
        assert!(!paths[0].exists());
    }
}

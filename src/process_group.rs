//! Process-group lifecycle abstraction
//!
//! Abstracts platform-specific process-tree kill behind a small interface
//! (Design Notes): the orchestrator and the pipeline runner depend only on
//! `terminate_gracefully(timeout)` then `kill()`, never on `nix` or Windows
//! job-object APIs directly.

use std::time::Duration;

use tokio::process::Child;

/// A handle to a child process tree that can be signalled as a unit.
#[async_trait::async_trait]
pub trait ProcessGroup: Send + Sync {
    /// Send a graceful termination signal (SIGTERM on POSIX) and wait up to
    /// `timeout` for the process to exit on its own.
    async fn terminate_gracefully(&mut self, timeout: Duration) -> bool;

    /// Force-kill the process tree unconditionally.
    async fn kill(&mut self);
}

#[cfg(unix)]
pub use unix::UnixProcessGroup as PlatformProcessGroup;

#[cfg(not(unix))]
pub use non_unix::NonUnixProcessGroup as PlatformProcessGroup;

#[cfg(unix)]
mod unix {
    use super::*;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    /// POSIX implementation: the child is spawned as its own session leader
    /// (`process_group(0)` on the `Command` builder) so signalling its pid
    /// as a negative value reaches the whole tree.
    pub struct UnixProcessGroup {
        pid: i32,
        child: Child,
    }

    impl UnixProcessGroup {
        pub fn new(child: Child) -> Self {
            let pid = child.id().unwrap_or(0) as i32;
            Self { pid, child }
        }

        fn signal(&self, sig: Signal) {
            if self.pid <= 0 {
                return;
            }
            let group_pid = Pid::from_raw(-self.pid);
            if let Err(e) = signal::kill(group_pid, sig) {
                tracing::debug!(pid = self.pid, error = %e, "failed to signal process group");
            }
        }
    }

    #[async_trait::async_trait]
    impl ProcessGroup for UnixProcessGroup {
        async fn terminate_gracefully(&mut self, timeout: Duration) -> bool {
            self.signal(Signal::SIGTERM);
            matches!(tokio::time::timeout(timeout, self.child.wait()).await, Ok(Ok(_)))
        }

        async fn kill(&mut self) {
            self.signal(Signal::SIGKILL);
            let _ = self.child.kill().await;
            let _ = self.child.wait().await;
        }
    }
}

#[cfg(not(unix))]
mod non_unix {
    use super::*;

    /// Non-POSIX implementation: there is no process-group signal API
    /// portable across shells here, so termination goes through
    /// `taskkill /T /F` against the child's pid, killing the whole tree.
    pub struct NonUnixProcessGroup {
        pid: Option<u32>,
        child: Child,
    }

    impl NonUnixProcessGroup {
        pub fn new(child: Child) -> Self {
            let pid = child.id();
            Self { pid, child }
        }

        async fn taskkill(&self) {
            if let Some(pid) = self.pid {
                let _ = tokio::process::Command::new("taskkill")
                    .args(["/PID", &pid.to_string(), "/T", "/F"])
                    .output()
                    .await;
            }
        }
    }

    #[async_trait::async_trait]
    impl ProcessGroup for NonUnixProcessGroup {
        async fn terminate_gracefully(&mut self, timeout: Duration) -> bool {
            // No graceful-signal equivalent; go straight to taskkill and
            // just wait out the grace period for the handle to settle.
            self.taskkill().await;
            matches!(tokio::time::timeout(timeout, self.child.wait()).await, Ok(Ok(_)))
        }

        async fn kill(&mut self) {
            self.taskkill().await;
            let _ = self.child.kill().await;
            let _ = self.child.wait().await;
        }
    }
}

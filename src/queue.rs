//! Per-project FIFO queue dispatcher
//!
//! Replaces the source's cooperative-closure callbacks with message passing
//! (Design Notes): one worker task per project, lazily spawned on first
//! `add`, fed by an ordered list guarded by a mutex rather than scheduled by
//! closures directly. `add` is synchronous — it only enqueues and starts a
//! processor if needed; it never awaits the work itself (Open Question,
//! resolved in DESIGN.md).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Manual-trigger priority: preempts queued webhook-triggered units while
/// preserving relative insertion order among equal priorities.
pub const PRIORITY_MANUAL: i32 = 10;
/// Webhook-trigger priority.
pub const PRIORITY_WEBHOOK: i32 = 0;

type Work = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Unit {
    deployment_id: Uuid,
    priority: i32,
    work: Work,
}

#[derive(Default)]
struct ProjectQueue {
    pending: Vec<Unit>,
    running: bool,
}

/// `{projectId, pending, running}` snapshot for `status()`.
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub project_id: Uuid,
    pub pending: usize,
    pub running: bool,
}

/// Serialises execution per project while allowing cross-project
/// parallelism. One cooperative `tokio::task` processes each project's list
/// at a time; a new processor is spawned lazily whenever `add` finds the
/// project idle.
#[derive(Clone)]
pub struct QueueDispatcher {
    projects: Arc<Mutex<HashMap<Uuid, ProjectQueue>>>,
}

impl Default for QueueDispatcher {
    fn default() -> Self {
        Self {
            projects: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl QueueDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a unit of work for `project_id`; sorts the project's pending
    /// list by priority descending (stable, so insertion order among equal
    /// priorities is preserved). Starts a processor if the project is not
    /// currently running. Synchronous: returns as soon as the unit is
    /// enqueued, never awaiting `work` itself.
    pub async fn add<F>(&self, deployment_id: Uuid, project_id: Uuid, priority: i32, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut should_spawn = false;
        {
            let mut projects = self.projects.lock().await;
            let queue = projects.entry(project_id).or_default();
            queue.pending.push(Unit {
                deployment_id,
                priority,
                work: Box::pin(work),
            });
            queue.pending.sort_by(|a, b| b.priority.cmp(&a.priority));
            if !queue.running {
                queue.running = true;
                should_spawn = true;
            }
        }

        if should_spawn {
            let projects = Arc::clone(&self.projects);
            tokio::spawn(Self::run_processor(projects, project_id));
        }
    }

    async fn run_processor(projects: Arc<Mutex<HashMap<Uuid, ProjectQueue>>>, project_id: Uuid) {
        loop {
            let next = {
                let mut guard = projects.lock().await;
                let Some(queue) = guard.get_mut(&project_id) else {
                    return;
                };
                if queue.pending.is_empty() {
                    queue.running = false;
                    None
                } else {
                    Some(queue.pending.remove(0))
                }
            };

            let Some(unit) = next else {
                return;
            };

            tracing::debug!(deployment_id = %unit.deployment_id, project_id = %project_id, "queue: starting unit");
            // A work-closure panic must not take the processor task down
            // with it, or every later unit for this project would starve
            // forever; catch it the way the source's processor loop
            // "catches and logs" failures without letting them propagate.
            if let Err(panic) = std::panic::AssertUnwindSafe(unit.work).catch_unwind().await {
                tracing::error!(deployment_id = %unit.deployment_id, ?panic, "queue: unit panicked");
            }
        }
    }

    /// Drop and return the count of still-pending units for a project.
    /// Never affects a unit already running.
    pub async fn cancel_pending(&self, project_id: Uuid) -> usize {
        let mut projects = self.projects.lock().await;
        match projects.get_mut(&project_id) {
            Some(queue) => {
                let count = queue.pending.len();
                queue.pending.clear();
                count
            }
            None => 0,
        }
    }

    /// Drop only the pending unit matching `deployment_id`, if still queued.
    /// Returns true if a unit was removed.
    pub async fn cancel_deployment(&self, project_id: Uuid, deployment_id: Uuid) -> bool {
        let mut projects = self.projects.lock().await;
        let Some(queue) = projects.get_mut(&project_id) else {
            return false;
        };
        let before = queue.pending.len();
        queue.pending.retain(|u| u.deployment_id != deployment_id);
        queue.pending.len() != before
    }

    pub async fn status(&self) -> Vec<QueueStatus> {
        let projects = self.projects.lock().await;
        projects
            .iter()
            .map(|(project_id, queue)| QueueStatus {
                project_id: *project_id,
                pending: queue.pending.len(),
                running: queue.running,
            })
            .collect()
    }
}

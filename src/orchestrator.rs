//! Deployment orchestrator: composition root and the per-deployment state
//! machine
//!
//! `Controller` is the composition root tying together the queue
//! dispatcher, the pipeline runner, the SSH key manager, smart sync, and
//! the event bus. `run_deployment` is the *execution closure* the queue
//! dispatcher invokes for each dequeued unit: it is never called directly
//! by an external collaborator, only indirectly via
//! [`DeploymentOrchestrator::create_deployment`].
//!
//! Git operations shell out to the system `git` binary rather than using
//! an embedded git library, because the clone and checkout steps need
//! `GIT_SSH_COMMAND` set in the child's environment to point at the
//! ephemeral deploy key — a CLI-level mechanism an embedded transport such
//! as libssh2 does not read. See DESIGN.md for this dependency choice.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventBus};
use crate::models::{
    Deployment, DeploymentContext, DeploymentStatus, DeploymentStep, DeploymentStepStatus, Project,
    TriggerType, UNKNOWN_COMMIT,
};
use crate::pipeline::PipelineRunner;
use crate::ports::{
    AuditAction, AuditSink, DeploymentNotification, DeploymentStore, NotificationSink, ProjectStore,
};
use crate::queue::{QueueDispatcher, PRIORITY_MANUAL, PRIORITY_WEBHOOK};
use crate::ssh::{SshKeyHandle, SshKeyManager};
use crate::sync;
use crate::workspace::WorkspaceManager;

const CLONE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);
const LS_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);
const CLONE_RETRY_ATTEMPTS: u32 = 3;
const CLONE_RETRY_BASE: Duration = Duration::from_secs(2);
const SSH_RETRY_ATTEMPTS: u32 = 3;
const SSH_RETRY_BASE: Duration = Duration::from_millis(500);
const POST_PIPELINE_SETTLE: Duration = Duration::from_millis(500);

/// Parameters accepted by `CreateDeployment`. Branch/commit/message/
/// author already reflect the caller's fallback resolution (explicit param
/// → webhook-derived) up to the project default, which this orchestrator
/// applies as the final fallback.
#[derive(Debug, Clone)]
pub struct CreateDeploymentParams {
    pub project_id: Uuid,
    pub triggered_by: String,
    pub trigger_type: TriggerType,
    pub branch: Option<String>,
    pub commit_hash: Option<String>,
    pub commit_message: Option<String>,
    pub author: Option<String>,
}

/// The external interface surface: `CreateDeployment`, `Cancel`, `Retry`,
/// and (via [`crate::events::EventBus::subscribe_deployment`]) a read-only
/// log subscription.
#[async_trait::async_trait]
pub trait DeploymentOrchestrator: Send + Sync {
    async fn create_deployment(self: Arc<Self>, params: CreateDeploymentParams) -> EngineResult<Deployment>;
    async fn cancel(self: Arc<Self>, id: Uuid) -> EngineResult<()>;
    async fn retry(self: Arc<Self>, id: Uuid, triggered_by: String) -> EngineResult<Deployment>;
}

/// Composition root: wires the queue dispatcher, pipeline runner, SSH key
/// manager, smart sync, and event bus behind the four external interfaces.
pub struct Controller {
    #[allow(dead_code)]
    config: EngineConfig,
    queue: QueueDispatcher,
    project_store: Arc<dyn ProjectStore>,
    deployment_store: Arc<dyn DeploymentStore>,
    audit_sink: Arc<dyn AuditSink>,
    notification_sink: Arc<dyn NotificationSink>,
    event_bus: Arc<EventBus>,
    ssh_manager: Arc<SshKeyManager>,
    workspace_manager: WorkspaceManager,
    pipeline_runner: Arc<PipelineRunner>,
    encryption_key: Option<[u8; 32]>,
}

impl Controller {
    pub fn new(
        config: EngineConfig,
        project_store: Arc<dyn ProjectStore>,
        deployment_store: Arc<dyn DeploymentStore>,
        audit_sink: Arc<dyn AuditSink>,
        notification_sink: Arc<dyn NotificationSink>,
    ) -> EngineResult<Arc<Self>> {
        let event_bus = Arc::new(EventBus::new());
        let ssh_manager = SshKeyManager::init()?;
        let workspace_manager =
            WorkspaceManager::new(config.deployments_path.clone(), config.min_free_disk_bytes, config.keep_last_n);
        let pipeline_runner = Arc::new(PipelineRunner::new(Arc::clone(&deployment_store), Arc::clone(&event_bus)));
        let encryption_key =
            if config.encryption_key_hex.is_empty() { None } else { Some(config.encryption_key()?) };

        Ok(Arc::new(Self {
            config,
            queue: QueueDispatcher::new(),
            project_store,
            deployment_store,
            audit_sink,
            notification_sink,
            event_bus,
            ssh_manager,
            workspace_manager,
            pipeline_runner,
            encryption_key,
        }))
    }

    /// Subscribe to the real-time channel for one deployment, the
    /// read-only log subscription external interface.
    pub fn subscribe(&self, deployment_id: Uuid) -> crate::events::DeploymentEventStream {
        self.event_bus.subscribe_deployment(deployment_id)
    }

    pub async fn queue_status(&self) -> Vec<crate::queue::QueueStatus> {
        self.queue.status().await
    }
}

#[async_trait::async_trait]
impl DeploymentOrchestrator for Controller {
    async fn create_deployment(self: Arc<Self>, params: CreateDeploymentParams) -> EngineResult<Deployment> {
        let project = self
            .project_store
            .get(params.project_id)
            .await
            .ok_or_else(|| EngineError::Validation("project not found".to_string()))?;

        if !project.active {
            return Err(EngineError::Validation("project is not active".to_string()));
        }
        if !project.pipeline_is_valid() {
            return Err(EngineError::Validation("project pipeline is invalid".to_string()));
        }

        let branch = params.branch.clone().unwrap_or_else(|| project.default_branch.clone());
        let deployment = Deployment::new(
            project.id,
            params.trigger_type,
            branch,
            params.commit_hash.clone(),
            params.commit_message.clone(),
            params.author.clone(),
            params.triggered_by.clone(),
        );

        self.deployment_store.insert(deployment.clone()).await;
        self.audit_sink
            .record(AuditAction::DeploymentCreated { deployment_id: deployment.id, project_id: project.id })
            .await;
        self.event_bus.publish(Event::DeploymentUpdated {
            deployment_id: deployment.id,
            project_id: project.id,
            status: deployment.status.as_str().to_string(),
        });

        let priority = match deployment.trigger_type {
            TriggerType::Manual | TriggerType::Retry => PRIORITY_MANUAL,
            TriggerType::Webhook => PRIORITY_WEBHOOK,
        };

        let controller = Arc::clone(&self);
        let deployment_id = deployment.id;
        let project_id = project.id;
        self.queue
            .add(deployment_id, project_id, priority, async move {
                controller.run_deployment(deployment_id, project_id).await;
            })
            .await;

        Ok(deployment)
    }

    async fn cancel(self: Arc<Self>, id: Uuid) -> EngineResult<()> {
        let mut deployment = self
            .deployment_store
            .get(id)
            .await
            .ok_or_else(|| EngineError::Validation("deployment not found".to_string()))?;

        if !deployment.status.can_cancel() {
            return Err(EngineError::Validation(format!(
                "cannot cancel a deployment in status '{}'",
                deployment.status.as_str()
            )));
        }

        if !self.queue.cancel_deployment(deployment.project_id, id).await {
            return Err(EngineError::Validation(
                "deployment started running before it could be cancelled".to_string(),
            ));
        }

        deployment.status = DeploymentStatus::Cancelled;
        deployment.completed_at = Some(Utc::now());
        self.deployment_store.update(deployment.clone()).await;
        self.audit_sink.record(AuditAction::DeploymentCancelled { deployment_id: id }).await;
        self.event_bus.publish(Event::DeploymentUpdated {
            deployment_id: id,
            project_id: deployment.project_id,
            status: deployment.status.as_str().to_string(),
        });

        Ok(())
    }

    async fn retry(self: Arc<Self>, id: Uuid, triggered_by: String) -> EngineResult<Deployment> {
        let source = self
            .deployment_store
            .get(id)
            .await
            .ok_or_else(|| EngineError::Validation("deployment not found".to_string()))?;

        if !source.status.can_retry() {
            return Err(EngineError::Validation(format!(
                "cannot retry a deployment in status '{}'",
                source.status.as_str()
            )));
        }

        let retried = Deployment::retry_from(&source, triggered_by);
        self.deployment_store.insert(retried.clone()).await;
        self.audit_sink
            .record(AuditAction::DeploymentCreated { deployment_id: retried.id, project_id: retried.project_id })
            .await;
        self.event_bus.publish(Event::DeploymentUpdated {
            deployment_id: retried.id,
            project_id: retried.project_id,
            status: retried.status.as_str().to_string(),
        });

        let controller = Arc::clone(&self);
        let deployment_id = retried.id;
        let project_id = retried.project_id;
        self.queue
            .add(deployment_id, project_id, PRIORITY_MANUAL, async move {
                controller.run_deployment(deployment_id, project_id).await;
            })
            .await;

        Ok(retried)
    }
}

impl Controller {
    /// The execution closure the dispatcher invokes for exactly one
    /// dequeued unit. Implements the full deployment state machine from
    /// workspace preparation through cleanup.
    async fn run_deployment(self: Arc<Self>, deployment_id: Uuid, project_id: Uuid) {
        // Step 1: load and guard.
        let Some(mut deployment) = self.deployment_store.get(deployment_id).await else {
            tracing::error!(%deployment_id, "deployment record missing at execution time");
            return;
        };
        let Some(project) = self.project_store.get(project_id).await else {
            tracing::error!(%project_id, "project record missing at execution time");
            self.fail_without_start(&mut deployment, "project not found".to_string()).await;
            return;
        };

        // Step 2: SSH key materialisation.
        let mut ssh_handle: Option<SshKeyHandle> = None;
        let mut ssh_fingerprint: Option<String> = None;
        if project.use_ssh_key {
            match self.materialise_ssh_key(&project).await {
                Ok((handle, fingerprint)) => {
                    ssh_fingerprint = Some(fingerprint);
                    ssh_handle = Some(handle);
                }
                Err(e) => {
                    self.audit_sink
                        .record(AuditAction::SshKeyUsed {
                            project_id: project.id,
                            success: false,
                            fingerprint: None,
                            error: Some(e.to_string()),
                        })
                        .await;
                    self.fail_without_start(&mut deployment, format!("ssh key error: {e}")).await;
                    return;
                }
            }
        }

        // Step 3: commit resolution (pre-clone via ls-remote; post-clone
        // `git rev-parse HEAD` fallback happens in `clone_and_checkout`).
        if deployment.commit_hash == UNKNOWN_COMMIT {
            match resolve_branch_head(&project.repo_url, &deployment.branch, ssh_handle.as_ref()).await {
                Ok(hash) => deployment.commit_hash = hash,
                Err(e) => {
                    tracing::warn!(error = %e, "ls-remote resolution failed, deferring to post-clone rev-parse");
                }
            }
        }

        // Step 4: transition to InProgress.
        deployment.status = DeploymentStatus::InProgress;
        deployment.started_at = Some(Utc::now());
        self.deployment_store.update(deployment.clone()).await;
        self.event_bus.publish(Event::DeploymentUpdated {
            deployment_id,
            project_id,
            status: deployment.status.as_str().to_string(),
        });
        self.notify(&project, &deployment).await;

        // Step 5: pre-flight auto-recovery.
        repair_package_manager_cache_ownership().await;
        if let Err(e) = self.workspace_manager.ensure_capacity().await {
            self.terminate(deployment, project, None, ssh_handle, Err(e)).await;
            return;
        }

        // Step 6: workspace preparation.
        let workspace = match self.workspace_manager.prepare(project_id, deployment_id).await {
            Ok(path) => path,
            Err(e) => {
                self.terminate(deployment, project, None, ssh_handle, Err(e)).await;
                return;
            }
        };

        // Step 7: clone (+ checkout or rev-parse).
        if let Err(e) = self
            .clone_and_checkout(&workspace, &project, &mut deployment, ssh_handle.as_ref(), ssh_fingerprint.as_deref())
            .await
        {
            self.terminate(deployment, project, Some(workspace), ssh_handle, Err(e)).await;
            return;
        }

        // Step 8: context build.
        let target_path = project.target_paths.first().cloned().unwrap_or_default();
        let context = DeploymentContext::build(
            &project.name,
            project.id,
            deployment.id,
            &repo_name_from_url(&project.repo_url),
            &project.repo_url,
            &deployment.branch,
            &deployment.commit_hash,
            deployment.commit_message.as_deref(),
            deployment.author.as_deref(),
            "production",
            &workspace.to_string_lossy(),
            &workspace.to_string_lossy(),
            &target_path,
            None,
            project.build_output.as_deref(),
        );

        // Step 9: pipeline execution.
        let outcome = self
            .pipeline_runner
            .execute(
                deployment.id,
                project.id,
                &project.name,
                &project.pipeline,
                &context,
                &workspace,
                ssh_handle.as_ref().map(SshKeyHandle::path),
            )
            .await;

        // Step 10: publish (only when the pipeline succeeded; legacy
        // sync-only mode is simply the zero-step case, which `execute`
        // already reports as success).
        let publish_result = if outcome.success {
            let preserve = sync::preserve_set(&project.sync_ignore_patterns);
            sync::publish(
                &workspace,
                &project.target_paths,
                project.build_output.as_deref(),
                &preserve,
                project.rsync_options.as_deref(),
            )
            .await
        } else {
            Ok(())
        };

        tokio::time::sleep(POST_PIPELINE_SETTLE).await;

        let final_result: EngineResult<()> = if !outcome.success {
            Err(EngineError::StepFailure {
                step: "pipeline".to_string(),
                message: outcome.error_message.clone().unwrap_or_default(),
            })
        } else {
            publish_result
        };

        // Step 11: metadata marker, only on success.
        if final_result.is_ok() {
            self.write_metadata_markers(&project, &deployment).await;
        }

        // Steps 12-13: terminal transition, notification, cleanup.
        self.terminate(deployment, project, Some(workspace), ssh_handle, final_result).await;
    }

    async fn materialise_ssh_key(&self, project: &Project) -> EngineResult<(SshKeyHandle, String)> {
        let blob = project
            .encrypted_private_key
            .as_ref()
            .ok_or_else(|| EngineError::SshKey("project has no encrypted private key configured".to_string()))?;
        let key = self
            .encryption_key
            .ok_or_else(|| EngineError::SshKey("no encryption key configured for this controller".to_string()))?;
        let project_id = project.id;

        retry_with_backoff(SSH_RETRY_ATTEMPTS, SSH_RETRY_BASE, || {
            let ssh_manager = Arc::clone(&self.ssh_manager);
            let blob = blob.clone();
            async move { ssh_manager.materialise(&blob, &key, project_id).await }
        })
        .await
    }

    async fn clone_and_checkout(
        &self,
        workspace: &Path,
        project: &Project,
        deployment: &mut Deployment,
        ssh_handle: Option<&SshKeyHandle>,
        ssh_fingerprint: Option<&str>,
    ) -> EngineResult<()> {
        let mut step = DeploymentStep::start(deployment.id, 0, "Clone Repository");
        self.deployment_store.insert_step(step.clone()).await;
        self.event_bus.publish(Event::DeploymentLog {
            deployment_id: deployment.id,
            project_id: project.id,
            line: "--- Step 0: Clone Repository ---".to_string(),
        });

        let repo_url = project.repo_url.clone();
        let branch = deployment.branch.clone();

        let clone_result = retry_with_backoff(CLONE_RETRY_ATTEMPTS, CLONE_RETRY_BASE, || {
            run_git_clone(workspace, &repo_url, &branch, ssh_handle)
        })
        .await;

        if let Err(e) = clone_result {
            step.error = e.to_string();
            step.finish(DeploymentStepStatus::Failed);
            self.deployment_store.update_step(step).await;
            if ssh_handle.is_some() {
                self.audit_sink
                    .record(AuditAction::SshKeyUsed {
                        project_id: project.id,
                        success: false,
                        fingerprint: None,
                        error: Some(e.to_string()),
                    })
                    .await;
            }
            return Err(e);
        }

        let checkout_result = if deployment.commit_hash != UNKNOWN_COMMIT {
            run_git_checkout(workspace, &deployment.commit_hash, ssh_handle).await.map(|_| ())
        } else {
            match run_git_rev_parse_head(workspace).await {
                Ok(hash) => {
                    deployment.commit_hash = hash;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };

        if let Err(e) = checkout_result {
            step.error = e.to_string();
            step.finish(DeploymentStepStatus::Failed);
            self.deployment_store.update_step(step).await;
            if ssh_handle.is_some() {
                self.audit_sink
                    .record(AuditAction::SshKeyUsed {
                        project_id: project.id,
                        success: false,
                        fingerprint: None,
                        error: Some(e.to_string()),
                    })
                    .await;
            }
            return Err(e);
        }

        step.output = format!("cloned {} at {}", project.repo_url, deployment.commit_hash);
        step.finish(DeploymentStepStatus::Success);
        self.deployment_store.update_step(step).await;

        if ssh_handle.is_some() {
            self.audit_sink
                .record(AuditAction::SshKeyUsed {
                    project_id: project.id,
                    success: true,
                    fingerprint: ssh_fingerprint.map(str::to_string),
                    error: None,
                })
                .await;
        }

        Ok(())
    }

    /// Steps 12-13: terminal status transition, notification, workspace
    /// cleanup, and SSH-key destruction. Runs unconditionally on every
    /// exit path after step 4, matching the spec's "Always (finally)".
    async fn terminate(
        &self,
        mut deployment: Deployment,
        project: Project,
        workspace: Option<PathBuf>,
        ssh_handle: Option<SshKeyHandle>,
        result: EngineResult<()>,
    ) {
        let completed = Utc::now();
        deployment.completed_at = Some(completed);
        let started = deployment.started_at.unwrap_or(deployment.created_at);
        deployment.duration_seconds = Some((completed - started).num_seconds().max(0));

        match &result {
            Ok(()) => {
                deployment.status = DeploymentStatus::Success;
                deployment.error_message = None;
            }
            Err(e) => {
                deployment.status = DeploymentStatus::Failed;
                deployment.error_message = Some(e.to_string());
            }
        }

        self.deployment_store.update(deployment.clone()).await;
        self.event_bus.publish(Event::DeploymentCompleted {
            deployment_id: deployment.id,
            project_id: project.id,
            status: deployment.status.as_str().to_string(),
        });
        self.notify(&project, &deployment).await;

        if let Some(ws) = workspace {
            self.workspace_manager.cleanup(&ws, &project.target_paths).await;
        }
        if let Some(handle) = ssh_handle {
            handle.destroy().await;
        }
    }

    /// Used when a deployment fails before `started_at` is ever set (the
    /// project lookup or SSH materialisation failed).
    async fn fail_without_start(&self, deployment: &mut Deployment, message: String) {
        deployment.status = DeploymentStatus::Failed;
        deployment.error_message = Some(message);
        deployment.completed_at = Some(Utc::now());
        deployment.duration_seconds = Some(0);
        self.deployment_store.update(deployment.clone()).await;
        self.event_bus.publish(Event::DeploymentCompleted {
            deployment_id: deployment.id,
            project_id: deployment.project_id,
            status: deployment.status.as_str().to_string(),
        });
    }

    async fn notify(&self, project: &Project, deployment: &Deployment) {
        self.notification_sink
            .send(DeploymentNotification {
                project_name: project.name.clone(),
                deployment_id: deployment.id,
                status: deployment.status.as_str().to_string(),
                branch: deployment.branch.clone(),
                commit_hash: deployment.commit_hash.clone(),
                commit_message: deployment.commit_message.clone(),
                author: deployment.author.clone(),
                duration_seconds: deployment.duration_seconds,
                error: deployment.error_message.clone(),
                url: None,
            })
            .await;
    }

    async fn write_metadata_markers(&self, project: &Project, deployment: &Deployment) {
        let now = Utc::now();
        let started = deployment.started_at.unwrap_or(deployment.created_at);
        let duration_seconds = (now - started).num_seconds().max(0);

        let marker = DeployMetadataMarker {
            deployment_id: deployment.id,
            project_id: project.id,
            project_name: project.name.clone(),
            repo_url: project.repo_url.clone(),
            branch: deployment.branch.clone(),
            commit_hash: deployment.commit_hash.clone(),
            commit_message: deployment.commit_message.clone(),
            author: deployment.author.clone(),
            triggered_by: deployment.triggered_by.clone(),
            trigger_type: trigger_type_str(deployment.trigger_type).to_string(),
            status: "success".to_string(),
            created_at: deployment.created_at,
            started_at: deployment.started_at,
            completed_at: now,
            duration_seconds,
            duration_human: format_duration_human(duration_seconds),
            deployed_at: now.to_rfc3339(),
            environment: "production".to_string(),
        };

        let Ok(json) = serde_json::to_vec_pretty(&marker) else {
            tracing::error!("failed to serialise deployment metadata marker");
            return;
        };

        for target in &project.target_paths {
            let path = Path::new(target).join(".deploy-center");
            if let Err(e) = tokio::fs::write(&path, &json).await {
                tracing::warn!(path = %path.display(), error = %e, "failed to write deployment metadata marker");
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct DeployMetadataMarker {
    deployment_id: Uuid,
    project_id: Uuid,
    project_name: String,
    repo_url: String,
    branch: String,
    commit_hash: String,
    commit_message: Option<String>,
    author: Option<String>,
    triggered_by: String,
    trigger_type: String,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: DateTime<Utc>,
    duration_seconds: i64,
    duration_human: String,
    deployed_at: String,
    environment: String,
}

fn trigger_type_str(trigger_type: TriggerType) -> &'static str {
    match trigger_type {
        TriggerType::Webhook => "webhook",
        TriggerType::Manual => "manual",
        TriggerType::Retry => "retry",
    }
}

fn format_duration_human(seconds: i64) -> String {
    let minutes = seconds / 60;
    let secs = seconds % 60;
    if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

/// Extract a repository's bare name from its URL for the `RepoName`
/// context variable, e.g. `git@github.com:acme/demo.git` → `demo`.
fn repo_name_from_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/').trim_end_matches(".git");
    trimmed.rsplit(['/', ':']).next().unwrap_or(trimmed).to_string()
}

/// Retry a fallible async operation up to `attempts` times with exponential
/// backoff from `base_delay`.
async fn retry_with_backoff<F, Fut, T>(attempts: u32, base_delay: Duration, mut f: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    let mut last_err = None;
    for attempt in 0..attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(attempt = attempt + 1, attempts, error = %e, "retrying after transient failure");
                last_err = Some(e);
                if attempt + 1 < attempts {
                    tokio::time::sleep(base_delay * 2u32.pow(attempt)).await;
                }
            }
        }
    }
    Err(last_err.expect("attempts is always >= 1"))
}

fn git_ssh_env(ssh_handle: Option<&SshKeyHandle>) -> Option<(String, String)> {
    ssh_handle.map(|h| ("GIT_SSH_COMMAND".to_string(), SshKeyManager::git_ssh_command(h.path())))
}

async fn run_git_command(mut command: tokio::process::Command, timeout: Duration) -> EngineResult<String> {
    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| EngineError::Transient(format!("git command timed out after {timeout:?}")))?
        .map_err(|e| EngineError::Transient(format!("failed to spawn git: {e}")))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(EngineError::Transient(format!(
            "git exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

async fn run_git_clone(
    workspace: &Path,
    repo_url: &str,
    branch: &str,
    ssh_handle: Option<&SshKeyHandle>,
) -> EngineResult<()> {
    let mut command = tokio::process::Command::new("git");
    command.args(["clone", "--branch", branch, "--depth", "1", repo_url, "."]).current_dir(workspace);
    if let Some((k, v)) = git_ssh_env(ssh_handle) {
        command.env(k, v);
    }
    run_git_command(command, CLONE_TIMEOUT).await.map(|_| ())
}

async fn run_git_checkout(workspace: &Path, commit: &str, ssh_handle: Option<&SshKeyHandle>) -> EngineResult<String> {
    let mut command = tokio::process::Command::new("git");
    command.args(["checkout", commit]).current_dir(workspace);
    if let Some((k, v)) = git_ssh_env(ssh_handle) {
        command.env(k, v);
    }
    run_git_command(command, CHECKOUT_TIMEOUT).await
}

async fn run_git_rev_parse_head(workspace: &Path) -> EngineResult<String> {
    let mut command = tokio::process::Command::new("git");
    command.args(["rev-parse", "HEAD"]).current_dir(workspace);
    run_git_command(command, CHECKOUT_TIMEOUT).await
}

async fn resolve_branch_head(repo_url: &str, branch: &str, ssh_handle: Option<&SshKeyHandle>) -> EngineResult<String> {
    let mut command = tokio::process::Command::new("git");
    command.args(["ls-remote", repo_url, branch]);
    if let Some((k, v)) = git_ssh_env(ssh_handle) {
        command.env(k, v);
    }
    let output = run_git_command(command, LS_REMOTE_TIMEOUT).await?;
    output
        .split_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(|| EngineError::Transient("ls-remote returned no matching ref".to_string()))
}

#[cfg(unix)]
async fn repair_package_manager_cache_ownership() {
    let Some(home) = dirs::home_dir() else { return };
    let uid = nix::unistd::Uid::current();
    let gid = nix::unistd::Gid::current();

    for cache in [".npm", ".cache/yarn", ".composer/cache", ".cache/pip"] {
        let path = home.join(cache);
        if !path.exists() {
            continue;
        }
        let result = tokio::task::spawn_blocking(move || chown_recursive(&path, uid, gid)).await;
        if let Ok(Err(e)) = result {
            tracing::debug!(error = %e, "cache ownership repair skipped (likely not running as root)");
        }
    }
}

#[cfg(unix)]
fn chown_recursive(path: &Path, uid: nix::unistd::Uid, gid: nix::unistd::Gid) -> std::io::Result<()> {
    nix::unistd::chown(path, Some(uid), Some(gid)).map_err(std::io::Error::from)?;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)?.flatten() {
            chown_recursive(&entry.path(), uid, gid)?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn repair_package_manager_cache_ownership() {}

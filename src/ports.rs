//! External collaborator interfaces
//!
//! Persistence, the audit log, and notification delivery are all external
//! collaborators the core only talks to through traits, following the
//! repository-pattern split used elsewhere in this codebase — generalised
//! here to `async-trait` ports with an in-memory default so the engine is
//! runnable and testable without a caller supplying a real database.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Deployment, DeploymentStep, Project};

/// Append-only audit action kinds the core observes.
#[derive(Debug, Clone)]
pub enum AuditAction {
    DeploymentCreated { deployment_id: Uuid, project_id: Uuid },
    DeploymentCancelled { deployment_id: Uuid },
    SshKeyUsed { project_id: Uuid, success: bool, fingerprint: Option<String>, error: Option<String> },
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// Read access to project configuration.
#[async_trait::async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Option<Project>;
}

/// Read/write access to deployments and their step records.
#[async_trait::async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Option<Deployment>;
    async fn insert(&self, deployment: Deployment);
    async fn update(&self, deployment: Deployment);
    async fn list_for_project(&self, project_id: Uuid) -> Vec<Deployment>;

    async fn insert_step(&self, step: DeploymentStep);
    async fn update_step(&self, step: DeploymentStep);
    async fn steps_for_deployment(&self, deployment_id: Uuid) -> Vec<DeploymentStep>;
}

/// Append-only audit sink.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, action: AuditAction);
}

/// Shape of a deployment notification handed to `NotificationSink::send`.
#[derive(Debug, Clone)]
pub struct DeploymentNotification {
    pub project_name: String,
    pub deployment_id: Uuid,
    pub status: String,
    pub branch: String,
    pub commit_hash: String,
    pub commit_message: Option<String>,
    pub author: Option<String>,
    pub duration_seconds: Option<i64>,
    pub error: Option<String>,
    pub url: Option<String>,
}

/// Outbound notification delivery. Failures here must never affect
/// deployment status: callers invoke this fire-and-forget.
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: DeploymentNotification);
}

/// `RwLock<HashMap>`-backed in-memory store, usable standalone and by the
/// crate's own tests.
#[derive(Default)]
pub struct InMemoryStore {
    projects: RwLock<HashMap<Uuid, Project>>,
    deployments: RwLock<HashMap<Uuid, Deployment>>,
    steps: RwLock<HashMap<Uuid, Vec<DeploymentStep>>>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn put_project(&self, project: Project) {
        self.projects.write().await.insert(project.id, project);
    }
}

#[async_trait::async_trait]
impl ProjectStore for InMemoryStore {
    async fn get(&self, id: Uuid) -> Option<Project> {
        self.projects.read().await.get(&id).cloned()
    }
}

#[async_trait::async_trait]
impl DeploymentStore for InMemoryStore {
    async fn get(&self, id: Uuid) -> Option<Deployment> {
        self.deployments.read().await.get(&id).cloned()
    }

    async fn insert(&self, deployment: Deployment) {
        self.deployments.write().await.insert(deployment.id, deployment);
    }

    async fn update(&self, deployment: Deployment) {
        self.deployments.write().await.insert(deployment.id, deployment);
    }

    async fn list_for_project(&self, project_id: Uuid) -> Vec<Deployment> {
        self.deployments
            .read()
            .await
            .values()
            .filter(|d| d.project_id == project_id)
            .cloned()
            .collect()
    }

    async fn insert_step(&self, step: DeploymentStep) {
        self.steps.write().await.entry(step.deployment_id).or_default().push(step);
    }

    async fn update_step(&self, step: DeploymentStep) {
        let mut steps = self.steps.write().await;
        if let Some(list) = steps.get_mut(&step.deployment_id) {
            if let Some(existing) = list.iter_mut().find(|s| s.id == step.id) {
                *existing = step;
                return;
            }
        }
        steps.entry(step.deployment_id).or_default().push(step);
    }

    async fn steps_for_deployment(&self, deployment_id: Uuid) -> Vec<DeploymentStep> {
        self.steps.read().await.get(&deployment_id).cloned().unwrap_or_default()
    }
}

/// `Vec`-backed audit sink for assertions in tests.
#[derive(Default)]
pub struct InMemoryAuditSink {
    entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait::async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, action: AuditAction) {
        self.entries.write().await.push(AuditEntry {
            action,
            recorded_at: chrono::Utc::now(),
        });
    }
}

/// Default notification sink: a Noop can never fail, matching the
/// invariant that notification failures never affect deployment status.
#[derive(Default)]
pub struct NoopNotificationSink;

#[async_trait::async_trait]
impl NotificationSink for NoopNotificationSink {
    async fn send(&self, _notification: DeploymentNotification) {}
}

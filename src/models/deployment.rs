//! Deployment and deployment-step records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sentinel commit hash used before resolution against the remote.
pub const UNKNOWN_COMMIT: &str = "unknown";

/// Deployment lifecycle status.
///
/// Queued → InProgress → {Success, Failed}; Cancelled is reachable only
/// from Queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    #[default]
    Queued,
    InProgress,
    Success,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Queued => "queued",
            DeploymentStatus::InProgress => "in_progress",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(DeploymentStatus::Queued),
            "in_progress" => Some(DeploymentStatus::InProgress),
            "success" => Some(DeploymentStatus::Success),
            "failed" => Some(DeploymentStatus::Failed),
            "cancelled" => Some(DeploymentStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success | DeploymentStatus::Failed | DeploymentStatus::Cancelled
        )
    }

    /// True for the only state `Cancel` is valid from.
    pub fn can_cancel(&self) -> bool {
        matches!(self, DeploymentStatus::Queued)
    }

    /// True for the only state `Retry` is valid from.
    pub fn can_retry(&self) -> bool {
        matches!(self, DeploymentStatus::Failed)
    }
}

/// How a deployment was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Webhook,
    Manual,
    Retry,
}

/// A single deployment attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub project_id: Uuid,
    pub status: DeploymentStatus,
    pub trigger_type: TriggerType,
    pub branch: String,
    /// May be [`UNKNOWN_COMMIT`] before clone-time or ls-remote resolution.
    pub commit_hash: String,
    pub commit_message: Option<String>,
    pub author: Option<String>,
    /// The user, webhook sender, or "system" that caused this deployment.
    pub triggered_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub error_message: Option<String>,
    pub log_file_path: Option<String>,
}

impl Deployment {
    pub fn new(
        project_id: Uuid,
        trigger_type: TriggerType,
        branch: String,
        commit_hash: Option<String>,
        commit_message: Option<String>,
        author: Option<String>,
        triggered_by: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            status: DeploymentStatus::Queued,
            trigger_type,
            branch,
            commit_hash: commit_hash.unwrap_or_else(|| UNKNOWN_COMMIT.to_string()),
            commit_message,
            author,
            triggered_by,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            error_message: None,
            log_file_path: None,
        }
    }

    /// A fresh Queued deployment copying branch/commit/message/author from a
    /// Failed source, with `trigger_type` forced to [`TriggerType::Retry`].
    pub fn retry_from(source: &Deployment, triggered_by: String) -> Self {
        Self::new(
            source.project_id,
            TriggerType::Retry,
            source.branch.clone(),
            Some(source.commit_hash.clone()),
            source.commit_message.clone(),
            source.author.clone(),
            triggered_by,
        )
    }
}

/// Deployment step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStepStatus {
    Running,
    Success,
    Failed,
    Skipped,
}

/// One record per attempted step. Step number 0 is reserved for the
/// implicit Clone step; user pipeline steps are numbered 1..N.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub step_number: u32,
    pub name: String,
    pub status: DeploymentStepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub output: String,
    pub error: String,
}

impl DeploymentStep {
    pub fn start(deployment_id: Uuid, step_number: u32, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            deployment_id,
            step_number,
            name: name.into(),
            status: DeploymentStepStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_seconds: None,
            output: String::new(),
            error: String::new(),
        }
    }

    pub fn finish(&mut self, status: DeploymentStepStatus) {
        let completed = Utc::now();
        self.duration_seconds = Some((completed - self.started_at).num_seconds().max(0));
        self.completed_at = Some(completed);
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            DeploymentStatus::Queued,
            DeploymentStatus::InProgress,
            DeploymentStatus::Success,
            DeploymentStatus::Failed,
            DeploymentStatus::Cancelled,
        ] {
            assert_eq!(DeploymentStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn only_queued_is_cancellable() {
        assert!(DeploymentStatus::Queued.can_cancel());
        assert!(!DeploymentStatus::InProgress.can_cancel());
        assert!(!DeploymentStatus::Success.can_cancel());
    }

    #[test]
    fn only_failed_can_retry() {
        assert!(DeploymentStatus::Failed.can_retry());
        assert!(!DeploymentStatus::Cancelled.can_retry());
        assert!(!DeploymentStatus::Success.can_retry());
    }

    #[test]
    fn terminal_states() {
        assert!(!DeploymentStatus::Queued.is_terminal());
        assert!(!DeploymentStatus::InProgress.is_terminal());
        assert!(DeploymentStatus::Success.is_terminal());
        assert!(DeploymentStatus::Failed.is_terminal());
        assert!(DeploymentStatus::Cancelled.is_terminal());
    }

    #[test]
    fn new_deployment_defaults_to_unknown_commit() {
        let deployment = Deployment::new(
            Uuid::new_v4(),
            TriggerType::Manual,
            "main".to_string(),
            None,
            None,
            None,
            "alice".to_string(),
        );
        assert_eq!(deployment.commit_hash, UNKNOWN_COMMIT);
        assert_eq!(deployment.status, DeploymentStatus::Queued);
    }

    #[test]
    fn retry_copies_branch_and_commit_and_forces_retry_trigger() {
        let mut source = Deployment::new(
            Uuid::new_v4(),
            TriggerType::Webhook,
            "main".to_string(),
            Some("abc123".to_string()),
            Some("fix bug".to_string()),
            Some("bob".to_string()),
            "webhook".to_string(),
        );
        source.status = DeploymentStatus::Failed;

        let retried = Deployment::retry_from(&source, "alice".to_string());
        assert_eq!(retried.trigger_type, TriggerType::Retry);
        assert_eq!(retried.branch, source.branch);
        assert_eq!(retried.commit_hash, source.commit_hash);
        assert_eq!(retried.status, DeploymentStatus::Queued);
        assert_ne!(retried.id, source.id);
    }

    #[test]
    fn step_finish_sets_duration_and_status() {
        let mut step = DeploymentStep::start(Uuid::new_v4(), 1, "build");
        step.finish(DeploymentStepStatus::Success);
        assert_eq!(step.status, DeploymentStepStatus::Success);
        assert!(step.completed_at.is_some());
        assert!(step.duration_seconds.unwrap() >= 0);
    }
}

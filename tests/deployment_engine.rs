//! End-to-end scenarios exercising the full `Controller` state machine
//! against real local git repositories (no network access required: every
//! repository used here is a plain working-copy clone source on disk).

use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use uuid::Uuid;

use deploy_center_engine::config::{EngineConfig, LoggingConfig};
use deploy_center_engine::crypto;
use deploy_center_engine::models::{DeploymentStatus, EncryptedBlob, PipelineStep, Project, TriggerType};
use deploy_center_engine::orchestrator::{Controller, CreateDeploymentParams, DeploymentOrchestrator};
use deploy_center_engine::ports::{DeploymentStore, InMemoryAuditSink, InMemoryStore, ProjectStore};

const TEST_ED25519_KEY: &str = include_str!("fixtures/test_ed25519_key");

/// Creates a one-commit git repository at a fresh temp directory containing
/// `files`, on branch `main`. Returns the repo directory and its HEAD commit.
fn init_repo(files: &[(&str, &str)]) -> (TempDir, String) {
    let dir = tempfile::tempdir().expect("tempdir");
    run_git(dir.path(), &["init", "-q"]);
    run_git(dir.path(), &["config", "user.email", "test@example.com"]);
    run_git(dir.path(), &["config", "user.name", "Test Runner"]);

    for (name, contents) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
    }

    run_git(dir.path(), &["add", "-A"]);
    run_git(dir.path(), &["commit", "-q", "-m", "initial"]);
    run_git(dir.path(), &["branch", "-M", "main"]);

    let commit = String::from_utf8(
        StdCommand::new("git").args(["rev-parse", "HEAD"]).current_dir(dir.path()).output().unwrap().stdout,
    )
    .unwrap()
    .trim()
    .to_string();

    (dir, commit)
}

fn run_git(cwd: &Path, args: &[&str]) {
    let status = StdCommand::new("git").args(args).current_dir(cwd).status().expect("git must be on PATH");
    assert!(status.success(), "git {args:?} failed");
}

fn test_config(base: PathBuf) -> EngineConfig {
    EngineConfig {
        deployments_path: base,
        encryption_key_hex: hex::encode([9u8; 32]),
        min_free_disk_bytes: 0,
        keep_last_n: 5,
        logging: LoggingConfig {
            target: deploy_center_engine::config::LogTarget::Console,
            format: deploy_center_engine::config::LogFormat::Compact,
            level: "error".to_string(),
            log_dir: PathBuf::from("logs"),
            log_prefix: "test".to_string(),
        },
    }
}

fn sample_project(repo_path: &Path, target_path: &Path, pipeline: Vec<PipelineStep>) -> Project {
    Project {
        id: Uuid::new_v4(),
        name: "demo".to_string(),
        repo_url: repo_path.to_string_lossy().to_string(),
        default_branch: "main".to_string(),
        target_paths: vec![target_path.to_string_lossy().to_string()],
        pipeline,
        use_ssh_key: false,
        encrypted_private_key: None,
        public_key_fingerprint: None,
        webhook_secret: None,
        auto_deploy: true,
        active: true,
        deploy_on_paths: vec![],
        build_output: None,
        sync_ignore_patterns: vec![],
        rsync_options: None,
    }
}

fn step(name: &str, run: &[&str]) -> PipelineStep {
    PipelineStep { name: name.to_string(), run: run.iter().map(|s| s.to_string()).collect(), run_if: None }
}

async fn build_controller(base: &Path) -> (Arc<Controller>, Arc<InMemoryStore>, Arc<InMemoryAuditSink>) {
    let store = InMemoryStore::new();
    let audit = InMemoryAuditSink::new();
    let controller = Controller::new(
        test_config(base.to_path_buf()),
        store.clone() as Arc<dyn ProjectStore>,
        store.clone() as Arc<dyn DeploymentStore>,
        audit.clone() as Arc<dyn deploy_center_engine::ports::AuditSink>,
        Arc::new(deploy_center_engine::ports::NoopNotificationSink),
    )
    .unwrap();
    (controller, store, audit)
}

/// Poll the store until the deployment reaches a terminal status, or panic
/// after a generous timeout (every deploy here runs against a local
/// filesystem repo, so seconds, not minutes, suffice).
async fn await_terminal(store: &InMemoryStore, id: Uuid) -> deploy_center_engine::models::Deployment {
    for _ in 0..200 {
        let deployment = DeploymentStore::get(store, id).await.expect("deployment must exist");
        if deployment.status.is_terminal() {
            return deployment;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("deployment {id} did not reach a terminal status in time");
}

#[tokio::test]
async fn s1_successful_webhook_deploy_publishes_and_writes_marker() {
    let (repo, commit) = init_repo(&[("README.md", "hello repo")]);
    let base = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();
    let (controller, store, _audit) = build_controller(base.path()).await;

    let project = sample_project(repo.path(), target.path(), vec![step("build", &["echo hello > index.html"])]);
    let project_id = project.id;
    store.put_project(project).await;

    let deployment = Arc::clone(&controller)
        .create_deployment(CreateDeploymentParams {
            project_id,
            triggered_by: "webhook".to_string(),
            trigger_type: TriggerType::Webhook,
            branch: Some("main".to_string()),
            commit_hash: Some(commit.clone()),
            commit_message: None,
            author: None,
        })
        .await
        .unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Queued);

    let finished = await_terminal(&store, deployment.id).await;
    assert_eq!(finished.status, DeploymentStatus::Success);
    assert!(finished.duration_seconds.unwrap_or(-1) >= 0);

    let index_html = target.path().join("index.html");
    assert_eq!(std::fs::read_to_string(&index_html).unwrap().trim(), "hello");

    let marker_path = target.path().join(".deploy-center");
    let marker: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(marker_path).unwrap()).unwrap();
    assert_eq!(marker["deployment_id"], deployment.id.to_string());
    assert_eq!(marker["status"], "success");
}

#[tokio::test]
async fn s2_preserve_set_is_honoured_and_stale_files_removed() {
    let (repo, commit) = init_repo(&[("README.md", "hello repo")]);
    let base = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();

    std::fs::write(target.path().join(".env"), "SECRET=x").unwrap();
    std::fs::create_dir_all(target.path().join("uploads")).unwrap();
    std::fs::write(target.path().join("uploads/a.jpg"), b"binary-data").unwrap();
    std::fs::write(target.path().join("stale.txt"), "should be removed").unwrap();

    let (controller, store, _audit) = build_controller(base.path()).await;
    let project = sample_project(repo.path(), target.path(), vec![step("build", &["echo hello > index.html"])]);
    let project_id = project.id;
    store.put_project(project).await;

    let deployment = Arc::clone(&controller)
        .create_deployment(CreateDeploymentParams {
            project_id,
            triggered_by: "webhook".to_string(),
            trigger_type: TriggerType::Webhook,
            branch: Some("main".to_string()),
            commit_hash: Some(commit),
            commit_message: None,
            author: None,
        })
        .await
        .unwrap();

    let finished = await_terminal(&store, deployment.id).await;
    assert_eq!(finished.status, DeploymentStatus::Success);

    assert_eq!(std::fs::read_to_string(target.path().join(".env")).unwrap(), "SECRET=x");
    assert_eq!(std::fs::read(target.path().join("uploads/a.jpg")).unwrap(), b"binary-data");
    assert!(target.path().join("index.html").exists());
    assert!(!target.path().join("stale.txt").exists());
}

#[tokio::test]
async fn s3_pipeline_failure_aborts_publish_and_cleans_up() {
    let (repo, commit) = init_repo(&[("README.md", "hello repo")]);
    let base = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();

    let (controller, store, _audit) = build_controller(base.path()).await;
    let project = sample_project(repo.path(), target.path(), vec![step("build", &["exit 1"])]);
    let project_id = project.id;
    store.put_project(project).await;

    let deployment = Arc::clone(&controller)
        .create_deployment(CreateDeploymentParams {
            project_id,
            triggered_by: "webhook".to_string(),
            trigger_type: TriggerType::Webhook,
            branch: Some("main".to_string()),
            commit_hash: Some(commit),
            commit_message: None,
            author: None,
        })
        .await
        .unwrap();

    let finished = await_terminal(&store, deployment.id).await;
    assert_eq!(finished.status, DeploymentStatus::Failed);
    assert!(finished.error_message.is_some());

    assert!(!target.path().join("index.html").exists());

    let steps = store.steps_for_deployment(deployment.id).await;
    let build_step = steps.iter().find(|s| s.name == "build").expect("build step recorded");
    assert_eq!(build_step.status, deploy_center_engine::models::DeploymentStepStatus::Failed);

    // Workspace must be gone (or quarantined) once the deployment terminates.
    let project_dir = base.path().join(format!("project-{project_id}"));
    if project_dir.exists() {
        for entry in std::fs::read_dir(&project_dir).unwrap().flatten() {
            assert!(entry.file_name() == "_quarantine" || !entry.path().is_dir());
        }
    }
}

#[tokio::test]
async fn s4_cancel_only_succeeds_while_queued() {
    let (repo, commit) = init_repo(&[("README.md", "hello repo")]);
    let base = tempfile::tempdir().unwrap();
    let target_a = tempfile::tempdir().unwrap();
    let target_b = tempfile::tempdir().unwrap();

    let (controller, store, _audit) = build_controller(base.path()).await;
    let project = sample_project(repo.path(), target_a.path(), vec![step("slow", &["sleep 1"])]);
    let project_id = project.id;
    store.put_project(project).await;

    let params = |commit: &str| CreateDeploymentParams {
        project_id,
        triggered_by: "webhook".to_string(),
        trigger_type: TriggerType::Webhook,
        branch: Some("main".to_string()),
        commit_hash: Some(commit.to_string()),
        commit_message: None,
        author: None,
    };

    let first = Arc::clone(&controller).create_deployment(params(&commit)).await.unwrap();
    let second = Arc::clone(&controller).create_deployment(params(&commit)).await.unwrap();

    // Let the first unit start running (clone completes quickly for a local
    // repo) so it transitions out of Queued before we try to cancel it.
    tokio::time::sleep(Duration::from_millis(250)).await;

    let cancel_second = Arc::clone(&controller).cancel(second.id).await;
    assert!(cancel_second.is_ok());
    let second_after = DeploymentStore::get(&*store, second.id).await.unwrap();
    assert_eq!(second_after.status, DeploymentStatus::Cancelled);

    let cancel_first = Arc::clone(&controller).cancel(first.id).await;
    assert!(cancel_first.is_err());
    let first_after = DeploymentStore::get(&*store, first.id).await.unwrap();
    assert_ne!(first_after.status, DeploymentStatus::Cancelled);

    let _ = target_b; // kept alive only to mirror the two-project naming in the scenario text
    await_terminal(&store, first.id).await;
}

#[tokio::test]
async fn s5_cross_project_deployments_run_in_parallel() {
    let (repo_a, commit_a) = init_repo(&[("README.md", "repo a")]);
    let (repo_b, commit_b) = init_repo(&[("README.md", "repo b")]);
    let base = tempfile::tempdir().unwrap();
    let target_a = tempfile::tempdir().unwrap();
    let target_b = tempfile::tempdir().unwrap();

    let (controller, store, _audit) = build_controller(base.path()).await;
    let project_a = sample_project(repo_a.path(), target_a.path(), vec![step("slow", &["sleep 1"])]);
    let project_b = sample_project(repo_b.path(), target_b.path(), vec![step("slow", &["sleep 1"])]);
    let (project_a_id, project_b_id) = (project_a.id, project_b.id);
    store.put_project(project_a).await;
    store.put_project(project_b).await;

    let deployment_a = Arc::clone(&controller)
        .create_deployment(CreateDeploymentParams {
            project_id: project_a_id,
            triggered_by: "webhook".to_string(),
            trigger_type: TriggerType::Webhook,
            branch: Some("main".to_string()),
            commit_hash: Some(commit_a),
            commit_message: None,
            author: None,
        })
        .await
        .unwrap();
    let deployment_b = Arc::clone(&controller)
        .create_deployment(CreateDeploymentParams {
            project_id: project_b_id,
            triggered_by: "webhook".to_string(),
            trigger_type: TriggerType::Webhook,
            branch: Some("main".to_string()),
            commit_hash: Some(commit_b),
            commit_message: None,
            author: None,
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let a = DeploymentStore::get(&*store, deployment_a.id).await.unwrap();
    let b = DeploymentStore::get(&*store, deployment_b.id).await.unwrap();
    assert_eq!(a.status, DeploymentStatus::InProgress);
    assert_eq!(b.status, DeploymentStatus::InProgress);

    let finished_a = await_terminal(&store, deployment_a.id).await;
    let finished_b = await_terminal(&store, deployment_b.id).await;
    assert_eq!(finished_a.status, DeploymentStatus::Success);
    assert_eq!(finished_b.status, DeploymentStatus::Success);
}

#[tokio::test]
async fn s6_ssh_key_is_materialised_used_and_destroyed() {
    let (repo, commit) = init_repo(&[("README.md", "hello repo")]);
    let base = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();

    let (controller, store, audit) = build_controller(base.path()).await;
    let encryption_key = [9u8; 32]; // must match test_config's encryption_key_hex
    let blob: EncryptedBlob = crypto::encrypt(TEST_ED25519_KEY.as_bytes(), &encryption_key).unwrap();

    let mut project = sample_project(repo.path(), target.path(), vec![step("build", &["echo hello > index.html"])]);
    project.use_ssh_key = true;
    project.encrypted_private_key = Some(blob);
    let project_id = project.id;
    store.put_project(project).await;

    let deployment = Arc::clone(&controller)
        .create_deployment(CreateDeploymentParams {
            project_id,
            triggered_by: "webhook".to_string(),
            trigger_type: TriggerType::Webhook,
            branch: Some("main".to_string()),
            commit_hash: Some(commit),
            commit_message: None,
            author: None,
        })
        .await
        .unwrap();

    let finished = await_terminal(&store, deployment.id).await;
    assert_eq!(finished.status, DeploymentStatus::Success);

    let entries = audit.entries().await;
    let ssh_used = entries.iter().any(|e| {
        matches!(
            &e.action,
            deploy_center_engine::ports::AuditAction::SshKeyUsed { project_id: p, success: true, fingerprint: Some(_), .. }
            if *p == project_id
        )
    });
    assert!(ssh_used, "expected an SSH_KEY_USED audit entry with success=true and a fingerprint");

    let ssh_temp_dir = std::env::temp_dir().join("deploy-center-ssh-runtime");
    let leftover = std::fs::read_dir(&ssh_temp_dir)
        .map(|mut entries| entries.any(|e| e.unwrap().file_name().to_string_lossy().contains(&format!("key-p{project_id}"))))
        .unwrap_or(false);
    assert!(!leftover, "ephemeral ssh key file must not survive deployment completion");
}

#[tokio::test]
async fn retry_after_failure_creates_a_new_queued_deployment_with_retry_trigger() {
    let (repo, commit) = init_repo(&[("README.md", "hello repo")]);
    let base = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();

    let (controller, store, _audit) = build_controller(base.path()).await;
    let project = sample_project(repo.path(), target.path(), vec![step("boom", &["exit 1"])]);
    let project_id = project.id;
    store.put_project(project).await;

    let deployment = Arc::clone(&controller)
        .create_deployment(CreateDeploymentParams {
            project_id,
            triggered_by: "webhook".to_string(),
            trigger_type: TriggerType::Webhook,
            branch: Some("main".to_string()),
            commit_hash: Some(commit),
            commit_message: None,
            author: None,
        })
        .await
        .unwrap();
    let finished = await_terminal(&store, deployment.id).await;
    assert_eq!(finished.status, DeploymentStatus::Failed);

    let retried = Arc::clone(&controller).retry(deployment.id, "alice".to_string()).await.unwrap();
    assert_eq!(retried.trigger_type, TriggerType::Retry);
    assert_eq!(retried.status, DeploymentStatus::Queued);
    assert_eq!(retried.branch, finished.branch);
    assert_eq!(retried.commit_hash, finished.commit_hash);
    assert_ne!(retried.id, deployment.id);

    // A retry attempt against a Success/Queued deployment is rejected.
    let cannot_retry_success = Arc::clone(&controller).retry(retried.id, "alice".to_string()).await;
    assert!(cannot_retry_success.is_err());
}

#[tokio::test]
async fn cancelling_a_queued_deployment_twice_is_an_error_the_second_time() {
    let (repo, commit) = init_repo(&[("README.md", "hello repo")]);
    let base = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir().unwrap();

    let (controller, store, _audit) = build_controller(base.path()).await;
    let project = sample_project(repo.path(), target.path(), vec![step("slow", &["sleep 1"])]);
    let project_id = project.id;
    store.put_project(project).await;

    // Occupy the project's single executor slot so the second deployment
    // stays Queued long enough to be cancelled twice.
    let first = Arc::clone(&controller)
        .create_deployment(CreateDeploymentParams {
            project_id,
            triggered_by: "webhook".to_string(),
            trigger_type: TriggerType::Webhook,
            branch: Some("main".to_string()),
            commit_hash: Some(commit.clone()),
            commit_message: None,
            author: None,
        })
        .await
        .unwrap();
    let second = Arc::clone(&controller)
        .create_deployment(CreateDeploymentParams {
            project_id,
            triggered_by: "webhook".to_string(),
            trigger_type: TriggerType::Webhook,
            branch: Some("main".to_string()),
            commit_hash: Some(commit),
            commit_message: None,
            author: None,
        })
        .await
        .unwrap();

    let first_cancel = Arc::clone(&controller).cancel(second.id).await;
    assert!(first_cancel.is_ok());
    let second_cancel = Arc::clone(&controller).cancel(second.id).await;
    assert!(second_cancel.is_err());

    await_terminal(&store, first.id).await;
}

//! Pipeline runner: executes a project's pipeline inside one persistent
//! shell session
//!
//! One [`crate::shell::ShellSession`] per pipeline invocation, carrying
//! `GIT_SSH_COMMAND` in its environment when an ephemeral key is
//! materialised so every git invocation in every step authenticates
//! automatically. Step records are persisted through
//! [`crate::ports::DeploymentStore`] and every log line is forwarded to the
//! [`crate::events::EventBus`], with a `tracing` call around each state
//! transition.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::events::{Event, EventBus};
use crate::expr;
use crate::models::{DeploymentContext, DeploymentStep, DeploymentStepStatus, PipelineStep};
use crate::ports::DeploymentStore;
use crate::shell::{OutputLine, ShellSession};
use crate::ssh::SshKeyManager;

/// Package-manager notice/warn markers: lines on the error stream matching
/// one of these are warnings, not errors.
const WARNING_MARKERS: &[&str] = &[
    "npm warn", "npm notice", "yarn warn", "warning:", "deprecationwarning",
];

/// Result of one [`PipelineRunner::execute`] call.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub success: bool,
    pub completed_steps: u32,
    pub total_steps: u32,
    pub duration_seconds: i64,
    pub error_message: Option<String>,
}

/// Runs a project's pipeline inside one persistent shell session.
pub struct PipelineRunner {
    deployment_store: Arc<dyn DeploymentStore>,
    event_bus: Arc<EventBus>,
}

impl PipelineRunner {
    pub fn new(deployment_store: Arc<dyn DeploymentStore>, event_bus: Arc<EventBus>) -> Self {
        Self { deployment_store, event_bus }
    }

    /// Execute `steps` in order inside a fresh shell session rooted at
    /// `project_path`. `ssh_key_path`, when present, is wired into
    /// `GIT_SSH_COMMAND` for the session's whole lifetime.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        deployment_id: Uuid,
        project_id: Uuid,
        pipeline_name: &str,
        steps: &[PipelineStep],
        context: &DeploymentContext,
        project_path: &Path,
        ssh_key_path: Option<&Path>,
    ) -> PipelineOutcome {
        let started = Instant::now();
        let total_steps = steps.len() as u32;

        if steps.is_empty() {
            return PipelineOutcome {
                success: true,
                completed_steps: 0,
                total_steps: 0,
                duration_seconds: started.elapsed().as_secs() as i64,
                error_message: None,
            };
        }

        self.log(deployment_id, project_id, format!("=== Starting pipeline: {pipeline_name} ==="));

        let mut env = Vec::new();
        if let Some(key_path) = ssh_key_path {
            env.push(("GIT_SSH_COMMAND".to_string(), SshKeyManager::git_ssh_command(key_path)));
        }

        let session = match ShellSession::spawn(project_path, &env) {
            Ok(session) => session,
            Err(e) => {
                let message = format!("failed to start shell session: {e}");
                self.log(deployment_id, project_id, format!("[ERROR] {message}"));
                return PipelineOutcome {
                    success: false,
                    completed_steps: 0,
                    total_steps,
                    duration_seconds: started.elapsed().as_secs() as i64,
                    error_message: Some(message),
                };
            }
        };

        let mut completed = 0u32;
        for (index, step) in steps.iter().enumerate() {
            let step_number = (index + 1) as u32;
            self.log(deployment_id, project_id, format!("--- Step {step_number}/{total_steps}: {} ---", step.name));

            let mut record = DeploymentStep::start(deployment_id, step_number, &step.name);
            self.deployment_store.insert_step(record.clone()).await;

            if let Some(run_if) = &step.run_if {
                if !expr::eval_str(run_if, context) {
                    record.status = DeploymentStepStatus::Skipped;
                    record.duration_seconds = Some(0);
                    record.completed_at = Some(chrono::Utc::now());
                    self.deployment_store.update_step(record).await;
                    self.log(deployment_id, project_id, format!("step '{}' skipped (RunIf false)", step.name));
                    completed += 1;
                    continue;
                }
            }

            match self.run_step_commands(deployment_id, project_id, &session, step, context).await {
                Ok((stdout, errors_bucket)) => {
                    record.output = stdout;
                    record.finish(DeploymentStepStatus::Success);
                    self.deployment_store.update_step(record).await;
                    completed += 1;
                    let _ = errors_bucket;
                }
                Err(StepError { stdout, error_message }) => {
                    record.output = stdout;
                    record.error = error_message.clone();
                    record.finish(DeploymentStepStatus::Failed);
                    self.deployment_store.update_step(record).await;
                    self.log(
                        deployment_id,
                        project_id,
                        format!("!!! pipeline failed at step '{}': {error_message}", step.name),
                    );
                    session.shutdown().await;
                    return PipelineOutcome {
                        success: false,
                        completed_steps: completed,
                        total_steps,
                        duration_seconds: started.elapsed().as_secs() as i64,
                        error_message: Some(format!("step '{}' failed: {error_message}", step.name)),
                    };
                }
            }
        }

        self.log(deployment_id, project_id, "=== Pipeline completed successfully ===".to_string());
        PipelineOutcome {
            success: true,
            completed_steps: completed,
            total_steps,
            duration_seconds: started.elapsed().as_secs() as i64,
            error_message: None,
        }
    }

    async fn run_step_commands(
        &self,
        deployment_id: Uuid,
        project_id: Uuid,
        session: &ShellSession,
        step: &PipelineStep,
        context: &DeploymentContext,
    ) -> Result<(String, Vec<String>), StepError> {
        let mut stdout_accum = String::new();
        let mut errors_bucket = Vec::new();

        for raw_command in &step.run {
            let command = context.substitute(raw_command);
            self.log(deployment_id, project_id, format!("$ {command}"));

            let (line_tx, mut line_rx) = mpsc::unbounded_channel::<OutputLine>();
            let forward_deployment_id = deployment_id;
            let forward_project_id = project_id;
            let event_bus = Arc::clone(&self.event_bus);
            let forwarder = tokio::spawn(async move {
                while let Some(line) = line_rx.recv().await {
                    match line {
                        OutputLine::Stdout(text) => {
                            event_bus.publish(Event::DeploymentLog {
                                deployment_id: forward_deployment_id,
                                project_id: forward_project_id,
                                line: text,
                            });
                        }
                        OutputLine::Stderr(text) => {
                            event_bus.publish(Event::DeploymentLog {
                                deployment_id: forward_deployment_id,
                                project_id: forward_project_id,
                                line: format!("[ERROR] {text}"),
                            });
                        }
                    }
                }
            });

            let result = session.run(&command, line_tx).await;
            let _ = forwarder.await;

            match result {
                Ok(output) => {
                    stdout_accum.push_str(&output.stdout);
                    for line in output.stderr.lines() {
                        if is_warning(line) {
                            tracing::warn!(deployment_id = %deployment_id, command = %command, "pipeline warning: {line}");
                        } else if !line.trim().is_empty() {
                            errors_bucket.push(line.to_string());
                        }
                    }
                    if output.exit_code != 0 {
                        return Err(StepError {
                            stdout: stdout_accum,
                            error_message: format!(
                                "command '{command}' exited with code {}: {}",
                                output.exit_code,
                                if errors_bucket.is_empty() { output.stderr.clone() } else { errors_bucket.join("\n") }
                            ),
                        });
                    }
                }
                Err(e) => {
                    return Err(StepError { stdout: stdout_accum, error_message: e.to_string() });
                }
            }
        }

        Ok((stdout_accum, errors_bucket))
    }

    fn log(&self, deployment_id: Uuid, project_id: Uuid, line: String) {
        self.event_bus.publish(Event::DeploymentLog { deployment_id, project_id, line });
    }
}

struct StepError {
    stdout: String,
    error_message: String,
}

fn is_warning(line: &str) -> bool {
    let lower = line.to_lowercase();
    WARNING_MARKERS.iter().any(|marker| lower.contains(marker))
}

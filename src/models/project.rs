//! Project and pipeline definitions
//!
//! `Project` is owned by an external store; the engine only reads it (see
//! [`crate::ports::ProjectStore`]).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ciphertext triple produced by AES-256-GCM (see [`crate::crypto`]).
///
/// Never implements any form of `Display`; the plaintext it protects must
/// never reach a log line or a serialized response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedBlob {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub auth_tag: Vec<u8>,
}

/// (De)serialises a `Vec<u8>` as a base64 string rather than a JSON array of
/// small integers — the representation a `ProjectStore` backed by a JSON
/// column or an HTTP API actually wants these bytes in.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(&encoded).map_err(serde::de::Error::custom)
    }
}

/// A single pipeline step: an ordered list of shell commands run under one
/// name, optionally gated by a [`crate::expr::Expr`] condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    pub name: String,
    pub run: Vec<String>,
    /// Raw conditional expression source, parsed lazily by the pipeline
    /// runner (see `expr::parse`). `None` runs unconditionally.
    pub run_if: Option<String>,
}

impl PipelineStep {
    /// A step is valid iff its name and every command string are non-empty.
    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty()
            && !self.run.is_empty()
            && self.run.iter().all(|cmd| !cmd.trim().is_empty())
    }
}

/// A deployable project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub repo_url: String,
    pub default_branch: String,

    /// One or more production paths the build output is published to.
    pub target_paths: Vec<String>,

    /// Ordered list of pipeline steps; may be empty (legacy sync-only mode).
    pub pipeline: Vec<PipelineStep>,

    pub use_ssh_key: bool,
    /// Present iff `use_ssh_key`.
    pub encrypted_private_key: Option<EncryptedBlob>,
    /// OpenSSH public key fingerprint, computed once at key-creation time.
    pub public_key_fingerprint: Option<String>,

    /// Webhook HMAC-SHA-256 secret, never serialised out.
    #[serde(skip_serializing)]
    pub webhook_secret: Option<String>,

    pub auto_deploy: bool,
    pub active: bool,

    /// Glob filter: if non-empty, a webhook only triggers when at least one
    /// added/modified file matches one of these patterns.
    #[serde(default)]
    pub deploy_on_paths: Vec<String>,

    /// Subdirectory of the cloned workspace to publish instead of its root.
    pub build_output: Option<String>,

    /// User additions to the fixed system preserve-set.
    #[serde(default)]
    pub sync_ignore_patterns: Vec<String>,

    /// Extra flags passed to an external rsync-equivalent; `None` means the
    /// default "archive + delete-extraneous" behaviour.
    pub rsync_options: Option<Vec<String>>,
}

impl Project {
    /// Validates the invariants from the data model: an SSH-enabled project
    /// must carry a complete encrypted key triple, and at least one target
    /// path must be configured. The pipeline may legitimately be empty.
    pub fn validate(&self) -> Result<(), String> {
        if self.use_ssh_key && self.encrypted_private_key.is_none() {
            return Err("project has use_ssh_key set but no encrypted private key".to_string());
        }
        if self.target_paths.is_empty() {
            return Err("project must have at least one target path".to_string());
        }
        Ok(())
    }

    /// A pipeline is valid iff it has at least one step and every step is
    /// individually valid. An empty pipeline is valid (legacy sync-only
    /// mode): this method only checks non-empty pipelines for internal
    /// well-formedness.
    pub fn pipeline_is_valid(&self) -> bool {
        self.pipeline.is_empty() || self.pipeline.iter().all(PipelineStep::is_valid)
    }
}

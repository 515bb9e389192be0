//! Webhook filter: signature verification and should-trigger predicate
//!
//! Consumed by the (out-of-scope) HTTP webhook endpoint. Verifies the
//! `sha256=<hex>` HMAC signature header GitHub sends, then normalises the
//! push payload into a shape that carries everything a project needs to
//! decide whether to deploy: previous commit, author email, and the
//! added/modified/removed file-path lists needed for `DeployOnPaths`
//! matching.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::BTreeSet;

use crate::glob::matches_deploy_glob;

type HmacSha256 = Hmac<Sha256>;

/// Verify a `sha256=<hex>` webhook signature header against `payload` using
/// `secret`. `Mac::verify_slice` is constant-time, satisfying the
/// timing-safe requirement.
pub fn verify_signature(secret: &str, payload: &[u8], signature_header: &str) -> bool {
    let Some(hex_signature) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(hex_signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// GitHub push-event payload shape, carrying `before` (previous commit),
/// the full commit author (name + email), and the per-commit
/// added/modified/removed path lists.
#[derive(Debug, Deserialize)]
pub struct RawPushEvent {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub before: Option<String>,
    pub after: String,
    pub repository: Option<RawRepository>,
    pub head_commit: Option<RawCommit>,
    pub commits: Option<Vec<RawCommit>>,
}

#[derive(Debug, Deserialize)]
pub struct RawRepository {
    pub name: Option<String>,
    #[serde(alias = "ssh_url")]
    pub url: Option<String>,
    pub clone_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawCommit {
    pub message: Option<String>,
    pub author: Option<RawAuthor>,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawAuthor {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// The normalised shape the deploy-decision logic works with, independent
/// of the wire payload that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedPush {
    pub branch: String,
    pub commit_hash: String,
    pub commit_message: Option<String>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub repo_name: Option<String>,
    pub repo_url: Option<String>,
    pub previous_commit: Option<String>,
    /// De-duplicated union of added/modified/removed paths across every
    /// commit in the push.
    pub changed_paths: Vec<String>,
    /// De-duplicated union of just the added/modified paths across every
    /// commit in the push, excluding removals. `DeployOnPaths` matching
    /// uses this set: a push that only deletes a matching file shouldn't
    /// trigger a deployment of content that's no longer there.
    pub added_or_modified_paths: Vec<String>,
}

/// Parse a raw GitHub-shaped push payload into the normalised shape.
pub fn normalize(raw: &RawPushEvent) -> NormalizedPush {
    let branch = raw.ref_name.strip_prefix("refs/heads/").unwrap_or(&raw.ref_name).to_string();

    let mut paths: BTreeSet<String> = BTreeSet::new();
    let mut added_or_modified: BTreeSet<String> = BTreeSet::new();
    for commit in raw.commits.iter().flatten() {
        paths.extend(commit.added.iter().cloned());
        paths.extend(commit.modified.iter().cloned());
        paths.extend(commit.removed.iter().cloned());
        added_or_modified.extend(commit.added.iter().cloned());
        added_or_modified.extend(commit.modified.iter().cloned());
    }
    if let Some(head) = &raw.head_commit {
        paths.extend(head.added.iter().cloned());
        paths.extend(head.modified.iter().cloned());
        paths.extend(head.removed.iter().cloned());
        added_or_modified.extend(head.added.iter().cloned());
        added_or_modified.extend(head.modified.iter().cloned());
    }

    let commit_message = raw.head_commit.as_ref().and_then(|c| c.message.clone());
    let author_name = raw.head_commit.as_ref().and_then(|c| c.author.as_ref()).and_then(|a| a.name.clone());
    let author_email = raw.head_commit.as_ref().and_then(|c| c.author.as_ref()).and_then(|a| a.email.clone());
    let repo_name = raw.repository.as_ref().and_then(|r| r.name.clone());
    let repo_url = raw.repository.as_ref().and_then(|r| r.url.clone().or_else(|| r.clone_url.clone()));

    NormalizedPush {
        branch,
        commit_hash: raw.after.clone(),
        commit_message,
        author_name,
        author_email,
        repo_name,
        repo_url,
        previous_commit: raw.before.clone(),
        changed_paths: paths.into_iter().collect(),
        added_or_modified_paths: added_or_modified.into_iter().collect(),
    }
}

/// Why a webhook push did not trigger a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    AutoDeployDisabled,
    BranchMismatch { expected: String, actual: String },
    RepoUrlMismatch { expected: String, actual: String },
    NoMatchingPath { patterns: Vec<String> },
}

/// Compute whether a normalised push should trigger a deployment for a
/// project.
pub fn should_trigger(
    push: &NormalizedPush,
    auto_deploy: bool,
    project_branch: &str,
    project_repo_url: &str,
    deploy_on_paths: &[String],
) -> Result<(), SkipReason> {
    if !auto_deploy {
        return Err(SkipReason::AutoDeployDisabled);
    }
    if push.branch != project_branch {
        return Err(SkipReason::BranchMismatch {
            expected: project_branch.to_string(),
            actual: push.branch.clone(),
        });
    }

    let normalized_push_url = normalize_repo_url(push.repo_url.as_deref().unwrap_or(""));
    let normalized_project_url = normalize_repo_url(project_repo_url);
    if !normalized_push_url.is_empty() && normalized_push_url != normalized_project_url {
        return Err(SkipReason::RepoUrlMismatch {
            expected: normalized_project_url,
            actual: normalized_push_url,
        });
    }

    if !deploy_on_paths.is_empty() {
        let touched: Vec<&str> = push.added_or_modified_paths.iter().map(String::as_str).collect();
        let matched = touched
            .iter()
            .any(|path| deploy_on_paths.iter().any(|pattern| matches_deploy_glob(path, pattern)));
        if !matched {
            return Err(SkipReason::NoMatchingPath { patterns: deploy_on_paths.to_vec() });
        }
    }

    Ok(())
}

/// Normalise a repository URL for comparison: lower-case, strip a trailing
/// `.git`, rewrite `git@host:path` SSH syntax to `host/path`, strip the
/// protocol, strip a trailing slash.
pub fn normalize_repo_url(url: &str) -> String {
    let mut normalized = url.trim().to_lowercase();

    if let Some(rest) = normalized.strip_prefix("git@") {
        if let Some((host, path)) = rest.split_once(':') {
            normalized = format!("{host}/{path}");
        }
    }

    for prefix in ["https://", "http://", "ssh://git@", "ssh://", "git://"] {
        if let Some(rest) = normalized.strip_prefix(prefix) {
            normalized = rest.to_string();
            break;
        }
    }

    normalized = normalized.strip_suffix(".git").unwrap_or(&normalized).to_string();
    normalized.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_verifies_with_correct_secret() {
        let secret = "whsec";
        let payload = br#"{"ref":"refs/heads/main"}"#;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verify_signature(secret, payload, &signature));
    }

    #[test]
    fn signature_rejects_one_bit_flip() {
        let secret = "whsec";
        let payload = br#"{"ref":"refs/heads/main"}"#;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        let mut bytes = mac.finalize().into_bytes().to_vec();
        bytes[0] ^= 0x01;
        let signature = format!("sha256={}", hex::encode(bytes));

        assert!(!verify_signature(secret, payload, &signature));
    }

    #[test]
    fn signature_rejects_missing_prefix() {
        assert!(!verify_signature("secret", b"body", "deadbeef"));
    }

    #[test]
    fn normalize_strips_ref_prefix() {
        let raw = RawPushEvent {
            ref_name: "refs/heads/main".to_string(),
            before: Some("aaa".to_string()),
            after: "bbb".to_string(),
            repository: None,
            head_commit: None,
            commits: None,
        };
        let push = normalize(&raw);
        assert_eq!(push.branch, "main");
        assert_eq!(push.commit_hash, "bbb");
        assert_eq!(push.previous_commit, Some("aaa".to_string()));
    }

    #[test]
    fn normalize_unions_changed_paths_across_commits() {
        let raw = RawPushEvent {
            ref_name: "refs/heads/main".to_string(),
            before: None,
            after: "bbb".to_string(),
            repository: None,
            head_commit: None,
            commits: Some(vec![
                RawCommit {
                    message: None,
                    author: None,
                    added: vec!["a.ts".to_string()],
                    modified: vec!["b.ts".to_string()],
                    removed: vec![],
                },
                RawCommit {
                    message: None,
                    author: None,
                    added: vec![],
                    modified: vec!["a.ts".to_string()],
                    removed: vec!["c.ts".to_string()],
                },
            ]),
        };
        let push = normalize(&raw);
        assert_eq!(push.changed_paths, vec!["a.ts", "b.ts", "c.ts"]);
        assert_eq!(push.added_or_modified_paths, vec!["a.ts", "b.ts"]);
    }

    #[test]
    fn repo_url_normalization_treats_ssh_and_https_as_equal() {
        assert_eq!(
            normalize_repo_url("git@github.com:acme/Demo.git"),
            normalize_repo_url("https://github.com/acme/demo.git/")
        );
    }

    #[test]
    fn should_trigger_respects_auto_deploy_flag() {
        let push = NormalizedPush { branch: "main".to_string(), ..Default::default() };
        let result = should_trigger(&push, false, "main", "git@github.com:acme/demo.git", &[]);
        assert_eq!(result, Err(SkipReason::AutoDeployDisabled));
    }

    #[test]
    fn should_trigger_rejects_branch_mismatch() {
        let push = NormalizedPush { branch: "dev".to_string(), ..Default::default() };
        let result = should_trigger(&push, true, "main", "git@github.com:acme/demo.git", &[]);
        assert!(matches!(result, Err(SkipReason::BranchMismatch { .. })));
    }

    #[test]
    fn should_trigger_rejects_repo_url_mismatch() {
        let push = NormalizedPush {
            branch: "main".to_string(),
            repo_url: Some("https://github.com/other/repo.git".to_string()),
            ..Default::default()
        };
        let result = should_trigger(&push, true, "main", "git@github.com:acme/demo.git", &[]);
        assert!(matches!(result, Err(SkipReason::RepoUrlMismatch { .. })));
    }

    #[test]
    fn should_trigger_requires_a_matching_deploy_on_path() {
        let push = NormalizedPush {
            branch: "main".to_string(),
            repo_url: Some("git@github.com:acme/demo.git".to_string()),
            changed_paths: vec!["docs/readme.md".to_string()],
            added_or_modified_paths: vec!["docs/readme.md".to_string()],
            ..Default::default()
        };
        let result = should_trigger(&push, true, "main", "git@github.com:acme/demo.git", &["src/**".to_string()]);
        assert!(matches!(result, Err(SkipReason::NoMatchingPath { .. })));
    }

    #[test]
    fn should_trigger_succeeds_with_matching_path() {
        let push = NormalizedPush {
            branch: "main".to_string(),
            repo_url: Some("git@github.com:acme/demo.git".to_string()),
            changed_paths: vec!["src/index.ts".to_string()],
            added_or_modified_paths: vec!["src/index.ts".to_string()],
            ..Default::default()
        };
        let result = should_trigger(&push, true, "main", "git@github.com:acme/demo.git", &["src/**".to_string()]);
        assert!(result.is_ok());
    }

    #[test]
    fn should_trigger_ignores_removed_only_path_matches() {
        let push = NormalizedPush {
            branch: "main".to_string(),
            repo_url: Some("git@github.com:acme/demo.git".to_string()),
            changed_paths: vec!["src/index.ts".to_string()],
            added_or_modified_paths: vec![],
            ..Default::default()
        };
        let result = should_trigger(&push, true, "main", "git@github.com:acme/demo.git", &["src/**".to_string()]);
        assert!(matches!(result, Err(SkipReason::NoMatchingPath { .. })));
    }

    #[test]
    fn should_trigger_succeeds_with_empty_deploy_on_paths() {
        let push = NormalizedPush {
            branch: "main".to_string(),
            repo_url: Some("git@github.com:acme/demo.git".to_string()),
            ..Default::default()
        };
        let result = should_trigger(&push, true, "main", "git@github.com:acme/demo.git", &[]);
        assert!(result.is_ok());
    }
}

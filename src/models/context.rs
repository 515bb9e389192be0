//! Deployment context: the read-only variable map substituted into user
//! pipeline commands during a single deployment.

use std::collections::BTreeMap;

use uuid::Uuid;

/// Named variables available to `{{name}}` substitution and to the
/// conditional expression evaluator. Built once per deployment and never
/// mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct DeploymentContext {
    vars: BTreeMap<String, String>,
}

impl DeploymentContext {
    /// Build the standard variable set from the fields named in the data
    /// model. `target_path` is the first configured deployment path.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        project_name: &str,
        project_id: Uuid,
        deployment_id: Uuid,
        repo_name: &str,
        repo_url: &str,
        branch: &str,
        commit: &str,
        commit_message: Option<&str>,
        author: Option<&str>,
        environment: &str,
        working_directory: &str,
        project_path: &str,
        target_path: &str,
        build_command: Option<&str>,
        build_output: Option<&str>,
    ) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert("ProjectName".to_string(), project_name.to_string());
        vars.insert("ProjectId".to_string(), project_id.to_string());
        vars.insert("DeploymentId".to_string(), deployment_id.to_string());
        vars.insert("RepoName".to_string(), repo_name.to_string());
        vars.insert("RepoUrl".to_string(), repo_url.to_string());
        vars.insert("Branch".to_string(), branch.to_string());
        vars.insert("Commit".to_string(), commit.to_string());
        vars.insert("CommitHash".to_string(), commit.to_string());
        vars.insert(
            "CommitMessage".to_string(),
            commit_message.unwrap_or_default().to_string(),
        );
        vars.insert("Author".to_string(), author.unwrap_or_default().to_string());
        vars.insert("Environment".to_string(), environment.to_string());
        vars.insert("WorkingDirectory".to_string(), working_directory.to_string());
        vars.insert("ProjectPath".to_string(), project_path.to_string());
        vars.insert("TargetPath".to_string(), target_path.to_string());
        vars.insert(
            "BuildCommand".to_string(),
            build_command.unwrap_or_default().to_string(),
        );
        vars.insert(
            "BuildOutput".to_string(),
            build_output.unwrap_or_default().to_string(),
        );
        Self { vars }
    }

    /// Look up a variable's string value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// `hasVar(name)`: true when the variable exists and is non-empty.
    pub fn has_var(&self, name: &str) -> bool {
        matches!(self.vars.get(name), Some(v) if !v.is_empty())
    }

    /// Substitute every `{{name}}` occurrence in `command` with its context
    /// value; unknown names are left intact, verbatim, braces included.
    pub fn substitute(&self, command: &str) -> String {
        let mut out = String::with_capacity(command.len());
        let mut rest = command;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let name = after[..end].trim();
                    match self.get(name) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push_str("{{");
                            out.push_str(&after[..end]);
                            out.push_str("}}");
                        }
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str("{{");
                    rest = after;
                    break;
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Expose the underlying map for the conditional expression evaluator.
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DeploymentContext {
        DeploymentContext::build(
            "demo",
            Uuid::new_v4(),
            Uuid::new_v4(),
            "demo",
            "git@github.com:acme/demo.git",
            "main",
            "abc123",
            Some("fix bug"),
            Some("alice"),
            "production",
            "/tmp/ws",
            "/tmp/ws",
            "/srv/www/demo",
            None,
            None,
        )
    }

    #[test]
    fn substitutes_known_variables() {
        let ctx = sample();
        assert_eq!(ctx.substitute("echo {{Branch}}"), "echo main");
        assert_eq!(ctx.substitute("{{Commit}}-{{Author}}"), "abc123-alice");
    }

    #[test]
    fn leaves_unknown_variables_intact() {
        let ctx = sample();
        assert_eq!(ctx.substitute("echo {{Foo}}"), "echo {{Foo}}");
    }

    #[test]
    fn has_var_false_for_empty_value() {
        let ctx = sample();
        assert!(!ctx.has_var("BuildCommand"));
        assert!(ctx.has_var("Branch"));
    }

    #[test]
    fn has_var_false_for_missing_name() {
        let ctx = sample();
        assert!(!ctx.has_var("DoesNotExist"));
    }

    #[test]
    fn unterminated_brace_left_intact() {
        let ctx = sample();
        assert_eq!(ctx.substitute("echo {{Branch"), "echo {{Branch");
    }
}

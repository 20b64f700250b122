// ABOUTME: Hooks system for pipeline lifecycle events.
// ABOUTME: Discovers and executes scripts at pre-deploy, post-deploy, and on-failure points.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::types::{Revision, RunId, WorkloadId};

/// Hook execution points in the pipeline lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    /// Before a push is resolved. Failure rejects the push.
    PreDeploy,
    /// After a run succeeds. Failure logs warning.
    PostDeploy,
    /// After a run rolls back or fails. Failure logs warning.
    OnFailure,
}

impl HookPoint {
    pub fn filename(&self) -> &'static str {
        match self {
            HookPoint::PreDeploy => "pre-deploy",
            HookPoint::PostDeploy => "post-deploy",
            HookPoint::OnFailure => "on-failure",
        }
    }

    /// Whether failure at this hook point should stop the push.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HookPoint::PreDeploy)
    }
}

/// Context passed to hooks via environment variables.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub workload: WorkloadId,
    pub revision: Revision,
    /// Pinned artifact reference, once resolved.
    pub artifact: Option<String>,
    pub run: Option<RunId>,
    /// Terminal state name, for post-run hooks.
    pub state: Option<String>,
    pub failure: Option<String>,
}

impl HookContext {
    pub fn new(workload: WorkloadId, revision: Revision) -> Self {
        Self {
            workload,
            revision,
            artifact: None,
            run: None,
            state: None,
            failure: None,
        }
    }

    pub fn to_env(&self) -> HashMap<String, String> {
        let always = [
            ("CONVEYOR_WORKLOAD", Some(self.workload.to_string())),
            ("CONVEYOR_COMMIT", Some(self.revision.commit.clone())),
            ("CONVEYOR_BRANCH", Some(self.revision.branch.clone())),
        ];
        let known = [
            ("CONVEYOR_ARTIFACT", self.artifact.clone()),
            ("CONVEYOR_RUN_ID", self.run.as_ref().map(ToString::to_string)),
            ("CONVEYOR_STATE", self.state.clone()),
            ("CONVEYOR_FAILURE", self.failure.clone()),
        ];
        always
            .into_iter()
            .chain(known)
            .filter_map(|(key, value)| value.map(|v| (key.to_string(), v)))
            .collect()
    }
}

#[derive(Debug)]
pub struct HookResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl HookResult {
    fn not_run(reason: String) -> Self {
        Self {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: reason,
        }
    }
}

impl From<std::process::Output> for HookResult {
    fn from(output: std::process::Output) -> Self {
        Self {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Longest a hook may run before it is killed.
const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(300);

/// Discovers and runs hooks from a project directory.
#[derive(Debug, Clone)]
pub struct HookRunner {
    hooks_dir: PathBuf,
    timeout: Duration,
}

impl HookRunner {
    /// Hooks live in `<project_dir>/.conveyor/hooks/`.
    pub fn new(project_dir: &Path) -> Self {
        Self {
            hooks_dir: project_dir.join(".conveyor").join("hooks"),
            timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn hook_exists(&self, point: HookPoint) -> bool {
        self.hook_path(point).is_file()
    }

    fn hook_path(&self, point: HookPoint) -> PathBuf {
        self.hooks_dir.join(point.filename())
    }

    /// Run the hook for `point`, or return None when there is none.
    ///
    /// A hook that cannot be spawned or outlives the timeout counts as failed.
    pub async fn run(&self, point: HookPoint, context: &HookContext) -> Option<HookResult> {
        let path = self.hook_path(point);
        if !path.is_file() {
            return None;
        }

        let name = point.filename();
        tracing::info!(workload = %context.workload, hook = name, path = %path.display(), "running hook");

        let mut command = Command::new(&path);
        command
            .envs(context.to_env())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let result = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => HookResult::from(output),
            Ok(Err(e)) => {
                tracing::error!(hook = name, error = %e, "hook could not be started");
                HookResult::not_run(e.to_string())
            }
            Err(_) => {
                tracing::error!(hook = name, timeout_secs = self.timeout.as_secs(), "hook timed out");
                HookResult::not_run(format!("timed out after {}s", self.timeout.as_secs()))
            }
        };

        if result.success {
            tracing::info!(hook = name, "hook succeeded");
        } else {
            tracing::warn!(hook = name, exit_code = ?result.exit_code, "hook failed");
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> HookContext {
        HookContext::new(
            WorkloadId::new("web").unwrap(),
            Revision::new("0123456789abcdef", "main"),
        )
    }

    #[test]
    fn only_pre_deploy_is_fatal() {
        assert!(HookPoint::PreDeploy.is_fatal());
        assert!(!HookPoint::PostDeploy.is_fatal());
        assert!(!HookPoint::OnFailure.is_fatal());
    }

    #[test]
    fn context_env_before_resolution() {
        let env = context().to_env();
        assert_eq!(env.get("CONVEYOR_WORKLOAD"), Some(&"web".to_string()));
        assert_eq!(
            env.get("CONVEYOR_COMMIT"),
            Some(&"0123456789abcdef".to_string())
        );
        assert!(!env.contains_key("CONVEYOR_ARTIFACT"));
        assert!(!env.contains_key("CONVEYOR_RUN_ID"));
    }

    #[test]
    fn context_env_after_run() {
        let mut context = context();
        context.artifact = Some("registry.local/web@sha256:abcd".to_string());
        context.run = Some(RunId::new("run-1"));
        context.state = Some("rolled-back".to_string());
        context.failure = Some("Unhealthy: replicas unhealthy".to_string());

        let env = context.to_env();
        assert_eq!(env.get("CONVEYOR_RUN_ID"), Some(&"run-1".to_string()));
        assert_eq!(env.get("CONVEYOR_STATE"), Some(&"rolled-back".to_string()));
        assert!(env.contains_key("CONVEYOR_FAILURE"));
    }

    #[test]
    fn missing_hooks_dir_means_no_hooks() {
        let runner = HookRunner::new(Path::new("/nonexistent"));
        assert!(!runner.hook_exists(HookPoint::PreDeploy));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_hook_reports_exit_code() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let hooks = dir.path().join(".conveyor").join("hooks");
        std::fs::create_dir_all(&hooks).unwrap();
        let script = hooks.join("pre-deploy");
        std::fs::write(&script, "#!/bin/sh\necho \"$CONVEYOR_WORKLOAD\" >&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = HookRunner::new(dir.path());
        let result = runner.run(HookPoint::PreDeploy, &context()).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stderr.trim(), "web");
    }
}

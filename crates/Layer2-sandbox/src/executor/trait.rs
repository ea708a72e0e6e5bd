//! Process runner trait

use crate::workspace::normalize_relative;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use terminus_foundation::Result;

/// Mount point of the workspace inside a container
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// What a runner should start
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Run the interpreter on a file in the workspace root
    Script { entrypoint: String },

    /// Run a command through `bash -c`
    Shell { command: String },
}

impl Invocation {
    /// Code runs see a read-only workspace, commands may write (package installs)
    pub fn workspace_writable(&self) -> bool {
        matches!(self, Invocation::Shell { .. })
    }

    /// Only commands may reach the network
    pub fn network_enabled(&self) -> bool {
        matches!(self, Invocation::Shell { .. })
    }
}

/// One run: invocation, workspace, limits and stdin
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub invocation: Invocation,

    /// Host path of the materialized workspace
    pub workspace: PathBuf,

    /// Working directory, `/workspace`-style or relative to the workspace
    pub cwd: Option<String>,

    /// Extra environment on top of the runner's sandbox environment
    pub env: HashMap<String, String>,

    pub timeout: Duration,

    pub stdin: Option<String>,
}

impl RunSpec {
    pub fn script(workspace: impl Into<PathBuf>, entrypoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            invocation: Invocation::Script {
                entrypoint: entrypoint.into(),
            },
            workspace: workspace.into(),
            cwd: None,
            env: HashMap::new(),
            timeout,
            stdin: None,
        }
    }

    pub fn shell(workspace: impl Into<PathBuf>, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            invocation: Invocation::Shell {
                command: command.into(),
            },
            workspace: workspace.into(),
            cwd: None,
            env: HashMap::new(),
            timeout,
            stdin: None,
        }
    }

    pub fn with_cwd(mut self, cwd: Option<String>) -> Self {
        self.cwd = cwd;
        self
    }

    pub fn with_stdin(mut self, stdin: Option<String>) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// `cwd` relative to the workspace root; escapes fall back to the root
    pub fn relative_cwd(&self) -> Option<PathBuf> {
        let cwd = self.cwd.as_deref()?.trim();
        let rest = match cwd.strip_prefix(CONTAINER_WORKSPACE) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            Some(_) => return None,
            None if Path::new(cwd).is_absolute() => return None,
            None => cwd,
        };
        if rest.trim_matches('/').is_empty() {
            return None;
        }
        normalize_relative(rest).ok()
    }

    /// Working directory on the host
    pub fn host_cwd(&self) -> PathBuf {
        match self.relative_cwd() {
            Some(relative) => self.workspace.join(relative),
            None => self.workspace.clone(),
        }
    }

    /// Working directory inside a container
    pub fn container_cwd(&self) -> String {
        match self.relative_cwd() {
            Some(relative) => format!(
                "{}/{}",
                CONTAINER_WORKSPACE,
                relative.to_string_lossy().replace('\\', "/")
            ),
            None => CONTAINER_WORKSPACE.to_string(),
        }
    }
}

/// Raw result of one run, before it becomes an `ExecutionResult`
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub elapsed: Duration,
    /// Peak resident memory in bytes (0 when unavailable)
    pub memory_bytes: u64,
    pub timed_out: bool,
}

impl RunOutput {
    /// Output of a run killed at the ceiling
    pub fn timed_out(elapsed: Duration, memory_bytes: u64) -> Self {
        Self {
            elapsed,
            memory_bytes,
            timed_out: true,
            ..Default::default()
        }
    }
}

/// Runner trait - one implementation per isolation strategy
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion or until `spec.timeout`
    ///
    /// Launch problems return `Error::Launch`; a timeout is a successful call
    /// with `timed_out` set, after the process or container has been killed.
    async fn run(&self, spec: &RunSpec) -> Result<RunOutput>;

    /// Check if the runner can execute
    fn is_available(&self) -> bool;

    /// Get runner name
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_cwd(cwd: &str) -> RunSpec {
        RunSpec::shell("/tmp/ws", "ls", Duration::from_secs(1)).with_cwd(Some(cwd.to_string()))
    }

    #[test]
    fn test_cwd_mapping() {
        let spec = spec_with_cwd("/workspace/src");
        assert_eq!(spec.host_cwd(), PathBuf::from("/tmp/ws/src"));
        assert_eq!(spec.container_cwd(), "/workspace/src");

        let spec = spec_with_cwd("lib/pkg");
        assert_eq!(spec.host_cwd(), PathBuf::from("/tmp/ws/lib/pkg"));
        assert_eq!(spec.container_cwd(), "/workspace/lib/pkg");
    }

    #[test]
    fn test_cwd_falls_back_to_root() {
        for cwd in ["/workspace", "/workspace/", "/etc", "../outside", "/workspacex", ""] {
            let spec = spec_with_cwd(cwd);
            assert_eq!(spec.host_cwd(), PathBuf::from("/tmp/ws"), "cwd {:?}", cwd);
            assert_eq!(spec.container_cwd(), "/workspace");
        }

        let spec = RunSpec::script("/tmp/ws", "main.py", Duration::from_secs(1));
        assert_eq!(spec.host_cwd(), PathBuf::from("/tmp/ws"));
    }

    #[test]
    fn test_invocation_capabilities() {
        let script = Invocation::Script {
            entrypoint: "main.py".into(),
        };
        let shell = Invocation::Shell {
            command: "ls".into(),
        };
        assert!(!script.workspace_writable());
        assert!(!script.network_enabled());
        assert!(shell.workspace_writable());
        assert!(shell.network_enabled());
    }
}

//! Execution result types
//!
//! `ExecutionResult` is immutable once produced. The outcome is a tagged enum so
//! callers match on it instead of comparing status strings.

use crate::request::FileSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exit code reported for executions killed at the time ceiling
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Flat status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn display_name(&self) -> &'static str {
        match self {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Why an execution failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Rejected by the security policy; nothing was spawned
    Validation,
    /// Workspace could not be materialized
    Workspace,
    /// Runner could not start the process or container
    Launch,
    /// Program exited with a non-zero code
    Runtime,
}

/// Tagged outcome of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed,
    Failed { kind: FailureKind, error: String },
    Timeout { limit_secs: u64 },
}

/// Result of one code or command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(flatten)]
    pub outcome: ExecutionOutcome,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Wall-clock time of the run in milliseconds
    #[serde(default)]
    pub elapsed_ms: u64,

    /// Approximate peak memory in MB (0 when unavailable)
    #[serde(default)]
    pub memory_mb: f64,

    /// Files created or modified by the execution
    #[serde(default)]
    pub file_deltas: FileSet,

    pub started_at: DateTime<Utc>,
}

impl ExecutionResult {
    fn with_outcome(outcome: ExecutionOutcome) -> Self {
        Self {
            outcome,
            stdout: None,
            stderr: None,
            exit_code: None,
            elapsed_ms: 0,
            memory_mb: 0.0,
            file_deltas: FileSet::new(),
            started_at: Utc::now(),
        }
    }

    /// Successful run
    pub fn completed() -> Self {
        Self::with_outcome(ExecutionOutcome::Completed)
    }

    /// Failed run of the given kind; exit code defaults to 1
    pub fn failed(kind: FailureKind, error: impl Into<String>) -> Self {
        let mut result = Self::with_outcome(ExecutionOutcome::Failed {
            kind,
            error: error.into(),
        });
        result.exit_code = Some(1);
        result
    }

    /// Policy rejection (no process was started)
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::failed(FailureKind::Validation, reason)
    }

    /// Run killed at the time ceiling
    pub fn timed_out(limit_secs: u64) -> Self {
        let mut result = Self::with_outcome(ExecutionOutcome::Timeout { limit_secs });
        result.exit_code = Some(TIMEOUT_EXIT_CODE);
        result
    }

    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = Some(stdout.into());
        self.stderr = Some(stderr.into());
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_metrics(mut self, elapsed_ms: u64, memory_mb: f64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn with_file_deltas(mut self, deltas: FileSet) -> Self {
        self.file_deltas = deltas;
        self
    }

    pub fn status(&self) -> ExecutionStatus {
        match self.outcome {
            ExecutionOutcome::Completed => ExecutionStatus::Completed,
            ExecutionOutcome::Failed { .. } => ExecutionStatus::Failed,
            ExecutionOutcome::Timeout { .. } => ExecutionStatus::Timeout,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::Completed)
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self.outcome {
            ExecutionOutcome::Failed { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Human-readable error, if the execution did not complete
    pub fn error(&self) -> Option<String> {
        match &self.outcome {
            ExecutionOutcome::Completed => None,
            ExecutionOutcome::Failed { error, .. } => Some(error.clone()),
            ExecutionOutcome::Timeout { limit_secs } => Some(format!(
                "Execution timed out after {} seconds",
                limit_secs
            )),
        }
    }

    /// Visible transcript: stdout followed by stderr
    pub fn output(&self) -> String {
        let stdout = self.stdout.as_deref().unwrap_or_default();
        let stderr = self.stderr.as_deref().unwrap_or_default();
        match (stdout.is_empty(), stderr.is_empty()) {
            (_, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) if stdout.ends_with('\n') => format!("{}{}", stdout, stderr),
            (false, false) => format!("{}\n{}", stdout, stderr),
        }
    }
}

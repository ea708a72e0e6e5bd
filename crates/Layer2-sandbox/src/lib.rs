//! # terminus-sandbox
//!
//! Sandboxed execution core for the Terminus IDE.
//! Runs untrusted code and shell commands under time and resource bounds, and
//! keeps one persistent pty-backed shell per user.
//!
//! ## Features
//!
//! - Security policy screening of code and commands before anything is spawned
//! - Per-execution workspaces materialized from a session's files, diffed and
//!   removed afterwards
//! - Container runner (Docker) with a host subprocess fallback, chosen once
//! - Timeouts with forced cleanup (exit code 124)
//! - **Persistent shell sessions with re-attachable output streams**
//! - **Single-occupant session registry**

pub mod executor;
pub mod harness;
pub mod orchestrator;
pub mod output;
pub mod policy;
pub mod request;
pub mod result;
pub mod shell;
pub mod workspace;

// Execution
pub use orchestrator::CodeExecutor;
pub use request::{ExecutionRequest, FileSet, Language, SessionId, Source, UserId};
pub use result::{
    ExecutionOutcome, ExecutionResult, ExecutionStatus, FailureKind, TIMEOUT_EXIT_CODE,
};

// Runners
pub use executor::{
    detect_runner, ContainerRunner, ContainerRunnerConfig, EnvSecurityConfig, Invocation,
    ProcessRunner, RunOutput, RunSpec, SubprocessConfig, SubprocessRunner,
};

// Policy and post-processing
pub use harness::SolutionHarness;
pub use output::NoiseFilter;
pub use policy::{PolicyResult, SecurityPolicy, COMMAND_DENIED};
pub use workspace::{diff_directory, SandboxWorkspace, WorkspaceBuilder};

// Shell system
pub use shell::{
    OutputSink, ShellOpenError, ShellOutput, ShellSession, ShellSessionManager, ShellState,
};

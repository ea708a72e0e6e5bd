//! Code Executor - 일회성 코드/명령 실행 조율
//!
//! 보안 정책 검증, 워크스페이스 구성, 러너 호출, 출력 정리, 파일 변경 감지를
//! 하나의 흐름으로 묶습니다.
//!
//! ## 실행 흐름
//!
//! ```text
//! validate ──(거부)──▶ Failed { Validation }
//!    │
//!    ▼
//! workspace.build ──(실패)──▶ Failed { Workspace }
//!    │
//!    ▼
//! runner.run ──▶ Completed / Failed { Runtime | Launch } / Timeout
//!    │
//!    ▼
//! workspace.diff ──▶ workspace.teardown
//! ```
//!
//! ## 사용 예시
//!
//! ```ignore
//! let executor = CodeExecutor::from_config(SandboxConfig::load()).await?;
//!
//! let result = executor
//!     .execute_code("print(1+1)", 1, &FileSet::new(), None)
//!     .await;
//! assert_eq!(result.stdout.as_deref(), Some("2"));
//! ```
//!
//! 호출 간 공유 상태는 읽기 전용 정책뿐이므로 여러 세션의 실행이 병렬로 진행될 수 있다.

use crate::executor::{bytes_to_mb, detect_runner, ProcessRunner, RunOutput, RunSpec};
use crate::harness::SolutionHarness;
use crate::output::NoiseFilter;
use crate::policy::{PolicyResult, SecurityPolicy};
use crate::request::{ExecutionRequest, FileSet, Language, SessionId, Source};
use crate::result::{ExecutionResult, FailureKind};
use crate::workspace::{SandboxWorkspace, WorkspaceBuilder};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use terminus_foundation::{Error, Result, SandboxConfig};
use tracing::{debug, info, warn};

/// 일회성 실행기
pub struct CodeExecutor {
    config: SandboxConfig,
    policy: Arc<SecurityPolicy>,
    runner: Arc<dyn ProcessRunner>,
    workspaces: WorkspaceBuilder,
    harness: SolutionHarness,
    filter: NoiseFilter,
}

impl CodeExecutor {
    /// 설정된 전략으로 러너를 선택해 생성
    pub async fn from_config(config: SandboxConfig) -> Result<Self> {
        let runner = detect_runner(&config).await?;
        Ok(Self::new(config, runner))
    }

    /// 러너를 직접 지정해 생성
    pub fn new(config: SandboxConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        info!("Code executor using {} runner", runner.name());
        Self {
            workspaces: WorkspaceBuilder::new(config.workspace.root.clone()),
            harness: SolutionHarness::new(config.harness.enabled),
            policy: Arc::new(SecurityPolicy::default()),
            filter: NoiseFilter::new(),
            runner,
            config,
        }
    }

    /// 보안 정책 교체
    pub fn with_policy(mut self, policy: SecurityPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn runner_name(&self) -> &'static str {
        self.runner.name()
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// 요청 종류에 따라 코드/명령 실행으로 분기
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let stdin = request.stdin.as_deref();
        match &request.source {
            Source::Code { language, code } => {
                if Language::parse(language).is_none() {
                    warn!("Rejected execution in unsupported language '{}'", language);
                    return ExecutionResult::failed(
                        FailureKind::Validation,
                        format!("Unsupported language: {}", language),
                    );
                }
                self.execute_code(code, request.session_id, &request.files, stdin)
                    .await
            }
            Source::Command { command, cwd } => {
                self.execute_command(
                    command,
                    request.session_id,
                    &request.files,
                    cwd.as_deref(),
                    stdin,
                )
                .await
            }
        }
    }

    /// Python 코드 실행
    ///
    /// 코드는 엔트리포인트 파일로 기록되고, 출력은 도구 잡음이 제거된 상태로 반환된다.
    pub async fn execute_code(
        &self,
        code: &str,
        session_id: SessionId,
        files: &FileSet,
        stdin: Option<&str>,
    ) -> ExecutionResult {
        let started_at = Utc::now();

        let code = self
            .harness
            .apply(code, stdin)
            .unwrap_or_else(|| code.to_string());

        if let PolicyResult::Deny(reason) = self.policy.validate_code(&code) {
            return ExecutionResult::rejected(reason).with_started_at(started_at);
        }

        let entrypoint = self.config.runtime.entrypoint.clone();
        let mut baseline = files.clone();
        baseline.insert(entrypoint.clone(), code);

        info!("Executing code for session {}", session_id);
        let workspace = match self.workspaces.build(session_id, &baseline).await {
            Ok(workspace) => workspace,
            Err(e) => return workspace_failure(e).with_started_at(started_at),
        };

        let spec = RunSpec::script(workspace.path(), entrypoint, self.config.limits.timeout())
            .with_stdin(stdin.map(String::from));

        self.run_in(workspace, &spec, &baseline, true)
            .await
            .with_started_at(started_at)
    }

    /// 터미널 명령 실행
    ///
    /// `cwd`는 `/workspace` 기준 경로이며, 워크스페이스를 벗어나면 루트로 대체된다.
    pub async fn execute_command(
        &self,
        command: &str,
        session_id: SessionId,
        files: &FileSet,
        cwd: Option<&str>,
        stdin: Option<&str>,
    ) -> ExecutionResult {
        let started_at = Utc::now();

        if let PolicyResult::Deny(reason) = self.policy.validate_command(command) {
            return ExecutionResult::rejected(reason).with_started_at(started_at);
        }

        info!("Executing command for session {}: {}", session_id, command.trim());
        let workspace = match self.workspaces.build(session_id, files).await {
            Ok(workspace) => workspace,
            Err(e) => return workspace_failure(e).with_started_at(started_at),
        };

        let spec = RunSpec::shell(workspace.path(), command.trim(), self.config.limits.timeout())
            .with_cwd(cwd.map(String::from))
            .with_stdin(stdin.map(String::from));

        self.run_in(workspace, &spec, files, false)
            .await
            .with_started_at(started_at)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// 실행 → 결과 변환 → 변경 감지 → 정리 (정리는 모든 경로에서 한 번)
    async fn run_in(
        &self,
        workspace: SandboxWorkspace,
        spec: &RunSpec,
        baseline: &FileSet,
        filter_output: bool,
    ) -> ExecutionResult {
        let started = Instant::now();
        let result = match self.runner.run(spec).await {
            Ok(output) => {
                let result = self.to_result(output, filter_output);
                let deltas = workspace.diff(baseline).await;
                debug!("{} file delta(s) detected", deltas.len());
                result.with_file_deltas(deltas)
            }
            Err(e) => {
                warn!("{} runner failed: {}", self.runner.name(), e);
                let kind = match &e {
                    Error::Launch(_) | Error::Io(_) => FailureKind::Launch,
                    _ => FailureKind::Runtime,
                };
                ExecutionResult::failed(kind, e.to_string())
                    .with_metrics(started.elapsed().as_millis() as u64, 0.0)
            }
        };

        workspace.teardown();
        result
    }

    fn to_result(&self, output: RunOutput, filter_output: bool) -> ExecutionResult {
        let elapsed_ms = output.elapsed.as_millis() as u64;
        let memory_mb = bytes_to_mb(output.memory_bytes);

        if output.timed_out {
            let limit = self.config.limits.max_execution_secs;
            warn!("Execution timed out after {} seconds", limit);
            return ExecutionResult::timed_out(limit).with_metrics(elapsed_ms, memory_mb);
        }

        let (stdout, stderr) = if filter_output {
            (self.filter.clean(&output.stdout), self.filter.clean(&output.stderr))
        } else {
            (output.stdout, output.stderr)
        };

        let result = if output.exit_code == 0 {
            ExecutionResult::completed()
        } else {
            let error = if stderr.trim().is_empty() {
                format!("Process exited with code {}", output.exit_code)
            } else {
                stderr.clone()
            };
            ExecutionResult::failed(FailureKind::Runtime, error)
        };

        result
            .with_output(stdout, stderr)
            .with_exit_code(output.exit_code)
            .with_metrics(elapsed_ms, memory_mb)
    }
}

fn workspace_failure(error: Error) -> ExecutionResult {
    warn!("Workspace setup failed: {}", error);
    ExecutionResult::failed(FailureKind::Workspace, error.to_string())
}

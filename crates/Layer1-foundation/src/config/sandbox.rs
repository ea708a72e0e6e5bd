//! Sandbox Config - 통합 샌드박스 설정
//!
//! 기본값 → 글로벌(~/.config/terminus/sandbox.json) → 프로젝트(.terminus/sandbox.json)
//! 순서로 병합한다.

use crate::storage::JsonStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use super::ResourceLimits;

/// 설정 파일명
pub const SANDBOX_CONFIG_FILE: &str = "sandbox.json";

// ============================================================================
// Sandbox Config (통합)
// ============================================================================

/// Terminus 샌드박스 통합 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    /// 실행 리소스 제한
    #[serde(default)]
    pub limits: ResourceLimits,

    /// 실행 런타임 (컨테이너/서브프로세스)
    #[serde(default)]
    pub runtime: RuntimeSettings,

    /// 워크스페이스 경로
    #[serde(default)]
    pub workspace: WorkspaceSettings,

    /// 대화형 셸 설정
    #[serde(default)]
    pub shell: ShellSettings,

    /// Solution 하네스 (opt-in)
    #[serde(default)]
    pub harness: HarnessSettings,
}

impl SandboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load / Save
    // ========================================================================

    /// 글로벌 + 프로젝트 병합 로드
    ///
    /// 깨진 설정 파일은 경고 후 무시한다
    pub fn load() -> Self {
        let mut config = Self::new();

        // 1. 글로벌 설정
        if let Ok(global) = JsonStore::global() {
            config.merge_from(&global);
        }

        // 2. 프로젝트 설정
        if let Ok(project) = JsonStore::current_project() {
            config.merge_from(&project);
        }

        config
    }

    /// 특정 저장소에서만 로드
    pub fn load_from(store: &JsonStore) -> Result<Self> {
        Ok(store
            .load_optional::<SandboxConfig>(SANDBOX_CONFIG_FILE)?
            .unwrap_or_default())
    }

    /// 글로벌 설정 저장
    pub fn save_global(&self) -> Result<()> {
        self.save_to(&JsonStore::global()?)
    }

    /// 특정 저장소에 저장
    pub fn save_to(&self, store: &JsonStore) -> Result<()> {
        store.save(SANDBOX_CONFIG_FILE, self)
    }

    fn merge_from(&mut self, store: &JsonStore) {
        match store.load_optional::<SandboxConfig>(SANDBOX_CONFIG_FILE) {
            Ok(Some(other)) => self.merge(other),
            Ok(None) => {}
            Err(e) => warn!("Ignoring sandbox config: {}", e),
        }
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// 다른 설정과 병합 (other가 우선)
    pub fn merge(&mut self, other: SandboxConfig) {
        self.limits.merge(other.limits);
        self.runtime.merge(other.runtime);
        self.workspace.merge(other.workspace);
        self.shell.merge(other.shell);
        self.harness.merge(other.harness);
    }

    // ========================================================================
    // Builder
    // ========================================================================

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_strategy(mut self, strategy: RuntimeStrategy) -> Self {
        self.runtime.strategy = strategy;
        self
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace.root = root.into();
        self
    }

    pub fn with_shell_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace.shell_root = root.into();
        self
    }

    pub fn with_harness(mut self, enabled: bool) -> Self {
        self.harness.enabled = enabled;
        self
    }
}

// ============================================================================
// Runtime Settings
// ============================================================================

/// 실행 전략 선택
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStrategy {
    /// 컨테이너 런타임이 있으면 컨테이너, 없으면 서브프로세스
    #[default]
    Auto,
    /// 컨테이너 강제
    Container,
    /// 서브프로세스 강제
    Subprocess,
}

/// 런타임 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    #[serde(default)]
    pub strategy: RuntimeStrategy,

    /// 코드 실행 이미지
    #[serde(default = "default_image")]
    pub code_image: String,

    /// 터미널 명령 실행 이미지
    #[serde(default = "default_image")]
    pub command_image: String,

    /// 컨테이너 사용자
    #[serde(default = "default_container_user")]
    pub container_user: String,

    /// 샌드박스 호스트명
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// 서브프로세스 모드 Python 인터프리터
    #[serde(default = "default_python_bin")]
    pub python_bin: String,

    /// 코드가 기록되는 엔트리포인트 파일명
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            strategy: RuntimeStrategy::Auto,
            code_image: default_image(),
            command_image: default_image(),
            container_user: default_container_user(),
            hostname: default_hostname(),
            python_bin: default_python_bin(),
            entrypoint: default_entrypoint(),
        }
    }
}

impl RuntimeSettings {
    fn merge(&mut self, other: RuntimeSettings) {
        if other.strategy != RuntimeStrategy::Auto {
            self.strategy = other.strategy;
        }
        if other.code_image != default_image() {
            self.code_image = other.code_image;
        }
        if other.command_image != default_image() {
            self.command_image = other.command_image;
        }
        if other.container_user != default_container_user() {
            self.container_user = other.container_user;
        }
        if other.hostname != default_hostname() {
            self.hostname = other.hostname;
        }
        if other.python_bin != default_python_bin() {
            self.python_bin = other.python_bin;
        }
        if other.entrypoint != default_entrypoint() {
            self.entrypoint = other.entrypoint;
        }
    }
}

// ============================================================================
// Workspace Settings
// ============================================================================

/// 워크스페이스 경로 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSettings {
    /// 일회성 실행 워크스페이스 루트 (랜덤 이름)
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,

    /// 셸 세션 워크스페이스 루트 (session_<id>)
    #[serde(default = "default_shell_root")]
    pub shell_root: PathBuf,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            shell_root: default_shell_root(),
        }
    }
}

impl WorkspaceSettings {
    /// 세션 ID로 결정되는 셸 작업 디렉토리
    pub fn shell_dir(&self, session_id: i64) -> PathBuf {
        self.shell_root.join(format!("session_{}", session_id))
    }

    fn merge(&mut self, other: WorkspaceSettings) {
        if other.root != default_workspace_root() {
            self.root = other.root;
        }
        if other.shell_root != default_shell_root() {
            self.shell_root = other.shell_root;
        }
    }
}

// ============================================================================
// Shell Settings
// ============================================================================

/// 대화형 셸 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellSettings {
    /// 셸 실행 파일
    #[serde(default = "default_shell_program")]
    pub program: String,

    #[serde(default = "default_cols")]
    pub cols: u16,

    #[serde(default = "default_rows")]
    pub rows: u16,

    /// PS1 프롬프트
    #[serde(default = "default_prompt")]
    pub prompt: String,

    /// PTY 읽기 단위 (바이트)
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,

    /// SIGTERM 후 SIGKILL까지 대기 (ms)
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// 종료 확인 간격 (ms)
    #[serde(default = "default_stop_poll_ms")]
    pub stop_poll_ms: u64,

    /// 시작 후 프롬프트 출력 대기 (ms)
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            program: default_shell_program(),
            cols: default_cols(),
            rows: default_rows(),
            prompt: default_prompt(),
            read_chunk: default_read_chunk(),
            stop_grace_ms: default_stop_grace_ms(),
            stop_poll_ms: default_stop_poll_ms(),
            startup_delay_ms: default_startup_delay_ms(),
        }
    }
}

impl ShellSettings {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn stop_poll(&self) -> Duration {
        Duration::from_millis(self.stop_poll_ms.max(1))
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    fn merge(&mut self, other: ShellSettings) {
        if other.program != default_shell_program() {
            self.program = other.program;
        }
        if other.cols != default_cols() {
            self.cols = other.cols;
        }
        if other.rows != default_rows() {
            self.rows = other.rows;
        }
        if other.prompt != default_prompt() {
            self.prompt = other.prompt;
        }
        if other.read_chunk != default_read_chunk() {
            self.read_chunk = other.read_chunk;
        }
        if other.stop_grace_ms != default_stop_grace_ms() {
            self.stop_grace_ms = other.stop_grace_ms;
        }
        if other.stop_poll_ms != default_stop_poll_ms() {
            self.stop_poll_ms = other.stop_poll_ms;
        }
        if other.startup_delay_ms != default_startup_delay_ms() {
            self.startup_delay_ms = other.startup_delay_ms;
        }
    }
}

// ============================================================================
// Harness Settings
// ============================================================================

/// `class Solution` 자동 실행 하네스
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarnessSettings {
    #[serde(default)]
    pub enabled: bool,
}

impl HarnessSettings {
    fn merge(&mut self, other: HarnessSettings) {
        self.enabled = self.enabled || other.enabled;
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_image() -> String {
    "python:3.11-slim".to_string()
}

fn default_container_user() -> String {
    "nobody".to_string()
}

fn default_hostname() -> String {
    "terminuside".to_string()
}

fn default_python_bin() -> String {
    "python3".to_string()
}

fn default_entrypoint() -> String {
    "main.py".to_string()
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir()
}

fn default_shell_root() -> PathBuf {
    std::env::temp_dir().join("terminus_workspace")
}

fn default_shell_program() -> String {
    "/bin/bash".to_string()
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

fn default_prompt() -> String {
    "terminuside:~# ".to_string()
}

fn default_read_chunk() -> usize {
    1024
}

fn default_stop_grace_ms() -> u64 {
    500
}

fn default_stop_poll_ms() -> u64 {
    100
}

fn default_startup_delay_ms() -> u64 {
    500
}

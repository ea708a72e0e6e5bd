//! # terminus-foundation
//!
//! Terminus 샌드박스 실행 계층의 기반 레이어:
//! - Error: 공통 에러 타입과 `Result` 별칭
//! - Config: 샌드박스 설정 (리소스 제한, 런타임, 워크스페이스, 셸)
//! - Storage: JsonStore (글로벌/프로젝트 설정 파일)
//!
//! ## 아키텍처
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  terminus-cli (run / exec / shell)                      │
//! │                     │                                   │
//! │                     ▼                                   │
//! │  terminus-sandbox                                       │
//! │  ├── CodeExecutor ── SecurityPolicy                     │
//! │  │        │                                             │
//! │  │        ├── SandboxWorkspace (build / diff / teardown)│
//! │  │        └── ProcessRunner (container | subprocess)    │
//! │  └── ShellSessionManager ── ShellSession (pty)          │
//! │                     │                                   │
//! │                     ▼                                   │
//! │  terminus-foundation (Error, SandboxConfig, JsonStore)  │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    // Sandbox (통합 설정)
    HarnessSettings,
    RuntimeSettings,
    RuntimeStrategy,
    SandboxConfig,
    ShellSettings,
    WorkspaceSettings,
    SANDBOX_CONFIG_FILE,
    // Limits (리소스 제한)
    parse_memory_string,
    ResourceLimits,
};

// ============================================================================
// Storage (저장소)
// ============================================================================
pub use storage::JsonStore;

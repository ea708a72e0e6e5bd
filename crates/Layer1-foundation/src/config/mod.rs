//! Config - 샌드박스 설정 관리
//!
//! - `limits.rs` - 실행 시간/메모리/CPU 제한
//! - `sandbox.rs` - SandboxConfig 통합 설정

mod limits;
mod sandbox;

pub use limits::{parse_memory_string, ResourceLimits};
pub use sandbox::{
    HarnessSettings, RuntimeSettings, RuntimeStrategy, SandboxConfig, ShellSettings,
    WorkspaceSettings, SANDBOX_CONFIG_FILE,
};

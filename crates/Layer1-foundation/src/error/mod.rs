//! Error types for Terminus
//!
//! 모든 에러를 중앙에서 관리

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Terminus 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 설정 관련
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // 보안 정책 관련
    // ========================================================================
    #[error("{0}")]
    Validation(String),

    // ========================================================================
    // 실행 관련
    // ========================================================================
    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Launch failed: {0}")]
    Launch(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    // ========================================================================
    // 셸 세션 관련
    // ========================================================================
    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Session {session_id} is in use by another user")]
    SessionInUse { session_id: i64 },

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// 세션 점유 충돌 에러 생성 헬퍼
    pub fn session_in_use(session_id: i64) -> Self {
        Error::SessionInUse { session_id }
    }

    /// 사용자에게 그대로 보여줄 수 있는 에러인지 확인
    pub fn is_user_facing(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::SessionInUse { .. })
    }
}

//! Shell Session Manager - 사용자별 셸 세션 레지스트리
//!
//! 두 개의 인덱스를 하나의 잠금 아래에서 관리합니다.
//!
//! - `by_user`: 사용자당 최대 하나의 셸
//! - `occupancy`: 협업 세션당 최대 한 명의 점유자
//!
//! 점유 확인 → 기존 셸 정리 → 새 셸 시작 → 등록까지 한 번의 잠금 안에서 수행되므로
//! 동시 접속 시에도 두 불변식이 깨지지 않는다.
//!
//! ## 사용 예시
//!
//! ```ignore
//! let manager = ShellSessionManager::new(SandboxConfig::load());
//! let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//!
//! match manager.create_session(1, 7, "alice", tx).await {
//!     Ok(session) => { /* relay rx to the client */ }
//!     Err(ShellOpenError::InUse { holder, .. }) => { /* "in use by another user" */ }
//!     Err(ShellOpenError::StartFailed(reason)) => { /* generic failure */ }
//! }
//! ```

use crate::request::{SessionId, UserId};
use crate::shell::session::{OutputSink, ShellSession};
use std::collections::HashMap;
use std::sync::Arc;
use terminus_foundation::{Error, SandboxConfig};
use thiserror::Error as ThisError;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 셸 열기 실패
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ShellOpenError {
    /// 다른 사용자가 세션을 점유 중
    #[error("Session is in use by another user")]
    InUse {
        session_id: SessionId,
        holder: UserId,
    },

    /// 셸 프로세스 시작 실패
    #[error("Failed to start shell: {0}")]
    StartFailed(String),
}

impl ShellOpenError {
    pub fn is_in_use(&self) -> bool {
        matches!(self, ShellOpenError::InUse { .. })
    }
}

impl From<ShellOpenError> for Error {
    fn from(e: ShellOpenError) -> Self {
        match e {
            ShellOpenError::InUse { session_id, .. } => Error::session_in_use(session_id),
            ShellOpenError::StartFailed(reason) => Error::Pty(reason),
        }
    }
}

/// 잠금으로 보호되는 두 인덱스
#[derive(Default)]
struct Registry {
    by_user: HashMap<UserId, Arc<ShellSession>>,
    occupancy: HashMap<SessionId, UserId>,
}

impl Registry {
    /// 사용자 셸 등록 해제 (점유 인덱스는 해당 사용자 것일 때만 제거)
    fn remove_user(&mut self, user_id: UserId) -> Option<Arc<ShellSession>> {
        let session = self.by_user.remove(&user_id)?;
        if self.occupancy.get(&session.session_id()) == Some(&user_id) {
            self.occupancy.remove(&session.session_id());
        }
        Some(session)
    }
}

/// 셸 세션 매니저
pub struct ShellSessionManager {
    config: SandboxConfig,
    registry: Mutex<Registry>,
}

impl ShellSessionManager {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    // ========================================================================
    // Open / Create
    // ========================================================================

    /// 새 셸 생성
    ///
    /// 다른 사용자가 점유 중이면 `InUse`. 같은 사용자의 기존 셸은 먼저 중지된다.
    pub async fn create_session(
        &self,
        session_id: SessionId,
        user_id: UserId,
        username: &str,
        sink: OutputSink,
    ) -> Result<Arc<ShellSession>, ShellOpenError> {
        let mut registry = self.registry.lock().await;
        self.create_locked(&mut registry, session_id, user_id, username, sink)
            .await
    }

    /// 재접속: 같은 세션의 살아 있는 셸이 있으면 구독자만 교체, 없으면 생성
    pub async fn open(
        &self,
        session_id: SessionId,
        user_id: UserId,
        username: &str,
        sink: OutputSink,
    ) -> Result<Arc<ShellSession>, ShellOpenError> {
        let mut registry = self.registry.lock().await;

        if let Some(session) = registry.by_user.get(&user_id) {
            if session.session_id() == session_id && session.is_running() {
                info!(
                    "Re-attaching user {} to shell {} in session {}",
                    user_id,
                    session.shell_id(),
                    session_id
                );
                session.attach(sink);
                return Ok(Arc::clone(session));
            }
        }

        self.create_locked(&mut registry, session_id, user_id, username, sink)
            .await
    }

    async fn create_locked(
        &self,
        registry: &mut Registry,
        session_id: SessionId,
        user_id: UserId,
        username: &str,
        sink: OutputSink,
    ) -> Result<Arc<ShellSession>, ShellOpenError> {
        // 1. 점유 확인 (죽은 셸의 점유는 해제)
        if let Some(&holder) = registry.occupancy.get(&session_id) {
            if holder != user_id {
                let alive = registry
                    .by_user
                    .get(&holder)
                    .is_some_and(|session| session.is_running());
                if alive {
                    warn!(
                        "Session {} is in use by user {}; refusing user {}",
                        session_id, holder, user_id
                    );
                    return Err(ShellOpenError::InUse { session_id, holder });
                }
                if let Some(stale) = registry.remove_user(holder) {
                    stale.stop().await;
                }
                registry.occupancy.remove(&session_id);
            }
        }

        // 2. 같은 사용자의 기존 셸 중지 (재할당)
        if let Some(previous) = registry.remove_user(user_id) {
            info!(
                "Superseding shell {} of user {} (session {})",
                previous.shell_id(),
                user_id,
                previous.session_id()
            );
            previous.stop().await;
        }

        // 3. 새 셸 시작
        let session = Arc::new(ShellSession::new(
            session_id,
            user_id,
            username,
            &self.config,
        ));
        session
            .start(sink)
            .await
            .map_err(|e| ShellOpenError::StartFailed(e.to_string()))?;

        // 4. 등록
        registry.by_user.insert(user_id, Arc::clone(&session));
        registry.occupancy.insert(session_id, user_id);

        info!(
            "Shell session created: session={}, user={} ({})",
            session_id, user_id, username
        );
        Ok(session)
    }

    // ========================================================================
    // Lookup / I/O
    // ========================================================================

    /// 사용자 셸 조회. 실행 중이 아니면 등록을 정리하고 None
    pub async fn get_session(&self, user_id: UserId) -> Option<Arc<ShellSession>> {
        let mut registry = self.registry.lock().await;
        let session = registry.by_user.get(&user_id).cloned()?;

        if session.is_running() {
            return Some(session);
        }

        debug!("Cleaning up stale shell of user {}", user_id);
        if let Some(stale) = registry.remove_user(user_id) {
            stale.stop().await;
        }
        None
    }

    /// 입력 전달. 셸이 없거나 실행 중이 아니면 false
    pub async fn write_input(&self, user_id: UserId, data: impl AsRef<[u8]>) -> bool {
        match self.get_session(user_id).await {
            Some(session) => session.write_input(data),
            None => false,
        }
    }

    /// 터미널 크기 변경. 셸이 없으면 false
    pub async fn resize(&self, user_id: UserId, cols: u16, rows: u16) -> bool {
        match self.get_session(user_id).await {
            Some(session) => session.resize(cols, rows),
            None => false,
        }
    }

    /// 세션 점유자
    pub async fn occupant(&self, session_id: SessionId) -> Option<UserId> {
        self.registry.lock().await.occupancy.get(&session_id).copied()
    }

    /// 실행 중인 셸 수
    pub async fn active_count(&self) -> usize {
        self.registry
            .lock()
            .await
            .by_user
            .values()
            .filter(|session| session.is_running())
            .count()
    }

    // ========================================================================
    // Stop
    // ========================================================================

    /// 사용자 셸 중지. 셸이 있었으면 true
    pub async fn stop_user_session(&self, user_id: UserId) -> bool {
        let session = self.registry.lock().await.remove_user(user_id);
        match session {
            Some(session) => {
                session.stop().await;
                true
            }
            None => false,
        }
    }

    /// 모든 셸 중지 (프로세스 종료 시)
    pub async fn stop_all_sessions(&self) {
        let sessions: Vec<Arc<ShellSession>> = {
            let mut registry = self.registry.lock().await;
            registry.occupancy.clear();
            registry.by_user.drain().map(|(_, session)| session).collect()
        };

        info!("Stopping {} shell session(s)", sessions.len());
        for session in sessions {
            session.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn manager() -> (tempfile::TempDir, ShellSessionManager) {
        let root = tempfile::tempdir().unwrap();
        let config = SandboxConfig::default().with_shell_root(root.path());
        (root, ShellSessionManager::new(config))
    }

    #[tokio::test]
    async fn test_empty_manager() {
        let (_root, manager) = manager();

        assert!(manager.get_session(1).await.is_none());
        assert!(!manager.write_input(1, "ls\n").await);
        assert!(!manager.resize(1, 80, 24).await);
        assert!(!manager.stop_user_session(1).await);
        assert_eq!(manager.active_count().await, 0);
        assert_eq!(manager.occupant(1).await, None);
        manager.stop_all_sessions().await;
    }

    #[tokio::test]
    async fn test_start_failure_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let mut config = SandboxConfig::default().with_shell_root(root.path());
        config.shell.program = "/nonexistent/shell".to_string();
        let manager = ShellSessionManager::new(config);

        let (tx, _rx) = mpsc::channel(8);
        let result = manager.create_session(1, 1, "alice", tx).await;

        assert!(matches!(result, Err(ShellOpenError::StartFailed(_))));
        assert_eq!(manager.occupant(1).await, None);
    }

    #[test]
    fn test_open_error() {
        let in_use = ShellOpenError::InUse {
            session_id: 9,
            holder: 3,
        };
        assert!(in_use.is_in_use());
        assert_eq!(in_use.to_string(), "Session is in use by another user");
        assert!(!ShellOpenError::StartFailed("x".into()).is_in_use());
    }

    #[test]
    fn test_open_error_into_error() {
        let in_use = Error::from(ShellOpenError::InUse {
            session_id: 9,
            holder: 3,
        });
        assert!(matches!(in_use, Error::SessionInUse { session_id: 9 }));
        assert!(in_use.is_user_facing());

        let failed = Error::from(ShellOpenError::StartFailed("no pty".into()));
        assert!(matches!(failed, Error::Pty(ref reason) if reason == "no pty"));
        assert!(!failed.is_user_facing());
    }
}

//! 셸 세션 통합 테스트 - 실제 PTY 위에서 bash 세션 수명주기 검증
//!
//! `cargo test -p terminus-sandbox --test shell_test -- --nocapture`
//!
//! bash 또는 PTY를 사용할 수 없는 환경에서는 건너뛴다.

use portable_pty::{native_pty_system, PtySize};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use terminus_foundation::SandboxConfig;
use terminus_sandbox::{ShellOpenError, ShellOutput, ShellSession, ShellSessionManager, ShellState};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

fn shell_config(root: &TempDir) -> Option<SandboxConfig> {
    let Ok(bash) = which::which("bash") else {
        println!("skipping: bash not found");
        return None;
    };
    if native_pty_system().openpty(PtySize::default()).is_err() {
        println!("skipping: no pty available");
        return None;
    }

    let mut config = SandboxConfig::default().with_shell_root(root.path());
    config.shell.program = bash.display().to_string();
    config.shell.startup_delay_ms = 100;
    config.shell.stop_grace_ms = 500;
    config.shell.stop_poll_ms = 20;
    Some(config)
}

/// `needle`이 나타날 때까지 출력 누적. 시간 초과 시 누적된 출력과 함께 false
async fn read_until(rx: &mut mpsc::Receiver<ShellOutput>, needle: &str) -> (bool, String) {
    let mut seen = String::new();
    let found = tokio::time::timeout(WAIT, async {
        while let Some(output) = rx.recv().await {
            match output {
                ShellOutput::Data(data) => {
                    seen.push_str(&data);
                    if seen.contains(needle) {
                        return true;
                    }
                }
                ShellOutput::Closed => return false,
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    (found, seen)
}

async fn wait_closed(rx: &mut mpsc::Receiver<ShellOutput>) -> bool {
    tokio::time::timeout(WAIT, async {
        while let Some(output) = rx.recv().await {
            if output == ShellOutput::Closed {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false)
}

#[tokio::test]
async fn test_shell_echo_and_stop() {
    let root = TempDir::new().unwrap();
    let Some(config) = shell_config(&root) else {
        return;
    };

    let session = Arc::new(ShellSession::new(42, 1, "alice", &config));
    let (tx, mut rx) = mpsc::channel(100);
    session.start(tx).await.expect("shell should start");

    assert_eq!(session.state(), ShellState::Running);
    assert!(session.is_running());
    let pid = session.pid().expect("running shell has a pid");
    println!("shell pid: {}", pid);

    // 입력 에코는 산술 확장 전 문자열이므로 결과 문자열로만 매칭된다
    assert!(session.write_input("echo hello_$((1+2))\n"));
    let (found, seen) = read_until(&mut rx, "hello_3").await;
    assert!(found, "echo output not seen: {:?}", seen);

    session.stop().await;
    assert_eq!(session.state(), ShellState::Stopped);
    assert!(!session.is_running());
    assert!(session.pid().is_none());
    assert!(!session.write_input("echo late\n"));

    // 두 번째 stop은 아무 일도 하지 않는다
    session.stop().await;
    assert_eq!(session.state(), ShellState::Stopped);

    assert!(wait_closed(&mut rx).await, "closed notice expected");

    #[cfg(target_os = "linux")]
    assert!(
        !std::path::Path::new(&format!("/proc/{}", pid)).exists(),
        "shell process should be gone"
    );
}

#[tokio::test]
async fn test_working_dir_seeded() {
    let root = TempDir::new().unwrap();
    let Some(config) = shell_config(&root) else {
        return;
    };

    let session = Arc::new(ShellSession::new(7, 1, "alice", &config));
    let (tx, mut rx) = mpsc::channel(100);
    session.start(tx).await.unwrap();

    let dir = root.path().join("session_7");
    assert_eq!(session.working_dir(), dir.as_path());
    assert!(dir.join(".bashrc").exists());
    assert!(dir.join("package.json").exists());

    session.write_input("pwd; echo marker_$((2*3))\n");
    let (found, seen) = read_until(&mut rx, "marker_6").await;
    assert!(found, "pwd output not seen: {:?}", seen);
    assert!(seen.contains("session_7"));

    session.stop().await;
}

#[tokio::test]
async fn test_resize() {
    let root = TempDir::new().unwrap();
    let Some(config) = shell_config(&root) else {
        return;
    };

    let session = Arc::new(ShellSession::new(3, 1, "alice", &config));
    let (tx, mut rx) = mpsc::channel(100);
    session.start(tx).await.unwrap();

    assert!(session.resize(100, 40));
    assert_eq!(session.size(), (100, 40));

    session.write_input("stty size\n");
    let (found, seen) = read_until(&mut rx, "40 100").await;
    assert!(found, "stty output not seen: {:?}", seen);

    session.stop().await;
    assert!(!session.resize(80, 24));
}

#[tokio::test]
async fn test_single_occupancy() {
    let root = TempDir::new().unwrap();
    let Some(config) = shell_config(&root) else {
        return;
    };
    let manager = ShellSessionManager::new(config);

    let (tx_a, _rx_a) = mpsc::channel(100);
    let (tx_b, _rx_b) = mpsc::channel(100);
    let (a, b) = tokio::join!(
        manager.create_session(9, 1, "alice", tx_a),
        manager.create_session(9, 2, "bob", tx_b),
    );

    let (winner, loser) = match (&a, &b) {
        (Ok(_), Err(e)) => {
            assert!(e.is_in_use());
            (1, 2)
        }
        (Err(e), Ok(_)) => {
            assert!(e.is_in_use());
            (2, 1)
        }
        other => panic!("exactly one create should succeed: {:?}", other),
    };
    println!("winner: user {}", winner);

    assert_eq!(manager.occupant(9).await, Some(winner));
    assert_eq!(manager.active_count().await, 1);

    assert!(manager.stop_user_session(winner).await);
    assert_eq!(manager.occupant(9).await, None);

    let (tx, _rx) = mpsc::channel(100);
    let session = manager
        .create_session(9, loser, "other", tx)
        .await
        .expect("session is free after stop");
    assert_eq!(session.user_id(), loser);
    assert_eq!(manager.occupant(9).await, Some(loser));

    manager.stop_all_sessions().await;
}

#[tokio::test]
async fn test_in_use_reports_holder() {
    let root = TempDir::new().unwrap();
    let Some(config) = shell_config(&root) else {
        return;
    };
    let manager = ShellSessionManager::new(config);

    let (tx, _rx) = mpsc::channel(100);
    manager.create_session(5, 1, "alice", tx).await.unwrap();

    let (tx, _rx2) = mpsc::channel(100);
    let err = manager.create_session(5, 2, "bob", tx).await.unwrap_err();
    assert_eq!(
        err,
        ShellOpenError::InUse {
            session_id: 5,
            holder: 1
        }
    );

    manager.stop_all_sessions().await;
    assert_eq!(manager.active_count().await, 0);
}

#[tokio::test]
async fn test_reassignment_stops_previous() {
    let root = TempDir::new().unwrap();
    let Some(config) = shell_config(&root) else {
        return;
    };
    let manager = ShellSessionManager::new(config);

    let (tx, _rx) = mpsc::channel(100);
    let first = manager.create_session(10, 1, "alice", tx).await.unwrap();
    let (tx, _rx2) = mpsc::channel(100);
    let second = manager.create_session(11, 1, "alice", tx).await.unwrap();

    assert_eq!(first.state(), ShellState::Stopped);
    assert_eq!(second.state(), ShellState::Running);
    assert_eq!(manager.active_count().await, 1);
    assert_eq!(manager.occupant(10).await, None);
    assert_eq!(manager.occupant(11).await, Some(1));

    let current = manager.get_session(1).await.unwrap();
    assert_eq!(current.shell_id(), second.shell_id());

    manager.stop_all_sessions().await;
}

#[tokio::test]
async fn test_open_reattaches() {
    let root = TempDir::new().unwrap();
    let Some(config) = shell_config(&root) else {
        return;
    };
    let manager = ShellSessionManager::new(config);

    let (tx, _old_rx) = mpsc::channel(100);
    let original = manager.open(4, 1, "alice", tx).await.unwrap();

    let (tx, mut rx) = mpsc::channel(100);
    let reopened = manager.open(4, 1, "alice", tx).await.unwrap();
    assert_eq!(original.shell_id(), reopened.shell_id());

    assert!(manager.write_input(1, "echo again_$((4+4))\n").await);
    let (found, seen) = read_until(&mut rx, "again_8").await;
    assert!(found, "output should reach the new subscriber: {:?}", seen);

    manager.stop_all_sessions().await;
}

#[tokio::test]
async fn test_exited_shell_is_cleaned_up() {
    let root = TempDir::new().unwrap();
    let Some(config) = shell_config(&root) else {
        return;
    };
    let manager = ShellSessionManager::new(config);

    let (tx, mut rx) = mpsc::channel(100);
    let session = manager.create_session(6, 1, "alice", tx).await.unwrap();

    assert!(session.write_input("exit\n"));
    assert!(wait_closed(&mut rx).await, "shell exit should close the stream");

    assert!(manager.get_session(1).await.is_none());
    assert_eq!(manager.occupant(6).await, None);
    assert!(!manager.write_input(1, "ls\n").await);
    assert_eq!(session.state(), ShellState::Stopped);
}

#[tokio::test]
async fn test_stop_with_detached_slave_holder() {
    let root = TempDir::new().unwrap();
    let Some(config) = shell_config(&root) else {
        return;
    };
    if which::which("setsid").is_err() {
        println!("skipping: setsid not found");
        return;
    }

    let session = Arc::new(ShellSession::new(12, 1, "alice", &config));
    let (tx, mut rx) = mpsc::channel(100);
    session.start(tx).await.unwrap();

    // 새 세션으로 분리된 프로세스가 슬레이브를 계속 잡고 있다
    session.write_input("setsid sleep 20 & echo detached_$((5+5))\n");
    let (found, seen) = read_until(&mut rx, "detached_10").await;
    assert!(found, "background job not started: {:?}", seen);

    let started = std::time::Instant::now();
    session.stop().await;
    assert_eq!(session.state(), ShellState::Stopped);

    let closed = tokio::time::timeout(Duration::from_secs(4), async {
        while let Some(output) = rx.recv().await {
            if output == ShellOutput::Closed {
                return true;
            }
        }
        false
    })
    .await;
    println!("closed after {:?}", started.elapsed());
    assert_eq!(closed, Ok(true), "stop should close the stream");

    // Closed는 한 번만 전달된다
    let extra = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(
        !matches!(extra, Ok(Some(ShellOutput::Closed))),
        "duplicate closed notice"
    );
}

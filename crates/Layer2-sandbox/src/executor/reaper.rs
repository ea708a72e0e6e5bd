//! Reaper - 프로세스 그룹을 벗어난 후손 프로세스 정리
//!
//! `killpg`는 원래 그룹만 죽인다. `setsid()`로 분리된 후손은 그룹 밖에 남아
//! 출력 파이프를 붙잡고 실행 시간 제한을 넘겨 살아남을 수 있다.
//!
//! 실행마다 고유 마커를 환경 변수로 심고, 종료 시 `/proc`을 훑어서 다음 중
//! 하나에 해당하는 프로세스를 SIGKILL 한다.
//! - 환경에 마커가 있다 (fork로 상속됨)
//! - 실행의 stdout/stderr 파이프를 들고 있다 (환경을 비우고 exec한 경우)
//!
//! ## 플랫폼 지원
//! - Linux: `/proc/<pid>/environ`, `/proc/<pid>/fd`
//! - 그 외: 정리 없음 (그룹 kill만 적용)

use tracing::{debug, warn};
use uuid::Uuid;

/// 마커 환경 변수 이름
pub const RUN_MARKER_VAR: &str = "TERMINUS_RUN_ID";

/// 한 번의 sweep에서 반복할 최대 횟수 (sweep 중 fork된 프로세스 대비)
const MAX_SWEEP_ROUNDS: usize = 3;

/// 한 실행에 속한 프로세스 식별 정보
#[derive(Debug, Clone)]
pub struct RunTracker {
    marker: String,
    pipes: Vec<u64>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            marker: Uuid::new_v4().simple().to_string(),
            pipes: Vec::new(),
        }
    }

    /// 자식 환경에 추가할 마커 변수
    pub fn env(&self) -> (String, String) {
        (RUN_MARKER_VAR.to_string(), self.marker.clone())
    }

    /// 파이프 descriptor를 추적 대상으로 등록
    #[cfg(unix)]
    pub fn watch_pipe(&mut self, fd: std::os::unix::io::RawFd) {
        use std::os::unix::fs::MetadataExt;

        match std::fs::metadata(format!("/proc/self/fd/{}", fd)) {
            Ok(meta) => self.pipes.push(meta.ino()),
            Err(e) => debug!("Cannot track pipe {}: {}", fd, e),
        }
    }

    /// 남아 있는 후손을 SIGKILL. 죽인 프로세스 수 반환
    #[cfg(target_os = "linux")]
    pub fn kill_stragglers(&self) -> usize {
        let own = std::process::id();
        let mut killed = 0;

        for _ in 0..MAX_SWEEP_ROUNDS {
            let found: Vec<u32> = list_pids()
                .into_iter()
                .filter(|&pid| pid != own && self.owns(pid))
                .collect();
            if found.is_empty() {
                break;
            }
            for pid in found {
                // SAFETY: kill only sends a signal
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGKILL);
                }
                killed += 1;
            }
        }

        if killed > 0 {
            warn!("Killed {} detached process(es) of run {}", killed, self.marker);
        }
        killed
    }

    #[cfg(not(target_os = "linux"))]
    pub fn kill_stragglers(&self) -> usize {
        0
    }

    /// 마커 또는 추적 파이프 보유 여부
    #[cfg(target_os = "linux")]
    fn owns(&self, pid: u32) -> bool {
        if is_zombie(pid) {
            return false;
        }
        if let Ok(environ) = std::fs::read(format!("/proc/{}/environ", pid)) {
            if environ_has(&environ, RUN_MARKER_VAR, &self.marker) {
                return true;
            }
        }
        !self.pipes.is_empty() && self.holds_pipe(pid)
    }

    #[cfg(target_os = "linux")]
    fn holds_pipe(&self, pid: u32) -> bool {
        let Ok(entries) = std::fs::read_dir(format!("/proc/{}/fd", pid)) else {
            return false;
        };
        entries.flatten().any(|entry| {
            std::fs::read_link(entry.path())
                .ok()
                .and_then(|target| pipe_inode(&target.to_string_lossy()))
                .is_some_and(|ino| self.pipes.contains(&ino))
        })
    }
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// NUL로 구분된 environ 블록에서 `name=value` 검색
fn environ_has(environ: &[u8], name: &str, value: &str) -> bool {
    let entry = format!("{}={}", name, value);
    environ
        .split(|&b| b == 0)
        .any(|item| item == entry.as_bytes())
}

/// `pipe:[12345]` → 12345
fn pipe_inode(link: &str) -> Option<u64> {
    link.strip_prefix("pipe:[")?.strip_suffix(']')?.parse().ok()
}

#[cfg(target_os = "linux")]
fn list_pids() -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect()
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            // state follows the parenthesised command name
            let rest = &stat[stat.rfind(')')? + 1..];
            rest.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

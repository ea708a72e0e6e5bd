//! Resource Monitor - 실행 중 프로세스 메모리 사용량 측정
//!
//! 서브프로세스 전략에서 자식 프로세스의 최대 RSS를 추적합니다.
//!
//! ## 플랫폼 지원
//! - Linux: `/proc/<pid>/status`의 `VmHWM`(최대 RSS), 없으면 `VmRSS`
//! - 그 외: 측정 불가 → 0
//!
//! 측정 실패는 실행 결과에 영향을 주지 않는다.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

/// 기본 샘플링 간격
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

/// 리소스 사용량 스냅샷
#[derive(Debug, Clone)]
pub struct ResourceSnapshot {
    /// 현재 RSS (bytes)
    pub memory_bytes: u64,

    /// 최대 RSS (bytes)
    pub peak_memory_bytes: u64,

    /// 측정 시간
    pub timestamp: Instant,
}

impl ResourceSnapshot {
    /// `/proc/<pid>/status`에서 스냅샷 읽기
    pub fn read(pid: u32) -> Option<Self> {
        let path = PathBuf::from(format!("/proc/{}/status", pid));
        let status = std::fs::read_to_string(path).ok()?;
        Self::parse(&status)
    }

    /// `/proc/<pid>/status` 내용 파싱
    pub fn parse(status: &str) -> Option<Self> {
        let rss = status_field_bytes(status, "VmRSS:");
        let hwm = status_field_bytes(status, "VmHWM:");
        if rss.is_none() && hwm.is_none() {
            return None;
        }

        let memory_bytes = rss.unwrap_or(0);
        Some(Self {
            memory_bytes,
            peak_memory_bytes: hwm.unwrap_or(memory_bytes).max(memory_bytes),
            timestamp: Instant::now(),
        })
    }
}

/// "VmRSS:	  1234 kB" 형식 필드 → bytes
fn status_field_bytes(status: &str, field: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with(field))?;
    let mut parts = line[field.len()..].split_whitespace();
    let value: u64 = parts.next()?.parse().ok()?;
    let multiplier = match parts.next() {
        Some("kB") | Some("KB") | Some("kb") => 1024,
        Some("mB") | Some("MB") => 1024 * 1024,
        _ => 1,
    };
    Some(value * multiplier)
}

/// 바이트를 사람이 읽기 좋은 형식으로 변환
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// bytes → MB (소수점 포함)
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// 프로세스 최대 메모리 샘플러
///
/// 프로세스가 살아 있는 동안 주기적으로 스냅샷을 읽고 최대값을 유지한다.
pub struct MemorySampler {
    pid: u32,
    peak: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl MemorySampler {
    /// 샘플링 시작
    pub fn start(pid: u32, interval: Duration) -> Self {
        let peak = Arc::new(AtomicU64::new(0));
        let peak_clone = Arc::clone(&peak);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match ResourceSnapshot::read(pid) {
                    Some(snapshot) => {
                        peak_clone.fetch_max(snapshot.peak_memory_bytes, Ordering::Relaxed);
                    }
                    // 프로세스 종료 또는 /proc 미지원
                    None => break,
                }
            }
        });

        Self { pid, peak, handle }
    }

    /// 샘플링 중지 후 최대 메모리 (bytes) 반환
    pub fn finish(self) -> u64 {
        self.handle.abort();
        let peak = self.peak.load(Ordering::Relaxed);
        debug!("PID {} peak memory: {}", self.pid, format_bytes(peak));
        peak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "Name:\tpython3\nVmPeak:\t   30000 kB\nVmHWM:\t    9000 kB\nVmRSS:\t    8000 kB\nThreads:\t1\n";

    #[test]
    fn test_parse_status() {
        let snapshot = ResourceSnapshot::parse(STATUS).unwrap();
        assert_eq!(snapshot.memory_bytes, 8000 * 1024);
        assert_eq!(snapshot.peak_memory_bytes, 9000 * 1024);
    }

    #[test]
    fn test_parse_status_without_memory() {
        assert!(ResourceSnapshot::parse("Name:\tkthreadd\nThreads:\t1\n").is_none());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_bytes_to_mb() {
        assert_eq!(bytes_to_mb(0), 0.0);
        assert_eq!(bytes_to_mb(3 * 1024 * 1024), 3.0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_sampler_reads_own_process() {
        let sampler = MemorySampler::start(std::process::id(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(sampler.finish() > 0);
    }

    #[tokio::test]
    async fn test_sampler_missing_process_is_zero() {
        let sampler = MemorySampler::start(u32::MAX - 1, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sampler.finish(), 0);
    }
}

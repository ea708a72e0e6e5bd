//! Limits Configuration - 실행 리소스 제한 설정
//!
//! 일회성 코드/명령 실행에 적용되는 시간, 메모리, CPU 상한.
//! 셸 세션에는 실행 시간 제한이 없다.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 리소스 제한
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// 최대 실행 시간 (초)
    #[serde(default = "default_max_execution_secs")]
    pub max_execution_secs: u64,

    /// 최대 메모리 ("512m", "1g" 형식)
    #[serde(default = "default_max_memory")]
    pub max_memory: String,

    /// 최대 CPU 개수
    #[serde(default = "default_max_cpus")]
    pub max_cpus: f64,

    /// 최대 프로세스 수 (컨테이너 전용)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids_limit: Option<i64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_execution_secs: default_max_execution_secs(),
            max_memory: default_max_memory(),
            max_cpus: default_max_cpus(),
            pids_limit: None,
        }
    }
}

impl ResourceLimits {
    /// 실행 타임아웃
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.max_execution_secs)
    }

    /// 메모리 제한 (바이트). 파싱 실패 시 None
    pub fn memory_bytes(&self) -> Option<u64> {
        parse_memory_string(&self.max_memory)
    }

    /// Docker `nano_cpus` 값
    pub fn nano_cpus(&self) -> i64 {
        (self.max_cpus * 1_000_000_000.0) as i64
    }

    // ========================================================================
    // Builder
    // ========================================================================

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.max_execution_secs = secs;
        self
    }

    pub fn with_memory(mut self, memory: impl Into<String>) -> Self {
        self.max_memory = memory.into();
        self
    }

    pub fn with_cpus(mut self, cpus: f64) -> Self {
        self.max_cpus = cpus;
        self
    }

    pub fn with_pids_limit(mut self, pids: i64) -> Self {
        self.pids_limit = Some(pids);
        self
    }

    // ========================================================================
    // Merge
    // ========================================================================

    pub(crate) fn merge(&mut self, other: ResourceLimits) {
        if other.max_execution_secs != default_max_execution_secs() {
            self.max_execution_secs = other.max_execution_secs;
        }
        if other.max_memory != default_max_memory() {
            self.max_memory = other.max_memory;
        }
        if other.max_cpus != default_max_cpus() {
            self.max_cpus = other.max_cpus;
        }
        if other.pids_limit.is_some() {
            self.pids_limit = other.pids_limit;
        }
    }
}

/// 메모리 문자열 파싱 ("512m" -> 바이트)
pub fn parse_memory_string(s: &str) -> Option<u64> {
    let s = s.trim().to_lowercase();

    if s.is_empty() {
        return None;
    }

    let (num_str, unit) = if s.ends_with("gb") || s.ends_with('g') {
        let num_part = s.trim_end_matches("gb").trim_end_matches('g');
        (num_part, 1024 * 1024 * 1024u64)
    } else if s.ends_with("mb") || s.ends_with('m') {
        let num_part = s.trim_end_matches("mb").trim_end_matches('m');
        (num_part, 1024 * 1024u64)
    } else if s.ends_with("kb") || s.ends_with('k') {
        let num_part = s.trim_end_matches("kb").trim_end_matches('k');
        (num_part, 1024u64)
    } else if s.ends_with('b') {
        (s.trim_end_matches('b'), 1u64)
    } else {
        // 숫자만 있으면 바이트로 간주
        (s.as_str(), 1u64)
    };

    num_str
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|n| *n >= 0.0)
        .map(|n| (n * unit as f64) as u64)
}

fn default_max_execution_secs() -> u64 {
    30
}

fn default_max_memory() -> String {
    "512m".to_string()
}

fn default_max_cpus() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.timeout(), Duration::from_secs(30));
        assert_eq!(limits.memory_bytes(), Some(512 * 1024 * 1024));
        assert_eq!(limits.nano_cpus(), 1_000_000_000);
        assert!(limits.pids_limit.is_none());
    }

    #[test]
    fn test_parse_memory_string() {
        assert_eq!(parse_memory_string("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_string("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_string("64kb"), Some(64 * 1024));
        assert_eq!(parse_memory_string("100"), Some(100));
        assert_eq!(parse_memory_string(""), None);
        assert_eq!(parse_memory_string("lots"), None);
    }

    #[test]
    fn test_merge_overrides_non_defaults() {
        let mut base = ResourceLimits::default();
        base.merge(ResourceLimits::default().with_timeout_secs(5).with_pids_limit(64));
        assert_eq!(base.max_execution_secs, 5);
        assert_eq!(base.max_memory, "512m");
        assert_eq!(base.pids_limit, Some(64));
    }

    #[test]
    fn test_deserialize_partial() {
        let limits: ResourceLimits = serde_json::from_str(r#"{"maxMemory": "256m"}"#).unwrap();
        assert_eq!(limits.max_memory, "256m");
        assert_eq!(limits.max_execution_secs, 30);
    }
}

//! Security Policy - 코드/명령어 실행 전 검증
//!
//! 일회성 실행에 앞서 사용자 코드와 터미널 명령어를 검사합니다.
//!
//! ## 한계
//! 이 정책은 문자열 포함 여부만 보는 표면적 denylist이며 보안 경계가 아닙니다.
//! `"im" + "port os"` 같은 문자열 조합이나 `getattr` 우회는 탐지하지 못합니다.
//! 실제 격리는 컨테이너 런타임(네트워크 차단, 읽기 전용 마운트, 비루트 사용자)이 담당합니다.
//!
//! ## 사용 예시
//! ```rust,ignore
//! let policy = SecurityPolicy::default();
//!
//! match policy.validate_command("ls -la") {
//!     PolicyResult::Allow => { /* execute */ }
//!     PolicyResult::Deny(reason) => { /* report */ }
//! }
//! ```

use terminus_foundation::{Error, Result};
use tracing::warn;

/// 명령어 거부 메시지
pub const COMMAND_DENIED: &str = "Command not allowed for security reasons";

/// 정책 검증 결과
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyResult {
    /// 허용
    Allow,
    /// 거부 (이유 포함)
    Deny(String),
}

impl PolicyResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyResult::Allow)
    }

    /// 거부 사유
    pub fn reason(&self) -> Option<&str> {
        match self {
            PolicyResult::Allow => None,
            PolicyResult::Deny(reason) => Some(reason),
        }
    }

    /// `Error::Validation`으로 변환
    pub fn into_result(self) -> Result<()> {
        match self {
            PolicyResult::Allow => Ok(()),
            PolicyResult::Deny(reason) => Err(Error::Validation(reason)),
        }
    }
}

/// 실행 보안 정책 (프로세스 전역, 초기화 후 읽기 전용)
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    /// 차단할 import 모듈 (`import X` / `from X`)
    blocked_imports: Vec<String>,
    /// 차단할 함수 호출 패턴 (`eval(` 등)
    blocked_calls: Vec<String>,
    /// 명령어에 포함되면 거부할 문자열
    denied_patterns: Vec<String>,
    /// 허용 명령어 접두사 (화이트리스트)
    allowed_prefixes: Vec<String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            blocked_imports: Self::default_blocked_imports(),
            blocked_calls: Self::default_blocked_calls(),
            denied_patterns: Self::default_denied_patterns(),
            allowed_prefixes: Self::default_allowed_prefixes(),
        }
    }
}

impl SecurityPolicy {
    /// 새 정책 생성 (기본값)
    pub fn new() -> Self {
        Self::default()
    }

    /// 기본 차단 모듈
    fn default_blocked_imports() -> Vec<String> {
        [
            // 시스템/프로세스 접근
            "os",
            "subprocess",
            "sys",
            // 네트워크
            "socket",
            "urllib",
            "requests",
            "http",
            "ftplib",
            "smtplib",
            "telnetlib",
            "webbrowser",
            // 동적 실행
            "__import__",
            "eval",
            "exec",
            "compile",
            "globals",
            "locals",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// 기본 차단 호출
    fn default_blocked_calls() -> Vec<String> {
        [
            "open(",
            "file(",
            "__import__(",
            "eval(",
            "exec(",
            "compile(",
            "globals(",
            "locals(",
            "vars(",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// 기본 차단 명령어 패턴 (소문자 비교)
    fn default_denied_patterns() -> Vec<String> {
        [
            // 시스템 파괴 명령어
            "rm -rf /",
            "rm -rf /*",
            ":(){ :|:& };:", // Fork bomb
            "dd if=",
            "mkfs",
            "fdisk",
            "mount",
            "umount",
            // 권한 상승 / 계정 조작
            "sudo",
            "su",
            "passwd",
            "useradd",
            "userdel",
            "chmod 777",
            // 네트워크
            "wget",
            "curl http",
            "nc ",
            "netcat",
            "ssh",
            // 리다이렉트 / 체이닝
            ">/dev/",
            "2>/dev/",
            "&>",
            "||",
            "&&",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// 기본 허용 명령어 접두사
    fn default_allowed_prefixes() -> Vec<String> {
        [
            // 파일 탐색
            "ls", "cat", "head", "tail", "grep", "find", "wc", "sort", "uniq", "tree", "file",
            "less", "more", "basename", "dirname", "pwd", "cd",
            // 파일 조작
            "mkdir", "touch", "cp", "mv",
            // 언어 도구
            "python", "python3", "pip", "pip3", "pip install", "npm", "node", "git", "make",
            "cmake", "gcc", "g++", "javac", "java",
            // 셸 유틸리티
            "echo", "which", "env", "export", "alias", "history", "clear", "help", "man",
            "whoami", "date", "uptime", "df", "du", "free", "ps", "top",
            // 에디터
            "nano", "vim", "emacs",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    // ========================================================================
    // Builder
    // ========================================================================

    /// 차단 모듈 추가
    pub fn deny_imports(mut self, modules: Vec<&str>) -> Self {
        self.blocked_imports
            .extend(modules.into_iter().map(String::from));
        self
    }

    /// 차단 호출 패턴 추가
    pub fn deny_calls(mut self, calls: Vec<&str>) -> Self {
        self.blocked_calls.extend(calls.into_iter().map(String::from));
        self
    }

    /// 차단 명령어 패턴 추가
    pub fn deny_commands(mut self, patterns: Vec<&str>) -> Self {
        self.denied_patterns
            .extend(patterns.into_iter().map(|p| p.to_lowercase()));
        self
    }

    /// 허용 접두사 추가
    pub fn allow_commands(mut self, prefixes: Vec<&str>) -> Self {
        self.allowed_prefixes
            .extend(prefixes.into_iter().map(|p| p.to_lowercase()));
        self
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// 코드 검증
    pub fn validate_code(&self, code: &str) -> PolicyResult {
        // 1. 차단 import 검사
        for module in &self.blocked_imports {
            if code.contains(&format!("import {}", module))
                || code.contains(&format!("from {}", module))
            {
                warn!("Code blocked by policy: import '{}'", module);
                return PolicyResult::Deny(format!(
                    "Import '{}' is not allowed for security reasons",
                    module
                ));
            }
        }

        // 2. 차단 호출 검사
        for call in &self.blocked_calls {
            if code.contains(call.as_str()) {
                let name = call.trim_end_matches('(');
                warn!("Code blocked by policy: call '{}'", name);
                return PolicyResult::Deny(format!(
                    "Function call '{}' is not allowed for security reasons",
                    name
                ));
            }
        }

        PolicyResult::Allow
    }

    /// 명령어 검증
    ///
    /// 차단 패턴이 하나라도 포함되면 거부하고, 그 외에는 허용 접두사로 시작하는
    /// 명령어만 허용한다 (기본 거부).
    pub fn validate_command(&self, command: &str) -> PolicyResult {
        let command_lower = command.trim().to_lowercase();

        // 1. 명시적 차단 패턴 검사
        for denied in &self.denied_patterns {
            if command_lower.contains(denied.as_str()) {
                warn!(
                    "Command blocked by policy: '{}' matches denied pattern '{}'",
                    command.trim(),
                    denied
                );
                return PolicyResult::Deny(COMMAND_DENIED.to_string());
            }
        }

        // 2. 화이트리스트 검사
        if self
            .allowed_prefixes
            .iter()
            .any(|prefix| command_lower.starts_with(prefix.as_str()))
        {
            return PolicyResult::Allow;
        }

        // 3. 기본 거부
        warn!(
            "Command blocked by policy: '{}' is not allowlisted",
            command.trim()
        );
        PolicyResult::Deny(COMMAND_DENIED.to_string())
    }
}

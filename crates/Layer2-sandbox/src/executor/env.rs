//! Sandbox environment construction
//!
//! Host environment variables are filtered by name before they reach sandboxed
//! processes:
//! - Blocked patterns (e.g., `AWS_*`, `*_TOKEN`) are removed
//! - Allowed patterns take precedence over blocked patterns
//!
//! The filtered set is then overlaid with a fixed sandbox baseline (PATH, HOME,
//! locale, identity) so programs never see the server's own values.

use std::collections::HashMap;
use std::path::Path;

/// Fixed PATH for sandboxed processes
pub const SANDBOX_PATH: &str = "/usr/local/bin:/usr/local/sbin:/usr/bin:/usr/sbin:/bin:/sbin";

/// Environment security configuration
///
/// Controls which host environment variables are visible to user code and
/// interactive shells.
#[derive(Debug, Clone)]
pub struct EnvSecurityConfig {
    /// Patterns to block (e.g., "AWS_*", "*_TOKEN")
    pub blocked_patterns: Vec<String>,

    /// Patterns to allow (takes precedence over blocked)
    pub allowed_patterns: Vec<String>,
}

impl Default for EnvSecurityConfig {
    fn default() -> Self {
        Self {
            blocked_patterns: [
                // Cloud credentials
                "AWS_*",
                "AZURE_*",
                "GCP_*",
                "GOOGLE_*",
                // Generic secrets
                "*_SECRET",
                "*_SECRET_*",
                "*_TOKEN",
                "*_TOKEN_*",
                "*_KEY",
                "*_API_KEY",
                "*_APIKEY",
                "*_PASSWORD",
                "*_PASS",
                "*_AUTH",
                "*_PRIVATE_*",
                "*_CREDENTIALS",
                // Server configuration
                "SECRET_KEY",
                "JWT_*",
                "DATABASE_URL",
                "DATABASE_PASSWORD",
                "POSTGRES_*",
                "MONGODB_URI",
                "REDIS_URL",
                "REDIS_PASSWORD",
                // SSH/GPG
                "SSH_*",
                "GPG_*",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            allowed_patterns: [
                // System essentials
                "TERM",
                "LANG",
                "LC_*",
                "TZ",
                "COLORTERM",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl EnvSecurityConfig {
    /// Check if an environment variable should be blocked
    pub fn is_blocked(&self, name: &str) -> bool {
        // Check allowed patterns first (they take precedence)
        if self
            .allowed_patterns
            .iter()
            .any(|pattern| pattern_matches(pattern, name))
        {
            return false;
        }

        self.blocked_patterns
            .iter()
            .any(|pattern| pattern_matches(pattern, name))
    }

    /// Filter environment variables, removing blocked ones
    pub fn filter_env(&self, env: &HashMap<String, String>) -> HashMap<String, String> {
        env.iter()
            .filter(|(k, _)| !self.is_blocked(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Add blocked patterns
    pub fn block_patterns(mut self, patterns: Vec<String>) -> Self {
        self.blocked_patterns.extend(patterns);
        self
    }

    /// Add allowed patterns
    pub fn allow_patterns(mut self, patterns: Vec<String>) -> Self {
        self.allowed_patterns.extend(patterns);
        self
    }
}

/// Identity presented to sandboxed processes
#[derive(Debug, Clone)]
pub struct SandboxIdentity<'a> {
    pub home: &'a Path,
    pub user: &'a str,
    pub hostname: &'a str,
}

/// Filtered host environment overlaid with the sandbox baseline
pub fn sandbox_env(security: &EnvSecurityConfig, identity: &SandboxIdentity<'_>) -> HashMap<String, String> {
    let host: HashMap<String, String> = std::env::vars().collect();
    let mut env = security.filter_env(&host);

    let home = identity.home.to_string_lossy().to_string();
    env.insert("TERM".to_string(), "xterm-256color".to_string());
    env.insert("HOME".to_string(), home.clone());
    env.insert("PWD".to_string(), home.clone());
    env.insert("PATH".to_string(), SANDBOX_PATH.to_string());
    env.insert("PYTHONPATH".to_string(), home);
    env.insert("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string());
    env.insert("USER".to_string(), identity.user.to_string());
    env.insert("LOGNAME".to_string(), identity.user.to_string());
    env.insert("HOSTNAME".to_string(), identity.hostname.to_string());
    env.insert("LANG".to_string(), "C.UTF-8".to_string());
    env.insert("LC_ALL".to_string(), "C.UTF-8".to_string());
    env
}

/// Check if a pattern matches a string (simple glob-like matching)
fn pattern_matches(pattern: &str, s: &str) -> bool {
    if pattern.len() > 1 && pattern.starts_with('*') && pattern.ends_with('*') {
        let middle = &pattern[1..pattern.len() - 1];
        s.contains(middle)
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        s.ends_with(suffix)
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        s.starts_with(prefix)
    } else {
        s == pattern
    }
}

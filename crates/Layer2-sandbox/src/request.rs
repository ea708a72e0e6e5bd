//! Execution request types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier of a collaborative IDE session
pub type SessionId = i64;

/// Identifier of an authenticated user
pub type UserId = i64;

/// Snapshot of a session's files: relative path -> text content
pub type FileSet = BTreeMap<String, String>;

/// Language of a code execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
}

impl Language {
    /// Parse a language name as sent by the editor
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Some(Language::Python),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to execute
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    /// Source code written to the entrypoint file
    Code {
        /// Raw language name; unknown names fail validation
        language: String,
        code: String,
    },

    /// Shell command run through `bash -c`
    Command {
        command: String,
        /// Working directory, `/workspace`-relative or relative to it
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
}

/// A single one-shot execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub source: Source,

    /// Session whose files are materialized
    pub session_id: SessionId,

    /// Files materialized into the workspace before execution
    #[serde(default)]
    pub files: FileSet,

    /// Data piped to the program's stdin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

impl ExecutionRequest {
    /// Create a Python code execution request
    pub fn code(session_id: SessionId, code: impl Into<String>) -> Self {
        Self {
            source: Source::Code {
                language: Language::Python.as_str().to_string(),
                code: code.into(),
            },
            session_id,
            files: FileSet::new(),
            stdin: None,
        }
    }

    /// Create a shell command request
    pub fn command(session_id: SessionId, command: impl Into<String>) -> Self {
        Self {
            source: Source::Command {
                command: command.into(),
                cwd: None,
            },
            session_id,
            files: FileSet::new(),
            stdin: None,
        }
    }

    /// Override the language of a code request
    pub fn with_language(mut self, name: impl Into<String>) -> Self {
        if let Source::Code { language, .. } = &mut self.source {
            *language = name.into();
        }
        self
    }

    /// Set the working directory of a command request
    pub fn with_cwd(mut self, dir: impl Into<String>) -> Self {
        if let Source::Command { cwd, .. } = &mut self.source {
            *cwd = Some(dir.into());
        }
        self
    }

    pub fn with_files(mut self, files: FileSet) -> Self {
        self.files = files;
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

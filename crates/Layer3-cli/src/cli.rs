//! Non-interactive commands and the shell relay

use anyhow::{bail, Context};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use terminus_foundation::{Error, SandboxConfig};
use terminus_sandbox::{
    diff_directory, CodeExecutor, ExecutionResult, FailureKind, FileSet, SessionId,
    ShellOutput, ShellSessionManager, UserId,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// Read every UTF-8 file under `dir` into a file set
pub fn load_files(dir: Option<&Path>) -> anyhow::Result<FileSet> {
    let Some(dir) = dir else {
        return Ok(FileSet::new());
    };
    if !dir.is_dir() {
        bail!("Not a directory: {}", dir.display());
    }
    Ok(diff_directory(dir, &FileSet::new()))
}

/// Run Python code once
pub async fn run_code(
    config: SandboxConfig,
    code: &str,
    session_id: SessionId,
    files: &FileSet,
    stdin: Option<&str>,
) -> anyhow::Result<ExecutionResult> {
    let executor = CodeExecutor::from_config(config)
        .await
        .context("No execution runtime available")?;
    Ok(executor.execute_code(code, session_id, files, stdin).await)
}

/// Run a shell command once
pub async fn run_command(
    config: SandboxConfig,
    command: &str,
    session_id: SessionId,
    files: &FileSet,
    cwd: Option<&str>,
) -> anyhow::Result<ExecutionResult> {
    let executor = CodeExecutor::from_config(config)
        .await
        .context("No execution runtime available")?;
    Ok(executor
        .execute_command(command, session_id, files, cwd, None)
        .await)
}

/// Print a result as JSON or as a transcript followed by a status line
pub fn print_result(result: &ExecutionResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    if let Some(stdout) = result.stdout.as_deref().filter(|s| !s.is_empty()) {
        println!("{}", stdout.trim_end_matches('\n'));
    }
    if let Some(stderr) = result.stderr.as_deref().filter(|s| !s.is_empty()) {
        eprintln!("{}", stderr.trim_end_matches('\n'));
    }

    // runtime errors already reached the user through stderr
    if result.failure_kind() != Some(FailureKind::Runtime) {
        if let Some(error) = result.error() {
            eprintln!("Error: {}", error);
        }
    }

    for path in result.file_deltas.keys() {
        eprintln!("changed: {}", path);
    }

    eprintln!(
        "[{} in {} ms, {:.1} MB]",
        result.status().display_name(),
        result.elapsed_ms,
        result.memory_mb
    );
    Ok(())
}

/// Relay stdin lines to a persistent shell and its output to stdout
///
/// Ends when the shell exits, stdin reaches EOF or Ctrl-C is pressed.
pub async fn run_shell(
    config: SandboxConfig,
    session_id: SessionId,
    user_id: UserId,
    username: &str,
) -> anyhow::Result<()> {
    let manager = Arc::new(ShellSessionManager::new(config));
    let (tx, mut rx) = mpsc::channel(100);

    let session = match manager
        .create_session(session_id, user_id, username, tx)
        .await
    {
        Ok(session) => session,
        Err(e) => {
            let error = Error::from(e);
            if error.is_user_facing() {
                bail!("{}", error);
            }
            return Err(anyhow::Error::new(error).context("Cannot open shell"));
        }
    };
    tracing::info!(
        "Shell {} opened in {}",
        session.shell_id(),
        session.working_dir().display()
    );

    let mut printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(output) = rx.recv().await {
            match output {
                ShellOutput::Data(text) => {
                    if stdout.write_all(text.as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                }
                ShellOutput::Closed => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let closed = loop {
        tokio::select! {
            _ = &mut printer => break true,
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !manager.write_input(user_id, format!("{}\n", line)).await {
                        break false;
                    }
                }
                None => break false,
            },
            _ = tokio::signal::ctrl_c() => break false,
        }
    };

    manager.stop_all_sessions().await;
    if !closed {
        let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    }
    println!();
    Ok(())
}

//! Subprocess runner - runs programs directly on the host
//!
//! Fallback when no container runtime is reachable:
//! - Scrubbed environment (blocked host variables removed, sandbox baseline on top)
//! - Own process group so the whole tree dies on timeout
//! - One deadline for the wait and the output collection; descendants that
//!   left the group are swept by `RunTracker`
//! - Peak memory sampled from `/proc` while the child runs
//!
//! No filesystem, network or memory isolation is applied beyond the timeout.

use super::env::{sandbox_env, EnvSecurityConfig, SandboxIdentity};
use super::reaper::RunTracker;
use super::resource_monitor::{MemorySampler, DEFAULT_SAMPLE_INTERVAL};
use super::{Invocation, ProcessRunner, RunOutput, RunSpec};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use terminus_foundation::{Error, Result, SandboxConfig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Subprocess runner configuration
#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    /// Interpreter for script invocations
    pub python_bin: String,

    /// Shell for command invocations
    pub shell: String,

    /// `USER` presented to the program
    pub user: String,

    /// `HOSTNAME` presented to the program
    pub hostname: String,

    /// Host environment filtering
    pub env_security: EnvSecurityConfig,

    /// Memory sampling interval
    pub sample_interval: Duration,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            python_bin: "python3".to_string(),
            shell: "bash".to_string(),
            user: "terminus".to_string(),
            hostname: "terminuside".to_string(),
            env_security: EnvSecurityConfig::default(),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }
}

impl SubprocessConfig {
    /// Derive from the sandbox configuration
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            python_bin: config.runtime.python_bin.clone(),
            hostname: config.runtime.hostname.clone(),
            ..Default::default()
        }
    }
}

/// Runner that spawns programs as host subprocesses
pub struct SubprocessRunner {
    config: SubprocessConfig,
}

impl SubprocessRunner {
    pub fn new() -> Self {
        Self::with_config(SubprocessConfig::default())
    }

    pub fn with_config(config: SubprocessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SubprocessConfig {
        &self.config
    }

    /// Program and arguments for an invocation
    fn program(&self, invocation: &Invocation) -> (String, Vec<String>) {
        match invocation {
            Invocation::Script { entrypoint } => {
                (self.config.python_bin.clone(), vec![entrypoint.clone()])
            }
            Invocation::Shell { command } => (
                self.config.shell.clone(),
                vec![
                    "--noprofile".to_string(),
                    "--norc".to_string(),
                    "-c".to_string(),
                    command.clone(),
                ],
            ),
        }
    }

    fn build_command(&self, spec: &RunSpec, tracker: &RunTracker) -> Command {
        let (program, args) = self.program(&spec.invocation);

        let identity = SandboxIdentity {
            home: &spec.workspace,
            user: &self.config.user,
            hostname: &self.config.hostname,
        };
        let mut env = sandbox_env(&self.config.env_security, &identity);
        env.extend(spec.env.clone());
        let (marker, run_id) = tracker.env();
        env.insert(marker, run_id);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(spec.host_cwd())
            .env_clear()
            .envs(env)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}

impl Default for SubprocessRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Collect a pipe into a lossy UTF-8 string
fn spawn_reader<R>(pipe: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut buf).await {
                debug!("Output pipe closed early: {}", e);
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    })
}

/// Kill the child's whole process group
///
/// Takes the pid captured at spawn; `Child::id` is gone once the child is reaped.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: killpg only sends a signal; the group was created by process_group(0)
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[async_trait]
impl ProcessRunner for SubprocessRunner {
    async fn run(&self, spec: &RunSpec) -> Result<RunOutput> {
        let mut tracker = RunTracker::new();
        let mut cmd = self.build_command(spec, &tracker);

        debug!(
            "Spawning subprocess in {}: {:?}",
            spec.host_cwd().display(),
            spec.invocation
        );

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + spec.timeout;
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Launch(format!("Failed to spawn process: {}", e)))?;

        let pid = child.id();
        let sampler = pid.map(|pid| MemorySampler::start(pid, self.config.sample_interval));

        // Feed stdin then close it so the program sees EOF
        if let (Some(mut stdin), Some(input)) = (child.stdin.take(), spec.stdin.clone()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!("Failed to write stdin: {}", e);
                }
                let _ = stdin.shutdown().await;
            });
        }

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            if let Some(fd) = child.stdout.as_ref().map(|pipe| pipe.as_raw_fd()) {
                tracker.watch_pipe(fd);
            }
            if let Some(fd) = child.stderr.as_ref().map(|pipe| pipe.as_raw_fd()) {
                tracker.watch_pipe(fd);
            }
        }

        let mut stdout_handle = spawn_reader(child.stdout.take());
        let mut stderr_handle = spawn_reader(child.stderr.take());

        // The ceiling covers the exit and the pipes reaching EOF; a detached
        // descendant holding a pipe counts as still running
        let finished = tokio::time::timeout_at(deadline, async {
            let status = child.wait().await;
            // background stragglers in the group would keep the pipes open
            kill_process_group(pid);
            let stdout = (&mut stdout_handle).await.unwrap_or_default();
            let stderr = (&mut stderr_handle).await.unwrap_or_default();
            (status, stdout, stderr)
        })
        .await;
        let elapsed = started.elapsed();

        let (status, stdout, stderr) = match finished {
            Ok(finished) => finished,
            Err(_) => {
                warn!(
                    "Subprocess exceeded {}s, killing process group",
                    spec.timeout.as_secs()
                );
                kill_process_group(pid);
                let _ = child.kill().await;
                tracker.kill_stragglers();
                stdout_handle.abort();
                stderr_handle.abort();
                let memory = sampler.map(MemorySampler::finish).unwrap_or(0);
                return Ok(RunOutput::timed_out(elapsed, memory));
            }
        };

        // daemons that closed their pipes
        tracker.kill_stragglers();
        let memory = sampler.map(MemorySampler::finish).unwrap_or(0);
        let status = status.map_err(|e| Error::Runtime(format!("Process error: {}", e)))?;

        Ok(RunOutput {
            stdout,
            stderr,
            exit_code: exit_code_of(status),
            elapsed,
            memory_bytes: memory,
            timed_out: false,
        })
    }

    fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "subprocess"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bash_available() -> bool {
        which::which("bash").is_ok()
    }

    fn shell_spec(dir: &TempDir, command: &str, timeout: Duration) -> RunSpec {
        RunSpec::shell(dir.path(), command, timeout)
    }

    #[tokio::test]
    async fn test_runner_info() {
        let runner = SubprocessRunner::new();
        assert!(runner.is_available());
        assert_eq!(runner.name(), "subprocess");
    }

    #[tokio::test]
    async fn test_captures_streams_and_exit_code() {
        if !bash_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let runner = SubprocessRunner::new();

        let output = runner
            .run(&shell_spec(
                &dir,
                "echo out; echo err 1>&2; exit 3",
                Duration::from_secs(5),
            ))
            .await
            .unwrap();

        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code, 3);
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn test_stdin_is_delivered() {
        if !bash_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let runner = SubprocessRunner::new();

        let spec = shell_spec(&dir, "cat", Duration::from_secs(5))
            .with_stdin(Some("hello stdin".to_string()));
        let output = runner.run(&spec).await.unwrap();
        assert_eq!(output.stdout, "hello stdin");
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        if !bash_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let runner = SubprocessRunner::new();

        let started = Instant::now();
        let output = runner
            .run(&shell_spec(&dir, "sleep 30", Duration::from_millis(300)))
            .await
            .unwrap();

        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_environment_is_scrubbed() {
        if !bash_available() {
            return;
        }
        std::env::set_var("TERMINUS_TEST_API_KEY", "leak");
        let dir = TempDir::new().unwrap();
        let runner = SubprocessRunner::new();

        let output = runner
            .run(&shell_spec(
                &dir,
                "echo \"[$TERMINUS_TEST_API_KEY] $HOME\"",
                Duration::from_secs(5),
            ))
            .await
            .unwrap();

        assert_eq!(
            output.stdout.trim(),
            format!("[] {}", dir.path().display())
        );
    }

    #[tokio::test]
    async fn test_cwd_inside_workspace() {
        if !bash_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let runner = SubprocessRunner::new();

        let spec = shell_spec(&dir, "basename \"$(pwd)\"", Duration::from_secs(5))
            .with_cwd(Some("/workspace/sub".to_string()));
        let output = runner.run(&spec).await.unwrap();
        assert_eq!(output.stdout.trim(), "sub");
    }

    /// Alive and not a zombie
    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|stat| {
                let rest = &stat[stat.rfind(')')? + 1..];
                rest.split_whitespace().next().map(|state| state != "Z")
            })
            .unwrap_or(false)
    }

    #[cfg(target_os = "linux")]
    async fn wait_gone(pid: u32) -> bool {
        for _ in 0..40 {
            if !process_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    fn read_pid(dir: &TempDir) -> u32 {
        std::fs::read_to_string(dir.path().join("pid.txt"))
            .unwrap()
            .trim()
            .parse()
            .unwrap()
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_detached_descendant_hits_ceiling() {
        if !bash_available() || which::which("setsid").is_err() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let runner = SubprocessRunner::new();

        // the detached sleep leaves the group but keeps stdout open
        let started = Instant::now();
        let output = runner
            .run(&shell_spec(
                &dir,
                "setsid sleep 30 & echo $! > pid.txt; echo parent done",
                Duration::from_secs(1),
            ))
            .await
            .unwrap();

        assert!(output.timed_out, "expected timeout, got {:?}", output);
        assert!(started.elapsed() < Duration::from_secs(4));

        let pid = read_pid(&dir);
        assert!(wait_gone(pid).await, "detached process {} survived", pid);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_detached_daemon_is_swept() {
        if !bash_available() || which::which("setsid").is_err() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let runner = SubprocessRunner::new();

        let output = runner
            .run(&shell_spec(
                &dir,
                "setsid sleep 30 >/dev/null 2>&1 </dev/null & echo $! > pid.txt",
                Duration::from_secs(5),
            ))
            .await
            .unwrap();

        assert!(!output.timed_out);
        assert_eq!(output.exit_code, 0);

        let pid = read_pid(&dir);
        assert!(wait_gone(pid).await, "daemon {} survived the run", pid);
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_launch_error() {
        let dir = TempDir::new().unwrap();
        let runner = SubprocessRunner::with_config(SubprocessConfig {
            python_bin: "/nonexistent/python".to_string(),
            ..Default::default()
        });

        let spec = RunSpec::script(dir.path(), "main.py", Duration::from_secs(5));
        assert!(matches!(runner.run(&spec).await, Err(Error::Launch(_))));
    }
}

//! Persistent shell session
//!
//! One long-lived interactive shell on a pseudo-terminal, bound to a
//! (session, user) pair.
//!
//! - The shell runs in its own process group (the pty child is a session leader)
//! - A dedicated reader thread polls its own descriptor of the pty master and
//!   hands chunks to a forwarding task, which decodes them and delivers them in
//!   read order to the currently attached subscriber
//! - Input goes through a writer thread, so a shell that stops reading never
//!   blocks the caller
//! - `stop` sends SIGTERM to the group, polls for exit, escalates to SIGKILL,
//!   closes every master descriptor and sends `Closed`; it is idempotent
//!
//! The working directory is derived from the session id and survives the shell,
//! so a reconnecting user resumes in the same files.

use crate::executor::{sandbox_env, EnvSecurityConfig, SandboxIdentity};
use crate::request::{SessionId, UserId};
use crate::shell::state::ShellState;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use terminus_foundation::{Error, Result, SandboxConfig, ShellSettings};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the reader → forwarder channel
const READER_CHANNEL_CAPACITY: usize = 100;

/// How long the reader waits for data before rechecking the stop flag
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound for draining buffered output during `stop`
const FORWARDER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Message delivered to a session subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellOutput {
    /// Raw text fragment, not line-delimited, may contain ANSI sequences
    Data(String),

    /// The shell is gone; no further output follows
    Closed,
}

/// Subscriber end for shell output
pub type OutputSink = mpsc::Sender<ShellOutput>;

/// Pty resources owned while the shell is alive
struct PtyHandles {
    master: Box<dyn MasterPty + Send>,
    input: mpsc::UnboundedSender<Vec<u8>>,
    child: Box<dyn Child + Send + Sync>,
}

/// A persistent pty-backed shell
pub struct ShellSession {
    session_id: SessionId,
    user_id: UserId,
    username: String,
    shell_id: Uuid,
    working_dir: PathBuf,
    hostname: String,
    settings: ShellSettings,
    env_security: EnvSecurityConfig,

    state: Mutex<ShellState>,
    pty: Mutex<Option<PtyHandles>>,
    size: Mutex<(u16, u16)>,
    sink: Mutex<Option<OutputSink>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    reader_stop: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl ShellSession {
    pub fn new(
        session_id: SessionId,
        user_id: UserId,
        username: impl Into<String>,
        config: &SandboxConfig,
    ) -> Self {
        Self {
            session_id,
            user_id,
            username: username.into(),
            shell_id: Uuid::new_v4(),
            working_dir: config.workspace.shell_dir(session_id),
            hostname: config.runtime.hostname.clone(),
            size: Mutex::new((config.shell.cols, config.shell.rows)),
            settings: config.shell.clone(),
            env_security: EnvSecurityConfig::default(),
            state: Mutex::new(ShellState::Created),
            pty: Mutex::new(None),
            sink: Mutex::new(None),
            forwarder: Mutex::new(None),
            reader_stop: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn shell_id(&self) -> Uuid {
        self.shell_id
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn state(&self) -> ShellState {
        *self.state.lock()
    }

    /// Running state and a child that has not exited
    pub fn is_running(&self) -> bool {
        if !self.state().is_running() {
            return false;
        }
        match self.pty.lock().as_mut() {
            Some(handles) => matches!(handles.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Pid of the shell (also its process group id)
    pub fn pid(&self) -> Option<u32> {
        self.pty
            .lock()
            .as_ref()
            .and_then(|handles| handles.child.process_id())
    }

    /// Current terminal size as (cols, rows)
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the shell and start streaming its output to `sink`
    ///
    /// Returns once the startup delay has passed and the shell is still alive.
    pub async fn start(self: &Arc<Self>, sink: OutputSink) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != ShellState::Created {
                return Err(Error::Pty(format!(
                    "Shell for session {} was already started",
                    self.session_id
                )));
            }
            *state = ShellState::Starting;
        }

        let reader = match self.spawn_shell().await {
            Ok(reader) => reader,
            Err(e) => {
                error!("Failed to start shell for session {}: {}", self.session_id, e);
                *self.state.lock() = ShellState::Stopped;
                return Err(e);
            }
        };

        *self.sink.lock() = Some(sink);

        let (tx, rx) = mpsc::channel::<Vec<u8>>(READER_CHANNEL_CAPACITY);
        let chunk_size = self.settings.read_chunk.max(1);
        let stop = Arc::clone(&self.reader_stop);
        let spawned = std::thread::Builder::new()
            .name(format!("pty-reader-{}", self.session_id))
            .spawn(move || read_loop(reader, stop, tx, chunk_size));
        if let Err(e) = spawned {
            self.stop().await;
            return Err(Error::Pty(format!("Failed to spawn reader thread: {}", e)));
        }

        *self.forwarder.lock() = Some(tokio::spawn(forward_output(Arc::clone(self), rx)));

        tokio::time::sleep(self.settings.startup_delay()).await;

        let mut state = self.state.lock();
        if *state == ShellState::Starting {
            *state = ShellState::Running;
            info!(
                "Shell {} running for user {} in session {}",
                self.shell_id, self.username, self.session_id
            );
            Ok(())
        } else {
            Err(Error::Pty("Shell exited during startup".to_string()))
        }
    }

    /// Terminate the shell, close the pty and notify the subscriber.
    /// A no-op once stopping or stopped
    pub async fn stop(&self) {
        if !self.halt().await {
            return;
        }

        // flush what the reader already handed over, then close the stream
        let forwarder = self.forwarder.lock().take();
        if let Some(forwarder) = forwarder {
            if tokio::time::timeout(FORWARDER_JOIN_TIMEOUT, forwarder).await.is_err() {
                debug!("Forwarder of shell {} did not finish in time", self.shell_id);
            }
        }
        self.close_stream().await;
    }

    /// Kill the process group and release the pty. False when there was nothing to do
    async fn halt(&self) -> bool {
        {
            let mut state = self.state.lock();
            match *state {
                ShellState::Starting | ShellState::Running => *state = ShellState::Stopping,
                ShellState::Created => {
                    *state = ShellState::Stopped;
                    return false;
                }
                ShellState::Stopping | ShellState::Stopped => return false,
            }
        }

        let handles = self.pty.lock().take();
        if let Some(mut handles) = handles {
            self.terminate(&mut handles.child).await;
            // master and writer thread go with the handles; the reader closes its own copy
            drop(handles);
        }
        self.reader_stop.store(true, Ordering::Release);

        *self.state.lock() = ShellState::Stopped;
        info!("Shell {} for session {} stopped", self.shell_id, self.session_id);
        true
    }

    /// Send `Closed` once
    async fn close_stream(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.deliver(ShellOutput::Closed).await;
        }
    }

    /// Replace the output subscriber, returning the previous one
    pub fn attach(&self, sink: OutputSink) -> Option<OutputSink> {
        debug!("Subscriber attached to shell {}", self.shell_id);
        self.sink.lock().replace(sink)
    }

    /// Drop the output subscriber; output is discarded until the next `attach`
    pub fn detach(&self) -> Option<OutputSink> {
        self.sink.lock().take()
    }

    // ========================================================================
    // I/O
    // ========================================================================

    /// Queue raw input for the shell. False when not running or the writer is gone
    pub fn write_input(&self, data: impl AsRef<[u8]>) -> bool {
        if !self.state().is_running() {
            return false;
        }

        let pty = self.pty.lock();
        let Some(handles) = pty.as_ref() else {
            return false;
        };

        if handles.input.send(data.as_ref().to_vec()).is_err() {
            warn!("Writer of shell {} is gone", self.shell_id);
            return false;
        }
        true
    }

    /// Resize the terminal. False when not running or on ioctl failure
    pub fn resize(&self, cols: u16, rows: u16) -> bool {
        if !self.state().is_running() {
            return false;
        }

        let pty = self.pty.lock();
        let Some(handles) = pty.as_ref() else {
            return false;
        };

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        match handles.master.resize(size) {
            Ok(()) => {
                *self.size.lock() = (cols, rows);
                true
            }
            Err(e) => {
                debug!("Failed to resize shell {}: {}", self.shell_id, e);
                false
            }
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Prepare the working directory, open the pty and spawn the shell
    async fn spawn_shell(&self) -> Result<PtyReader> {
        self.prepare_working_dir().await?;

        let (cols, rows) = self.size();
        let pty = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::Pty(format!("Failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(&self.settings.program);
        cmd.cwd(&self.working_dir);
        cmd.env_clear();
        for (key, value) in self.build_env() {
            cmd.env(key, value);
        }

        info!(
            "Spawning shell for user {} in session {}: {}",
            self.username, self.session_id, self.settings.program
        );

        let mut child = pty
            .slave
            .spawn_command(cmd)
            .map_err(|e| Error::Pty(format!("Failed to spawn shell: {}", e)))?;

        // The child holds the slave; our copy would keep the reader from seeing EOF
        drop(pty.slave);

        let io = open_reader(pty.master.as_ref()).and_then(|reader| {
            let writer = pty
                .master
                .take_writer()
                .map_err(|e| Error::Pty(format!("Failed to take PTY writer: {}", e)))?;
            let input = spawn_writer(writer, self.session_id)?;
            Ok((reader, input))
        });
        let (reader, input) = match io {
            Ok(io) => io,
            Err(e) => {
                signal_group(child.process_id(), Signal::Kill);
                let _ = child.kill();
                return Err(e);
            }
        };

        *self.pty.lock() = Some(PtyHandles {
            master: pty.master,
            input,
            child,
        });

        Ok(reader)
    }

    /// Create the session directory and seed shell files that are missing
    async fn prepare_working_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.working_dir)
            .await
            .map_err(|e| {
                Error::Workspace(format!(
                    "Failed to create {}: {}",
                    self.working_dir.display(),
                    e
                ))
            })?;

        let bashrc = format!(
            "export PS1='{}'\nalias ll='ls -alF'\nalias la='ls -A'\nalias l='ls -CF'\n",
            self.settings.prompt
        );
        let seeds = [
            (".bashrc", bashrc),
            ("package.json", "{\"private\": true}\n".to_string()),
        ];

        for (name, content) in seeds {
            let path = self.working_dir.join(name);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                continue;
            }
            tokio::fs::write(&path, content)
                .await
                .map_err(|e| Error::Workspace(format!("Failed to write {}: {}", name, e)))?;
        }
        Ok(())
    }

    fn build_env(&self) -> Vec<(String, String)> {
        let identity = SandboxIdentity {
            home: &self.working_dir,
            user: &self.username,
            hostname: &self.hostname,
        };
        let mut env = sandbox_env(&self.env_security, &identity);
        env.insert("PS1".to_string(), self.settings.prompt.clone());
        env.insert("SHELL".to_string(), self.settings.program.clone());
        env.into_iter().collect()
    }

    /// SIGTERM the group, wait up to the grace period, then SIGKILL
    async fn terminate(&self, child: &mut Box<dyn Child + Send + Sync>) {
        let pid = child.process_id();
        signal_group(pid, Signal::Terminate);

        let deadline = Instant::now() + self.settings.stop_grace();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Shell {} exited: {:?}", self.shell_id, status);
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("Failed to poll shell {}: {}", self.shell_id, e);
                    break;
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.settings.stop_poll()).await;
        }

        debug!("Shell {} still alive, sending SIGKILL", self.shell_id);
        signal_group(pid, Signal::Kill);
        let _ = child.kill();

        // reap
        for _ in 0..10 {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        warn!("Shell {} did not exit after SIGKILL", self.shell_id);
    }

    /// Deliver one message to the current subscriber, in call order
    async fn deliver(&self, output: ShellOutput) {
        let sink = self.sink.lock().clone();
        let Some(sink) = sink else {
            return;
        };

        if sink.send(output).await.is_err() {
            debug!("Subscriber of shell {} went away", self.shell_id);
            let mut current = self.sink.lock();
            if current.as_ref().is_some_and(|s| s.same_channel(&sink)) {
                *current = None;
            }
        }
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.reader_stop.store(true, Ordering::Release);
        if let Some(mut handles) = self.pty.get_mut().take() {
            signal_group(handles.child.process_id(), Signal::Kill);
            let _ = handles.child.kill();
        }
    }
}

impl std::fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSession")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("shell_id", &self.shell_id)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Reader / forwarder
// ============================================================================

/// Read loop, run on a dedicated thread until EOF or `stop`
fn read_loop(
    mut reader: PtyReader,
    stop: Arc<AtomicBool>,
    tx: mpsc::Sender<Vec<u8>>,
    chunk_size: usize,
) {
    let mut buf = vec![0u8; chunk_size];
    while !stop.load(Ordering::Acquire) {
        match wait_readable(&reader, READ_POLL_INTERVAL) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(_) => break,
        }
        match reader.read(&mut buf) {
            Ok(0) => break, // EOF
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            // EIO once the last slave descriptor is closed
            Err(_) => break,
        }
    }
    // dropping the reader closes this thread's master descriptor
}

/// Input pump: blocking pty writes stay off the async runtime
fn spawn_writer(
    mut writer: Box<dyn Write + Send>,
    session_id: SessionId,
) -> Result<mpsc::UnboundedSender<Vec<u8>>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    std::thread::Builder::new()
        .name(format!("pty-writer-{}", session_id))
        .spawn(move || {
            while let Some(data) = rx.blocking_recv() {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    debug!("Shell input write failed: {}", e);
                    break;
                }
            }
        })
        .map_err(|e| Error::Pty(format!("Failed to spawn writer thread: {}", e)))?;
    Ok(tx)
}

#[cfg(unix)]
type PtyReader = std::fs::File;

#[cfg(not(unix))]
type PtyReader = Box<dyn Read + Send>;

/// Private duplicate of the master descriptor, owned by the reader thread
#[cfg(unix)]
fn open_reader(master: &(dyn MasterPty + Send)) -> Result<PtyReader> {
    use std::os::unix::io::FromRawFd;

    let fd = master
        .as_raw_fd()
        .ok_or_else(|| Error::Pty("PTY master has no descriptor".to_string()))?;
    // SAFETY: dup returns a fresh descriptor that the File below owns exclusively
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(Error::Pty(format!(
            "Failed to duplicate PTY master: {}",
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: `dup` is valid and not owned elsewhere
    Ok(unsafe { std::fs::File::from_raw_fd(dup) })
}

#[cfg(not(unix))]
fn open_reader(master: &(dyn MasterPty + Send)) -> Result<PtyReader> {
    master
        .try_clone_reader()
        .map_err(|e| Error::Pty(format!("Failed to clone PTY reader: {}", e)))
}

/// Wait until the master is readable (or hung up), at most `timeout`
#[cfg(unix)]
fn wait_readable(reader: &PtyReader, timeout: Duration) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let mut pollfd = libc::pollfd {
        fd: reader.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: one valid pollfd for the duration of the call
    let ready = unsafe { libc::poll(&mut pollfd, 1, timeout.as_millis() as libc::c_int) };
    match ready {
        0 => Ok(false),
        n if n > 0 => Ok(true),
        _ => {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(err)
            }
        }
    }
}

#[cfg(not(unix))]
fn wait_readable(_reader: &PtyReader, _timeout: Duration) -> std::io::Result<bool> {
    Ok(true)
}

/// Decode chunks in order, deliver them, then stop the session
async fn forward_output(session: Arc<ShellSession>, mut rx: mpsc::Receiver<Vec<u8>>) {
    let mut decoder = Utf8Decoder::default();
    while let Some(chunk) = rx.recv().await {
        let text = decoder.decode(&chunk);
        if !text.is_empty() {
            session.deliver(ShellOutput::Data(text)).await;
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        session.deliver(ShellOutput::Data(rest)).await;
    }

    debug!("Reader for shell {} finished", session.shell_id);
    session.halt().await;
    session.close_stream().await;
}

/// Lossy UTF-8 decoding that keeps a split multi-byte sequence for the next chunk
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let keep = incomplete_tail(&self.pending);
        let tail = self.pending.split_off(self.pending.len() - keep);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a truncated multi-byte sequence at the end of `bytes`
fn incomplete_tail(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

// ============================================================================
// Signals
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else {
        return;
    };
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: killpg only sends a signal; the pty child leads its own group
    unsafe {
        libc::killpg(pid as libc::pid_t, signo);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}

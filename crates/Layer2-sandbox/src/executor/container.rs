//! Container runner - runs programs in throwaway Docker containers
//!
//! Each run gets its own container:
//! - Workspace bind-mounted at `/workspace` (read-only for code, writable for commands)
//! - Network disabled for code runs
//! - Memory, CPU and pid ceilings from the sandbox limits
//! - Force-removed on every path, including timeouts and launch failures

use super::{Invocation, ProcessRunner, RunOutput, RunSpec, CONTAINER_WORKSPACE};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StatsOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use terminus_foundation::{Error, Result, SandboxConfig};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Container runner configuration
#[derive(Debug, Clone)]
pub struct ContainerRunnerConfig {
    /// Image for code runs
    pub code_image: String,

    /// Image for command runs
    pub command_image: String,

    /// Interpreter inside the image
    pub interpreter: String,

    /// Unprivileged user for code runs
    pub user: String,

    pub hostname: String,

    /// Memory ceiling in bytes
    pub memory_bytes: Option<i64>,

    /// CPU ceiling in billionths of a CPU
    pub nano_cpus: i64,

    pub pids_limit: Option<i64>,
}

impl Default for ContainerRunnerConfig {
    fn default() -> Self {
        Self::from_config(&SandboxConfig::default())
    }
}

impl ContainerRunnerConfig {
    /// Derive from the sandbox configuration
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            code_image: config.runtime.code_image.clone(),
            command_image: config.runtime.command_image.clone(),
            interpreter: "python3".to_string(),
            user: config.runtime.container_user.clone(),
            hostname: config.runtime.hostname.clone(),
            memory_bytes: config.limits.memory_bytes().map(|bytes| bytes as i64),
            nano_cpus: config.limits.nano_cpus(),
            pids_limit: config.limits.pids_limit,
        }
    }

    fn image_for(&self, invocation: &Invocation) -> &str {
        match invocation {
            Invocation::Script { .. } => &self.code_image,
            Invocation::Shell { .. } => &self.command_image,
        }
    }
}

/// Runner backed by the local Docker daemon
pub struct ContainerRunner {
    docker: Arc<Docker>,
    config: ContainerRunnerConfig,
}

impl ContainerRunner {
    /// Connect to the local daemon and verify it answers
    pub async fn connect(config: ContainerRunnerConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Launch(format!("Failed to connect to Docker: {}", e)))?;

        docker
            .ping()
            .await
            .map_err(|e| Error::Launch(format!("Docker is not responding: {}", e)))?;

        info!("Connected to Docker daemon");
        Ok(Self {
            docker: Arc::new(docker),
            config,
        })
    }

    pub fn config(&self) -> &ContainerRunnerConfig {
        &self.config
    }

    /// Program and arguments inside the container
    fn program(&self, invocation: &Invocation) -> Vec<String> {
        match invocation {
            Invocation::Script { entrypoint } => {
                vec![self.config.interpreter.clone(), entrypoint.clone()]
            }
            Invocation::Shell { command } => {
                vec!["bash".to_string(), "-c".to_string(), command.clone()]
            }
        }
    }

    fn container_env(spec: &RunSpec) -> Vec<String> {
        let mut env = vec![
            format!("HOME={}", CONTAINER_WORKSPACE),
            format!("PYTHONPATH={}", CONTAINER_WORKSPACE),
            "PYTHONDONTWRITEBYTECODE=1".to_string(),
            "LANG=C.UTF-8".to_string(),
        ];
        env.extend(spec.env.iter().map(|(k, v)| format!("{}={}", k, v)));
        env
    }

    /// Pull the image when it is not present locally
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!("Pulling image {}", image);
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| Error::Launch(format!("Failed to pull {}: {}", image, e)))?;
        }
        Ok(())
    }

    /// Create and start an idle container for the run
    async fn create_container(&self, spec: &RunSpec) -> Result<String> {
        let image = self.config.image_for(&spec.invocation).to_string();
        self.ensure_image(&image).await?;

        let invocation = &spec.invocation;
        let mode = if invocation.workspace_writable() { "rw" } else { "ro" };
        let bind = format!("{}:{}:{}", spec.workspace.display(), CONTAINER_WORKSPACE, mode);

        let config = Config {
            image: Some(image),
            hostname: Some(self.config.hostname.clone()),
            working_dir: Some(CONTAINER_WORKSPACE.to_string()),
            network_disabled: Some(!invocation.network_enabled()),
            // Idle until the exec runs
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            host_config: Some(HostConfig {
                binds: Some(vec![bind]),
                memory: self.config.memory_bytes,
                memory_swap: self.config.memory_bytes,
                nano_cpus: Some(self.config.nano_cpus),
                pids_limit: self.config.pids_limit,
                network_mode: (!invocation.network_enabled()).then(|| "none".to_string()),
                security_opt: Some(vec!["no-new-privileges:true".to_string()]),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: format!("terminus-{}", Uuid::new_v4()),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::Launch(format!("Failed to create container: {}", e)))?;

        if let Err(e) = self
            .docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove_container(&response.id).await;
            return Err(Error::Launch(format!("Failed to start container: {}", e)));
        }

        Ok(response.id)
    }

    /// Track peak memory from the stats stream
    fn sample_memory(&self, container_id: &str) -> (Arc<AtomicU64>, JoinHandle<()>) {
        let peak = Arc::new(AtomicU64::new(0));
        let peak_clone = Arc::clone(&peak);
        let docker = Arc::clone(&self.docker);
        let id = container_id.to_string();

        let handle = tokio::spawn(async move {
            let options = StatsOptions {
                stream: true,
                one_shot: false,
            };
            let mut stats = docker.stats(&id, Some(options));
            while let Some(Ok(sample)) = stats.next().await {
                let memory = &sample.memory_stats;
                if let Some(bytes) = memory.max_usage.or(memory.usage) {
                    peak_clone.fetch_max(bytes, Ordering::Relaxed);
                }
            }
        });

        (peak, handle)
    }

    /// Run the program through exec and collect its streams
    async fn exec_in_container(&self, container_id: &str, spec: &RunSpec) -> Result<RunOutput> {
        let user = if spec.invocation.workspace_writable() {
            None
        } else {
            Some(self.config.user.clone())
        };

        let exec_options = CreateExecOptions {
            cmd: Some(self.program(&spec.invocation)),
            env: Some(Self::container_env(spec)),
            working_dir: Some(spec.container_cwd()),
            user,
            attach_stdin: Some(spec.stdin.is_some()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(container_id, exec_options)
            .await
            .map_err(|e| Error::Launch(format!("Failed to create exec: {}", e)))?;

        let output = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Error::Launch(format!("Failed to start exec: {}", e)))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached {
            mut output,
            mut input,
        } = output
        {
            if let Some(data) = &spec.stdin {
                if let Err(e) = input.write_all(data.as_bytes()).await {
                    debug!("Failed to write stdin: {}", e);
                }
                let _ = input.shutdown().await;
            }

            while let Some(Ok(msg)) = output.next().await {
                match msg {
                    LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| Error::Runtime(format!("Failed to inspect exec: {}", e)))?;

        Ok(RunOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code.unwrap_or(-1) as i32,
            ..Default::default()
        })
    }

    /// Force-remove a container, logging failures
    async fn remove_container(&self, container_id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        if let Err(e) = self
            .docker
            .remove_container(container_id, Some(options))
            .await
        {
            warn!("Failed to remove container {}: {}", container_id, e);
        }
    }
}

#[async_trait]
impl ProcessRunner for ContainerRunner {
    async fn run(&self, spec: &RunSpec) -> Result<RunOutput> {
        let container_id = self.create_container(spec).await?;
        debug!("Container {} created for {:?}", container_id, spec.invocation);

        let (peak, sampler) = self.sample_memory(&container_id);
        let started = Instant::now();

        let result = tokio::time::timeout(spec.timeout, self.exec_in_container(&container_id, spec)).await;
        let elapsed = started.elapsed();

        sampler.abort();
        self.remove_container(&container_id).await;
        let memory_bytes = peak.load(Ordering::Relaxed);

        match result {
            Ok(output) => {
                let mut output = output?;
                output.elapsed = elapsed;
                output.memory_bytes = memory_bytes;
                Ok(output)
            }
            Err(_) => {
                warn!(
                    "Container {} exceeded {}s and was removed",
                    container_id,
                    spec.timeout.as_secs()
                );
                Ok(RunOutput::timed_out(elapsed, memory_bytes))
            }
        }
    }

    fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "container"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terminus_foundation::ResourceLimits;

    #[test]
    fn test_config_from_sandbox() {
        let sandbox = SandboxConfig::default()
            .with_limits(ResourceLimits::default().with_memory("256m").with_cpus(0.5));
        let config = ContainerRunnerConfig::from_config(&sandbox);

        assert_eq!(config.memory_bytes, Some(256 * 1024 * 1024));
        assert_eq!(config.nano_cpus, 500_000_000);
        assert_eq!(config.user, "nobody");
        assert_eq!(config.command_image, "python:3.11-slim");
    }

    #[test]
    fn test_image_selection() {
        let config = ContainerRunnerConfig {
            code_image: "code:latest".to_string(),
            command_image: "cmd:latest".to_string(),
            ..Default::default()
        };

        let script = Invocation::Script {
            entrypoint: "main.py".to_string(),
        };
        let shell = Invocation::Shell {
            command: "ls".to_string(),
        };
        assert_eq!(config.image_for(&script), "code:latest");
        assert_eq!(config.image_for(&shell), "cmd:latest");
    }

    #[test]
    fn test_container_env() {
        let spec = RunSpec::script("/tmp/ws", "main.py", std::time::Duration::from_secs(1))
            .with_env("EXTRA", "1");
        let env = ContainerRunner::container_env(&spec);

        assert!(env.contains(&"HOME=/workspace".to_string()));
        assert!(env.contains(&"EXTRA=1".to_string()));
    }
}

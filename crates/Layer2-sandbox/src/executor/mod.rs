//! Isolated process runners
//!
//! Provides two execution backends behind `ProcessRunner`:
//! - `ContainerRunner` - Docker-based isolated execution
//! - `SubprocessRunner` - Host subprocess fallback with a scrubbed environment
//!
//! ## Environment
//! - `EnvSecurityConfig` - Host variables hidden from sandboxed processes
//!
//! ## Resource Monitoring
//! - `MemorySampler` - Peak memory tracking for subprocesses
//! - `RunTracker` - Sweeps descendants that escaped the process group

pub mod container;
pub mod env;
pub mod reaper;
pub mod resource_monitor;
pub mod subprocess;
pub mod r#trait;

pub use container::{ContainerRunner, ContainerRunnerConfig};
pub use env::{sandbox_env, EnvSecurityConfig, SandboxIdentity, SANDBOX_PATH};
pub use r#trait::{Invocation, ProcessRunner, RunOutput, RunSpec, CONTAINER_WORKSPACE};
pub use reaper::{RunTracker, RUN_MARKER_VAR};
pub use resource_monitor::{bytes_to_mb, format_bytes, MemorySampler, ResourceSnapshot};
pub use subprocess::{SubprocessConfig, SubprocessRunner};

use std::sync::Arc;
use terminus_foundation::{Error, Result, RuntimeStrategy, SandboxConfig};
use tracing::{info, warn};

/// Pick the runner for the configured strategy
///
/// `Auto` prefers a reachable container runtime and falls back to subprocesses.
/// `Container` fails when no runtime answers.
pub async fn detect_runner(config: &SandboxConfig) -> Result<Arc<dyn ProcessRunner>> {
    let subprocess = || -> Arc<dyn ProcessRunner> {
        Arc::new(SubprocessRunner::with_config(SubprocessConfig::from_config(config)))
    };

    match config.runtime.strategy {
        RuntimeStrategy::Subprocess => {
            info!("Using subprocess runner");
            Ok(subprocess())
        }
        RuntimeStrategy::Container => {
            let runner = ContainerRunner::connect(ContainerRunnerConfig::from_config(config))
                .await
                .map_err(|e| Error::Config(format!("Container runtime required: {}", e)))?;
            Ok(Arc::new(runner))
        }
        RuntimeStrategy::Auto => {
            match ContainerRunner::connect(ContainerRunnerConfig::from_config(config)).await {
                Ok(runner) => {
                    info!("Using container runner");
                    Ok(Arc::new(runner))
                }
                Err(e) => {
                    warn!("{}; falling back to subprocess runner", e);
                    Ok(subprocess())
                }
            }
        }
    }
}

//! Terminus CLI - Main entry point

mod cli;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use terminus_foundation::{RuntimeStrategy, SandboxConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Terminus - sandboxed code execution and shells for the web IDE
#[derive(Parser, Debug)]
#[command(name = "terminus")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Skip Docker and run on the host (subprocess runner)
    #[arg(long, global = true)]
    subprocess: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a Python file in the sandbox
    Run {
        /// Python source file
        file: PathBuf,

        /// Collaborative session id
        #[arg(short, long, default_value = "1")]
        session: i64,

        /// Text fed to the program's standard input
        #[arg(long)]
        stdin: Option<String>,

        /// Directory whose files are materialized next to the program
        #[arg(long)]
        files: Option<PathBuf>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a shell command in the sandbox
    Exec {
        /// Command line
        command: String,

        /// Working directory relative to /workspace
        #[arg(long)]
        cwd: Option<String>,

        /// Collaborative session id
        #[arg(short, long, default_value = "1")]
        session: i64,

        /// Directory whose files are materialized in the workspace
        #[arg(long)]
        files: Option<PathBuf>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Open a persistent shell and relay stdin/stdout
    Shell {
        /// Collaborative session id
        #[arg(short, long, default_value = "1")]
        session: i64,

        /// User id
        #[arg(short, long, default_value = "1")]
        user: i64,

        /// Display name of the user
        #[arg(long, default_value = "terminus")]
        username: String,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to the global config file
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load configuration
    let mut config = SandboxConfig::load();
    if args.subprocess {
        config.runtime.strategy = RuntimeStrategy::Subprocess;
    }

    match args.command {
        Command::Run {
            file,
            session,
            stdin,
            files,
            json,
        } => {
            let code = std::fs::read_to_string(&file)?;
            let files = cli::load_files(files.as_deref())?;
            let result = cli::run_code(config, &code, session, &files, stdin.as_deref()).await?;
            cli::print_result(&result, json)?;
            std::process::exit(result.exit_code.unwrap_or(1));
        }
        Command::Exec {
            command,
            cwd,
            session,
            files,
            json,
        } => {
            let files = cli::load_files(files.as_deref())?;
            let result =
                cli::run_command(config, &command, session, &files, cwd.as_deref()).await?;
            cli::print_result(&result, json)?;
            std::process::exit(result.exit_code.unwrap_or(1));
        }
        Command::Shell {
            session,
            user,
            username,
        } => cli::run_shell(config, session, user, &username).await,
        Command::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save_global()?;
                tracing::info!("Saved global configuration");
            }
            Ok(())
        }
    }
}

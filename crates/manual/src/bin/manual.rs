//! Manual CLI - bootstrap a controller onto an existing machine.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use manual::config::{self, ManualConfig};
use manual::detect;
use manual::state::{self, StateError};
use manual::{
    BootstrapArgs, BootstrapContext, Bootstrapper, FileStorage, HardwareCharacteristics,
    ManualEnviron, SshExecutor,
};

/// Manual CLI - bootstrap a CTO Platform controller over SSH.
#[derive(Parser)]
#[command(name = "manual")]
#[command(about = "Bootstrap a controller onto an existing machine")]
struct Cli {
    /// Config file (YAML). Flags override its values.
    #[arg(long, env = "MANUAL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Local directory backing the environment's storage.
    #[arg(long, env = "MANUAL_STORAGE_DIR", global = true)]
    storage_dir: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap a controller onto a host.
    Bootstrap {
        /// Target host (user@host).
        #[arg(long)]
        host: Option<String>,

        /// Agent data directory on the host.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Target OS series (detected when omitted).
        #[arg(long)]
        series: Option<String>,

        /// Target architecture (detected when omitted).
        #[arg(long)]
        arch: Option<String>,

        /// Tools manifest (YAML).
        #[arg(long)]
        tools: Option<PathBuf>,

        /// Environment name.
        #[arg(long)]
        environ: Option<String>,

        #[command(flatten)]
        ssh: SshArgs,

        /// Timeout in seconds for the whole attempt.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show the bootstrap state record.
    Status,

    /// Remove the bootstrap state record.
    DestroyState,

    /// Probe a host for an existing agent and its hardware.
    Detect {
        /// Target host (user@host).
        #[arg(long)]
        host: Option<String>,

        /// Agent data directory on the host.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        #[command(flatten)]
        ssh: SshArgs,
    },
}

/// SSH connection flags shared by the remote subcommands.
#[derive(Args)]
struct SshArgs {
    /// SSH private key.
    #[arg(long, env = "MANUAL_SSH_IDENTITY")]
    identity_file: Option<PathBuf>,

    /// Extra `-o` option for ssh (repeatable).
    #[arg(long = "ssh-option", value_name = "KEY=VALUE")]
    ssh_options: Vec<String>,

    /// SSH connect timeout in seconds.
    #[arg(long)]
    connect_timeout: Option<u64>,
}

impl SshArgs {
    fn executor(self, file_config: &ManualConfig) -> SshExecutor {
        let mut executor = SshExecutor::new();
        if let Some(path) = self.identity_file.or_else(|| file_config.identity_file.clone()) {
            executor = executor.with_identity(config::expand_home(&path).to_string_lossy());
        }
        for option in self.ssh_options {
            executor = executor.with_option(option);
        }
        if let Some(secs) = self.connect_timeout {
            executor = executor.with_connect_timeout(Duration::from_secs(secs));
        }
        executor
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("info,manual=debug")
    } else {
        EnvFilter::new("warn,manual=info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let file_config = match &cli.config {
        Some(path) => ManualConfig::load(path)?,
        None => ManualConfig::default(),
    };
    let storage_dir = cli
        .storage_dir
        .clone()
        .or_else(|| file_config.storage_dir.clone())
        .map_or_else(config::default_storage_dir, |p| config::expand_home(&p));
    let storage = Arc::new(FileStorage::new(&storage_dir));

    match cli.command {
        Commands::Bootstrap {
            host,
            data_dir,
            series,
            arch,
            tools,
            environ,
            ssh,
            timeout,
        } => {
            let host = host.or_else(|| file_config.host.clone()).unwrap_or_default();
            let data_dir = data_dir
                .or_else(|| file_config.data_dir.clone())
                .unwrap_or_else(|| PathBuf::from(config::DEFAULT_DATA_DIR));
            let environ_name = environ
                .or_else(|| file_config.environ.clone())
                .unwrap_or_else(|| config::DEFAULT_ENVIRON.to_string());
            let arch = arch.or_else(|| file_config.arch.clone());
            let possible_tools = file_config.tools_list(tools.as_deref())?;

            let mut context = BootstrapContext::default();
            if let Some(secs) = timeout.or(file_config.timeout_secs) {
                context = context.with_timeout(Duration::from_secs(secs));
            }
            let token = context.cancellation_token().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    token.cancel();
                }
            });

            let args = BootstrapArgs {
                host,
                data_dir,
                environ: Some(Arc::new(ManualEnviron::new(environ_name, storage))),
                possible_tools,
                series: series.or_else(|| file_config.series.clone()),
                hardware: arch.map(HardwareCharacteristics::with_arch),
                context,
            };
            info!("Bootstrapping {}", args.host);

            let executor = ssh.executor(&file_config);
            match Bootstrapper::new(Arc::new(executor)).bootstrap(&args).await {
                Ok(record) => {
                    println!("✅ Bootstrapped {}", args.host);
                    for id in &record.state_instances {
                        println!("   instance: {id}");
                    }
                }
                Err(e) if e.is_provisioned() => {
                    println!("{} is already bootstrapped, nothing to do", args.host);
                }
                Err(e) => {
                    eprintln!("❌ {e}");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }

        Commands::Status => match state::load_state(storage.as_ref()).await {
            Ok(record) => {
                println!("\n{:<20} {:<40}", "INSTANCE", "HARDWARE");
                println!("{}", "-".repeat(60));
                for (i, id) in record.state_instances.iter().enumerate() {
                    let hw = record
                        .characteristics
                        .get(i)
                        .map(ToString::to_string)
                        .unwrap_or_default();
                    println!("{:<20} {:<40}", id.as_str(), hw);
                }
            }
            Err(StateError::NotBootstrapped) => {
                println!("Environment at {} is not bootstrapped", storage_dir.display());
                return Ok(ExitCode::from(2));
            }
            Err(e) => return Err(e).context("Failed to read bootstrap state"),
        },

        Commands::DestroyState => {
            state::remove_state(storage.as_ref())
                .await
                .context("Failed to remove bootstrap state")?;
            println!("Removed bootstrap state from {}", storage_dir.display());
        }

        Commands::Detect {
            host,
            data_dir,
            ssh,
        } => {
            let host = host
                .or_else(|| file_config.host.clone())
                .context("--host is required")?;
            let data_dir = data_dir
                .or_else(|| file_config.data_dir.clone())
                .unwrap_or_else(|| PathBuf::from(config::DEFAULT_DATA_DIR));
            let executor = ssh.executor(&file_config);
            let ctx = BootstrapContext::default();

            let status = detect::detect(&executor, &host, &data_dir, true, &ctx)
                .await
                .with_context(|| format!("Failed to inspect {host}"))?;
            println!("Host:        {host}");
            println!("Provisioned: {}", status.already_provisioned);
            if let Some(series) = &status.detected_series {
                println!("Series:      {series}");
            }
            if let Some(hw) = &status.detected_hardware {
                println!("Hardware:    {hw}");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_flags_parse() {
        let cli = Cli::try_parse_from([
            "manual",
            "detect",
            "--host",
            "ubuntu@node1",
            "--ssh-option",
            "Port=2222",
            "--ssh-option",
            "User=ops",
            "--connect-timeout",
            "5",
        ])
        .unwrap();
        let Commands::Detect { ssh, .. } = cli.command else {
            panic!("expected detect");
        };
        assert_eq!(ssh.ssh_options, vec!["Port=2222", "User=ops"]);
        assert_eq!(ssh.connect_timeout, Some(5));
    }
}

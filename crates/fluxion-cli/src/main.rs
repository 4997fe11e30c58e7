//! The `fluxion` binary: serve a dynamic directory, or install a module
//! archive into one.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fluxion_engine::{install_archive, load_config, validate_config, FileRuntime, FluxionConfig};

#[derive(Parser)]
#[command(name = "fluxion", about = "A meta HTTP server driven by a dynamic directory")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the dynamic directory.
    Serve {
        /// Path to fluxion.json.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Dynamic directory (overrides the config file).
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Bind host (overrides the config file).
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides the config file).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Install a module archive (.tar, .tar.gz, .tgz) into the dynamic
    /// directory.
    Install {
        /// Archive to install.
        archive: PathBuf,
        /// Path to fluxion.json.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Dynamic directory (overrides the config file).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fluxion=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            config,
            dir,
            host,
            port,
        } => {
            let mut config = resolve_config(config)?;
            if let Some(dir) = dir {
                config.dir = dir;
            }
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            validate_config(&config)
                .map_err(|errors| anyhow::anyhow!("invalid configuration: {}", errors.join("; ")))?;
            serve(config)
        }
        Command::Install {
            archive,
            config,
            dir,
        } => {
            let root = match dir {
                Some(dir) => dir,
                None => resolve_config(config)?.dir,
            };
            let report = install_archive(&root, &archive)
                .with_context(|| format!("failed to install {}", archive.display()))?;
            println!("installed module {} ({} files)", report.module, report.files);
            Ok(())
        }
    }
}

/// Load the named config, or fall back to ./fluxion.json, or defaults.
fn resolve_config(path: Option<PathBuf>) -> anyhow::Result<FluxionConfig> {
    match path {
        Some(path) => load_config(&path).map_err(Into::into),
        None => {
            let default_path = PathBuf::from("fluxion.json");
            if default_path.is_file() {
                load_config(&default_path).map_err(Into::into)
            } else {
                Ok(FluxionConfig::default())
            }
        }
    }
}

fn serve(config: FluxionConfig) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(async {
        let file_runtime =
            FileRuntime::new(&config).context("failed to initialize the file runtime")?;

        let addr = format!("{}:{}", config.host, config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;

        fluxion_server::serve(file_runtime, &config, listener, shutdown_signal())
            .await
            .context("server exited with an error")?;
        Ok(())
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install ctrl-c handler: {}", err);
        return;
    }
    tracing::info!("shutdown signal received");
}

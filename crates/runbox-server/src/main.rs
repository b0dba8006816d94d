//! Sandbox server exposing language runtimes over websockets
//!
//! Loads the language table, connects to the local container engine and serves
//! the `/term` and `/run` endpoints. A missing or invalid language table is
//! fatal at startup; nothing after that point can take the process down.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use runbox_core::{ContainerRuntime, DockerRuntime, LanguageTable};
use runbox_server::{images, shutdown_signal, RunboxServer, ServerConfig, SessionTimeouts};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about = "runbox - on-demand code execution sandboxes over websockets")]
struct Cli {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(long, short, default_value = "langs.json", help = "Language table (JSON or YAML)")]
    config: String,

    #[clap(long, default_value = "0.0.0.0:80")]
    bind_addr: String,

    #[clap(long, short, default_value = "info")]
    log_level: String,

    #[clap(long, help = "Docker engine address (unix://, tcp:// or http://); defaults to DOCKER_HOST or the local socket")]
    docker_host: Option<String>,

    #[clap(long, default_value_t = 60, help = "Seconds allowed to create, start and attach a sandbox")]
    provision_timeout_secs: u64,

    #[clap(long, default_value_t = 60, help = "Seconds allowed to upload code into a sandbox")]
    upload_timeout_secs: u64,

    #[clap(long, default_value_t = 60, help = "Seconds allowed to remove a sandbox")]
    cleanup_timeout_secs: u64,

    #[clap(long, default_value_t = 10, help = "Seconds to wait for a client to hang up after a failed start")]
    drain_timeout_secs: u64,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve sandbox sessions (default command)
    Serve,
    /// Pull the images used by the given languages (all when none are given)
    Pull {
        languages: Vec<String>,
    },
    /// List configured languages and their images
    Languages,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    log::info!("Loading language table from: {}", cli.config);
    let languages = LanguageTable::from_file(&cli.config)
        .await
        .with_context(|| format!("Failed to load language table {}", cli.config))?;
    log::info!("Loaded {} languages", languages.len());

    match &cli.command {
        Some(Commands::Languages) => {
            list_languages(&languages);
            Ok(())
        }
        Some(Commands::Pull { languages: names }) => {
            let runtime = connect_runtime(cli.docker_host.as_deref())?;
            let pulled = images::pull_images(runtime.as_ref(), &languages, names).await?;
            log::info!("Pulled {} images", pulled.len());
            Ok(())
        }
        Some(Commands::Serve) | None => run_server(&cli, languages).await,
    }
}

fn connect_runtime(host: Option<&str>) -> Result<Arc<dyn ContainerRuntime>> {
    let runtime = match host {
        Some(host) => DockerRuntime::connect(host),
        None => DockerRuntime::connect_with_local_defaults(),
    }
    .context("Failed to connect to Docker")?;
    Ok(Arc::new(runtime))
}

fn list_languages(languages: &LanguageTable) {
    for (name, profile) in languages.sorted() {
        println!(
            "{:<16} term: {:<32} run: {}",
            name, profile.terminal.image, profile.run.image
        );
    }
}

async fn run_server(cli: &Cli, languages: LanguageTable) -> Result<()> {
    let runtime = connect_runtime(cli.docker_host.as_deref())?;
    if let Err(e) = runtime.ping().await {
        log::warn!("Docker engine is not responding yet: {}", e);
    }

    let timeouts = SessionTimeouts {
        provision: Duration::from_secs(cli.provision_timeout_secs),
        upload: Duration::from_secs(cli.upload_timeout_secs),
        cleanup: Duration::from_secs(cli.cleanup_timeout_secs),
        drain: Duration::from_secs(cli.drain_timeout_secs),
    };
    let server_config = ServerConfig::new()
        .with_bind_addr_str(&cli.bind_addr)?
        .with_logging(true)
        .with_session_timeouts(timeouts);

    log::info!("Starting runbox server on {}...", server_config.bind_addr);
    let server = RunboxServer::with_config(languages, runtime, server_config);

    if let Err(e) = server.serve_with_shutdown(shutdown_signal()).await {
        log::error!("Server failed: {}", e);
        return Err(e.into());
    }

    Ok(())
}

//! Command-line entry point for the koala execution engine
//!
//! `koala serve` (the default) exposes the engine over HTTP. `koala run`
//! executes a script file against local dataset files and prints the result
//! envelope, `koala validate` only screens a script, and `koala health` reports
//! which isolation backend this host would use.

mod api;
mod error;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use koala_core::{
    config::ConfigLoader, DatasetBinding, ExecutionEngine, ExecutionRequest, KoalaConfig,
    LimitOverrides, Validator,
};
use log::LevelFilter;
use std::path::PathBuf;
use std::sync::Arc;

use crate::server::{shutdown_signal, KoalaServer, ServerConfig};

/// Exit status of `koala run` when the script ran but did not succeed.
const EXIT_NOT_SUCCESS: i32 = 2;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Koala - sandboxed execution of data-analysis scripts")]
struct Cli {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(long, short, default_value = "koala.yaml", help = "Configuration file; built-in defaults apply when it does not exist")]
    config: PathBuf,

    #[clap(long, default_value = "127.0.0.1:8700")]
    bind_addr: String,

    #[clap(long, short, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP server (default command)
    Serve {
        #[clap(long)]
        bind_addr: Option<String>,

        #[clap(long = "cors-origin", help = "Allowed CORS origin; repeat for several (default: any)")]
        cors_origins: Vec<String>,

        #[clap(long, help = "Do not send CORS headers")]
        no_cors: bool,
    },
    /// Execute a script once and print the result envelope as JSON
    Run {
        /// Script file to execute
        script: PathBuf,

        #[clap(long = "dataset", short, help = "Dataset as NAME=PATH, or PATH to derive the name from the file name")]
        datasets: Vec<String>,

        #[clap(long, help = "Tighten the wall-clock timeout for this run")]
        timeout: Option<u64>,

        #[clap(long, help = "Tighten the memory ceiling for this run")]
        memory_mb: Option<u64>,
    },
    /// Screen a script without executing it
    Validate {
        script: PathBuf,
    },
    /// Print the backend and capacity this host would serve with
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    let config = ConfigLoader::from_file_or_default(&cli.config)
        .await
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    match cli.command {
        Some(Commands::Serve {
            bind_addr,
            cors_origins,
            no_cors,
        }) => {
            let server_config = ServerConfig::default()
                .with_bind_addr_str(&bind_addr.unwrap_or(cli.bind_addr))?
                .with_cors(!no_cors);
            let server_config = if cors_origins.is_empty() {
                server_config
            } else {
                server_config.with_cors_origins(cors_origins)
            };
            run_server(config, server_config).await
        }
        Some(Commands::Run {
            script,
            datasets,
            timeout,
            memory_mb,
        }) => {
            let limits = LimitOverrides {
                timeout_seconds: timeout,
                memory_mb,
                ..LimitOverrides::default()
            };
            run_once(config, script, datasets, limits).await
        }
        Some(Commands::Validate { script }) => validate_script(&config, script).await,
        Some(Commands::Health) => print_health(config).await,
        None => {
            let server_config = ServerConfig::default().with_bind_addr_str(&cli.bind_addr)?;
            run_server(config, server_config).await
        }
    }
}

async fn run_server(config: KoalaConfig, server_config: ServerConfig) -> Result<()> {
    let server_config = server_config
        .with_body_limit_for(&config.staging)
        .with_logging(true);

    let engine = ExecutionEngine::from_config(config).await?;
    log::info!(
        "Starting koala server on {} with the {} backend...",
        server_config.bind_addr,
        engine.backend_kind()
    );

    let server = KoalaServer::with_config(Arc::new(engine), server_config);
    if let Err(e) = server.serve_with_shutdown(shutdown_signal()).await {
        log::error!("Server failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}

fn parse_dataset_arg(arg: &str) -> DatasetBinding {
    match arg.split_once('=') {
        Some((name, path)) if !name.is_empty() && !name.contains('/') => {
            DatasetBinding::from_file(name, path)
        }
        _ => DatasetBinding::from_uploaded_file(arg),
    }
}

async fn run_once(
    config: KoalaConfig,
    script_path: PathBuf,
    dataset_args: Vec<String>,
    limits: LimitOverrides,
) -> Result<()> {
    let script = tokio::fs::read_to_string(&script_path)
        .await
        .with_context(|| format!("Failed to read script {}", script_path.display()))?;

    let mut request = ExecutionRequest::new(script).with_limits(limits);
    for arg in &dataset_args {
        request = request.with_dataset(parse_dataset_arg(arg));
    }

    let engine = ExecutionEngine::from_config(config).await?;
    let result = engine.execute(&request).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.is_success() {
        std::process::exit(EXIT_NOT_SUCCESS);
    }
    Ok(())
}

async fn validate_script(config: &KoalaConfig, script_path: PathBuf) -> Result<()> {
    let script = tokio::fs::read_to_string(&script_path)
        .await
        .with_context(|| format!("Failed to read script {}", script_path.display()))?;

    Validator::new(&config.validator).validate(&script)?;
    println!("{}: ok", script_path.display());
    Ok(())
}

async fn print_health(config: KoalaConfig) -> Result<()> {
    let engine = ExecutionEngine::from_config(config).await?;
    println!("{}", serde_json::to_string_pretty(&engine.health())?);
    Ok(())
}

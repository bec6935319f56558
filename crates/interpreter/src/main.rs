mod backend;
mod config;
mod error;
mod http;
mod service;
mod storage;
mod stream;
#[cfg(test)]
mod testing;
mod types;

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

use crate::config::ConfigArgs;
use crate::error::{ServiceError, ServiceResult};
use crate::service::ExecutionService;
use crate::storage::LocalFileStore;
use crate::types::ExecuteRequest;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "code-interpreter", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the execution API over HTTP
    Serve(ConfigArgs),
    /// Execute one request JSON file and print the response JSON
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Request file, or `-` to read standard input
    request: PathBuf,
    #[command(flatten)]
    config: ConfigArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve(args) => run_serve(args).await,
        Command::Run(args) => run_once(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn build_service(args: ConfigArgs) -> ServiceResult<(config::ServiceConfig, ExecutionService)> {
    let config = config::load(args).await?;
    let executor = backend::connect(&config).await?;
    let files = Arc::new(LocalFileStore::new(config.file_storage_dir.clone()));
    let service = ExecutionService::new(&config, executor, files);
    Ok((config, service))
}

async fn run_serve(args: ConfigArgs) -> ServiceResult<()> {
    let (config, service) = build_service(args).await?;
    http::serve(&config.bind_addr(), Arc::new(service)).await
}

async fn run_once(args: RunArgs) -> ServiceResult<()> {
    let raw = if args.request.as_os_str() == "-" {
        let mut buf = Vec::new();
        tokio::io::stdin().read_to_end(&mut buf).await?;
        buf
    } else {
        tokio::fs::read(&args.request).await.map_err(|e| {
            ServiceError::InvalidRequest(format!("read {}: {e}", args.request.display()))
        })?
    };
    let request: ExecuteRequest = serde_json::from_slice(&raw)
        .map_err(|e| ServiceError::InvalidRequest(format!("parse request: {e}")))?;

    let (_, service) = build_service(args.config).await?;
    let response = service.execute(request).await?;
    let rendered = serde_json::to_string_pretty(&response).map_err(std::io::Error::from)?;
    println!("{rendered}");
    Ok(())
}

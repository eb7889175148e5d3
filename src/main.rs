use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde_json::json;
use tracing::{error, info, warn};

use tissaia::ai::payload::ImagePayload;
use tissaia::batch::{process_directory, BatchOptions};
use tissaia::settings::{default_settings_path, resolve_settings, ServiceSettings};
use tissaia::{build_runtime, logging, server};

#[derive(Debug, Parser)]
#[command(name = "tissaia")]
#[command(about = "Split multi-photo scans into individual restored photos", long_about = None)]
struct Cli {
    /// Settings file (defaults to ./tissaia.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve {
        /// Address to bind, overriding the settings file
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run every scan in a directory through the full pipeline
    Process {
        dir: PathBuf,
        /// Where shards and summary.json are written
        #[arg(long, short, default_value = "restored")]
        out: PathBuf,
        /// Manifest count for every scan; the pre-scan estimate is used otherwise
        #[arg(long)]
        expected: Option<u32>,
    },
    /// Detect photos on a single scan and print the regions as JSON
    Analyze {
        file: PathBuf,
        #[arg(long)]
        expected: Option<u32>,
    },
    /// Print configuration values
    PrintConfig,
}

fn load_settings(cli: &Cli) -> Result<ServiceSettings, String> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => {
            let cwd = std::env::current_dir().map_err(|err| err.to_string())?;
            default_settings_path(&cwd)
        }
    };
    resolve_settings(&path).map_err(|err| err.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("Error: {}", err);
            return ExitCode::FAILURE;
        }
    };
    let _guard = logging::init_logger(&settings.log_dir);

    let result = match cli.command {
        Some(Commands::PrintConfig) => print_config(&settings),
        Some(Commands::Process { dir, out, expected }) => {
            run_process(&settings, dir, out, expected).await
        }
        Some(Commands::Analyze { file, expected }) => run_analyze(&settings, file, expected).await,
        Some(Commands::Serve { bind }) => run_serve(settings, bind).await,
        None => run_serve(settings, None).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("Error: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn print_config(settings: &ServiceSettings) -> Result<(), String> {
    let json = serde_json::to_string_pretty(&settings.masked()).map_err(|err| err.to_string())?;
    println!("{}", json);
    Ok(())
}

async fn run_serve(settings: ServiceSettings, bind: Option<String>) -> Result<(), String> {
    let runtime = build_runtime(&settings).map_err(|err| err.to_string())?;
    if !runtime.health.configured {
        warn!("no API key configured and demo mode is disabled; health checks will fail");
    }
    let bind = bind.unwrap_or_else(|| settings.bind_address.clone());
    let addr: SocketAddr = bind
        .parse()
        .map_err(|err| format!("invalid bind address {}: {}", bind, err))?;

    let state = server::AppState {
        engine: runtime.engine,
        health: runtime.health,
    };
    let app = server::router(state, settings.max_upload_bytes);
    server::serve(app, addr).await.map_err(|err| err.to_string())
}

async fn run_process(
    settings: &ServiceSettings,
    dir: PathBuf,
    out: PathBuf,
    expected: Option<u32>,
) -> Result<(), String> {
    if !dir.is_dir() {
        return Err(format!("{} is not a directory", dir.display()));
    }
    let runtime = build_runtime(settings).map_err(|err| err.to_string())?;
    let options = BatchOptions {
        out_dir: out,
        expected,
    };
    let summary = process_directory(&runtime.engine, &dir, &options)
        .await
        .map_err(|err| err.to_string())?;
    info!(
        processed = summary.processed,
        restored = summary.restored,
        failed = summary.failed,
        out = %options.out_dir.display(),
        "done"
    );
    Ok(())
}

async fn run_analyze(
    settings: &ServiceSettings,
    file: PathBuf,
    expected: Option<u32>,
) -> Result<(), String> {
    let bytes = tokio::fs::read(&file)
        .await
        .map_err(|err| format!("failed to read {}: {}", file.display(), err))?;
    let image = ImagePayload::from_path(&file, bytes);
    let file_id = file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "scan".to_string());

    let runtime = build_runtime(settings).map_err(|err| err.to_string())?;
    let (result, logs) = runtime.engine.analyze(&file_id, &image, expected).await;
    let body = match &result {
        Ok(regions) => json!({ "success": true, "data": regions, "logs": logs }),
        Err(err) => json!({ "success": false, "error": err.to_string(), "logs": logs }),
    };
    let json = serde_json::to_string_pretty(&body).map_err(|err| err.to_string())?;
    println!("{}", json);
    result.map(|_| ()).map_err(|err| err.to_string())
}

//! ForgeImages CLI - `serve` runs the HTTP surface; `process` is a one-shot
//! local invocation for scripting and ops, mirroring the same JSON contract
//! the HTTP endpoint exposes.

use std::io::Read;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use forgeimages_core::config::EngineConfig;
use forgeimages_core::http::build_app;
use forgeimages_core::pipeline::{Pipeline, ProcessRequest};
use forgeimages_core::resolver::TemplateResolver;
use forgeimages_core::storage::StorageAdapter;

#[derive(Parser)]
#[command(name = "forgeimages-cli")]
#[command(about = "ForgeImages CLI - Template Compositing Pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve,

    /// Run one pipeline job locally and print the JobResult as JSON
    Process {
        /// JSON request payload; reads stdin if omitted
        #[arg(short, long)]
        payload: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    forgeimages_core::telemetry::init();
    let cli = Cli::parse();

    let config = match EngineConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Serve => run_serve(config).await,
        Commands::Process { payload } => run_process(config, payload).await,
    }
}

async fn run_serve(config: EngineConfig) -> ExitCode {
    let bind_addr = config.bind_addr;
    let app = build_app(&config);

    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("failed to bind {bind_addr}: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(addr = %bind_addr, "forgeimages listening");
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("server error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run_process(config: EngineConfig, payload: Option<String>) -> ExitCode {
    let raw = match payload {
        Some(p) => p,
        None => {
            let mut buf = String::new();
            if let Err(e) = std::io::stdin().read_to_string(&mut buf) {
                eprintln!("failed to read stdin: {e}");
                return ExitCode::FAILURE;
            }
            buf
        }
    };

    let request: ProcessRequest = match serde_json::from_str(&raw) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("invalid payload: {e}");
            return ExitCode::FAILURE;
        }
    };

    let resolver = TemplateResolver::new(
        config.cache_root.clone(),
        config.connect_timeout,
        config.read_timeout,
    );
    let storage = StorageAdapter::new(config.storage_root.clone(), config.public_base_url.clone());
    let pipeline = Pipeline::new(resolver, storage);

    let result = pipeline.process(request).await;
    let ok = result.is_ok();
    println!("{}", serde_json::to_string_pretty(&result).unwrap());

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    }
}

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;
mod middleware;
mod ui;
mod websocket;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "rustmake")]
#[command(about = "RustMake - DAG workflow automation server", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "RUSTMAKE_CONFIG", default_value = "rustmake.toml")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, env = "RUSTMAKE_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "3000")]
    port: u16,

    /// Host to bind to
    #[arg(long, env = "RUSTMAKE_HOST", default_value = "127.0.0.1")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rustmake=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    let config = ServerConfig::load(&args.config, args.data_dir)?;
    tracing::info!(
        "RustMake {} using {} (runs: {} workers, {}s node timeout, {} retained)",
        env!("CARGO_PKG_VERSION"),
        config.index_path().display(),
        config.engine.max_workers,
        config.engine.node_timeout_secs,
        config.engine.retained_runs
    );

    let addr = format!("{}:{}", args.host, args.port);

    api::serve(&addr, config).await?;

    Ok(())
}

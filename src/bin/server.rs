use std::env;
use std::sync::Arc;

use anyhow::Context;
use groovedb::server::{DatasetService, Server, ServerConfig};
use groovedb::{Database, EngineConfig};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let args: Vec<String> = env::args().collect();
    let mut config = ServerConfig::new();
    let mut data_dir = String::from("groovedb-data");

    // Simple argument parsing
    for i in 1..args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                if let Some(port) = args.get(i + 1) {
                    config = config.port(port.parse().context("invalid --port")?);
                }
            }
            "--host" => {
                if let Some(host) = args.get(i + 1) {
                    config = config.host(host.clone());
                }
            }
            "--data-dir" | "-d" => {
                if let Some(dir) = args.get(i + 1) {
                    data_dir = dir.clone();
                }
            }
            _ => {}
        }
    }

    let engine = EngineConfig::new(&data_dir);
    let db = Arc::new(
        Database::open(engine)
            .with_context(|| format!("failed to open database in {}", data_dir))?,
    );
    let service = Arc::new(DatasetService::new(db.clone()));
    let server = Server::new(config, service);

    server
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server error")?;

    db.shutdown().context("failed to flush buffered rows")?;
    Ok(())
}

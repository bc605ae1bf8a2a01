// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use thl_node::api::build_router;
use thl_node::config::ThlConfig;
use thl_node::storage::StorageBackend;
use thl_node::telemetry;
use thl_node::thl::Thl;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    telemetry::init_telemetry();

    if let Err(e) = run().await {
        tracing::error!("Log service failed: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> thl::Result<()> {
    let cfg = ThlConfig::from_env()?;
    tracing::info!("Initializing log service with config: {:?}", cfg);

    let backend = StorageBackend::from_config(&cfg);
    let thl = Thl::open(cfg.clone(), backend)?;
    let addr = thl.start_server().await?;
    tracing::info!("Log server listening on {}", addr);

    if let Some(http_addr) = cfg.http_addr {
        let app = build_router(thl.clone());
        let listener = TcpListener::bind(http_addr).await?;
        tracing::info!("Status endpoint listening on {}", http_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Status endpoint failed: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    thl.stop().await;
    Ok(())
}

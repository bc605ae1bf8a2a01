// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub const EVENTS_STORED: &str = "thl_events_stored_total";
pub const EVENTS_SENT: &str = "thl_events_sent_total";
pub const HEARTBEATS_SENT: &str = "thl_heartbeats_sent_total";
pub const CLIENTS_CONNECTED: &str = "thl_clients_connected";
pub const RECONNECT_ATTEMPTS: &str = "thl_reconnect_attempts_total";
pub const EVENTS_PURGED: &str = "thl_events_purged_total";
pub const PARALLEL_DISCARDED: &str = "thl_parallel_events_discarded_total";

/// Initialize telemetry (logs + metrics)
pub fn init_telemetry() {
    let installed = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "thl_node=info,thl=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
    if installed.is_err() {
        tracing::warn!("Tracing subscriber already installed");
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROM_HANDLE.set(handle).is_err() {
                tracing::warn!("Prometheus handle already set. Telemetry re-initialized?");
            }
        }
        Err(e) => {
            tracing::warn!("Failed to install Prometheus recorder: {}", e);
            return;
        }
    }

    metrics::describe_counter!(EVENTS_STORED, "Log fragments stored through the facade");
    metrics::describe_counter!(EVENTS_SENT, "Log fragments streamed to clients");
    metrics::describe_counter!(HEARTBEATS_SENT, "Heartbeats sent to idle clients");
    metrics::describe_gauge!(CLIENTS_CONNECTED, "Clients currently connected to the log server");
    metrics::describe_counter!(RECONNECT_ATTEMPTS, "Connection attempts by remote extractors");
    metrics::describe_counter!(EVENTS_PURGED, "Log rows removed by range purges");
    metrics::describe_counter!(
        PARALLEL_DISCARDED,
        "Events discarded by parallel readers because another partition owns them"
    );

    metrics::gauge!("thl_node_up", 1.0);
}

/// Get the Prometheus handle to render metrics
pub fn get_metrics() -> String {
    if let Some(handle) = PROM_HANDLE.get() {
        handle.render()
    } else {
        "# metrics not initialized".to_string()
    }
}

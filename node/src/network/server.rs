// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Log server: accepts clients and runs one handler task per connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use thl::error::Result;

use super::handler::ConnectionHandler;
use super::protocol::TcpProtocol;
use crate::config::ThlConfig;
use crate::cursor::LogSource;
use crate::telemetry;

pub struct Server {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    connected: Arc<AtomicUsize>,
}

impl Server {
    pub async fn start(source: LogSource, config: ThlConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Log server listening on {}", local_addr);

        let cancel = CancellationToken::new();
        let connected = Arc::new(AtomicUsize::new(0));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            source,
            config,
            cancel.clone(),
            connected.clone(),
        ));
        Ok(Self {
            local_addr,
            cancel,
            accept_task,
            connected,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connected_clients(&self) -> usize {
        self.connected.load(Ordering::Relaxed)
    }

    /// Cancels every handler, joins each within the configured timeout and
    /// closes the listener.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.accept_task.await {
            tracing::warn!("Log server accept task ended abnormally: {}", e);
        }
        tracing::info!("Log server on {} stopped", self.local_addr);
    }
}

struct ClientSlot {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

fn spawn_handler(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    source: &LogSource,
    config: &ThlConfig,
    cancel: CancellationToken,
    finished: mpsc::UnboundedSender<u64>,
) -> Result<JoinHandle<()>> {
    stream.set_nodelay(true)?;
    let protocol = TcpProtocol::from_tcp(stream, config.reset_period, config.buffer_size);
    let handler = ConnectionHandler::new(id, peer.to_string(), protocol, source.clone())?;
    Ok(tokio::spawn(handler.run(cancel, finished)))
}

async fn accept_loop(
    listener: TcpListener,
    source: LogSource,
    config: ThlConfig,
    cancel: CancellationToken,
    connected: Arc<AtomicUsize>,
) {
    let (finished_tx, mut finished_rx) = mpsc::unbounded_channel();
    let mut clients: HashMap<u64, ClientSlot> = HashMap::new();
    let mut next_id = 0u64;

    loop {
        while let Ok(id) = finished_rx.try_recv() {
            if let Some(slot) = clients.remove(&id) {
                let _ = slot.task.await;
                tracing::debug!("Reaped connection handler {}", id);
            }
        }
        connected.store(clients.len(), Ordering::Relaxed);
        metrics::gauge!(telemetry::CLIENTS_CONNECTED, clients.len() as f64);

        tokio::select! {
            _ = cancel.cancelled() => break,
            // Wake up to reap handlers even when nobody connects.
            Some(id) = finished_rx.recv() => {
                if let Some(slot) = clients.remove(&id) {
                    let _ = slot.task.await;
                    tracing::debug!("Reaped connection handler {}", id);
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    next_id += 1;
                    let token = cancel.child_token();
                    match spawn_handler(next_id, stream, peer, &source, &config, token.clone(), finished_tx.clone()) {
                        Ok(task) => {
                            clients.insert(next_id, ClientSlot { cancel: token, task });
                        }
                        Err(e) => tracing::error!("Failed to start handler for {}: {}", peer, e),
                    }
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }

    tracing::info!("Stopping {} connection handlers", clients.len());
    for slot in clients.values() {
        slot.cancel.cancel();
    }
    let timeout = config.handler_join_timeout;
    let joins = clients
        .drain()
        .map(|(id, slot)| join_or_abort(id, slot.task, timeout));
    futures::future::join_all(joins).await;
    connected.store(0, Ordering::Relaxed);
    metrics::gauge!(telemetry::CLIENTS_CONNECTED, 0.0);
    drop(listener);
}

/// Waits for a cancelled handler; one that overruns `timeout` is aborted.
async fn join_or_abort(id: u64, mut task: JoinHandle<()>, timeout: Duration) {
    if tokio::time::timeout(timeout, &mut task).await.is_err() {
        tracing::warn!("Connection handler {} did not stop within {:?}; aborting", id, timeout);
        task.abort();
    }
}

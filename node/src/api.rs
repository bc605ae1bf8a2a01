// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! HTTP status router.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use thl::error::{StorageError, ThlError};
use thl::event::{EventHeader, EventStatus, EventType};

use crate::errors::ApiError;
use crate::thl::{Thl, ThlStatus};

pub type SharedThl = Arc<Thl>;

#[derive(Serialize)]
pub struct EventSummary {
    #[serde(flatten)]
    pub header: EventHeader,
    pub event_type: EventType,
    pub status: EventStatus,
    pub comment: Option<String>,
    pub payload_len: usize,
}

pub fn build_router(state: SharedThl) -> Router {
    Router::new()
        .route("/v1/thl/status", get(status))
        .route("/v1/thl/events/:seqno", get(event))
        // Observability
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn status(State(thl): State<SharedThl>) -> Result<Json<ThlStatus>, ApiError> {
    Ok(Json(thl.status().await?))
}

async fn event(
    State(thl): State<SharedThl>,
    Path(seqno): Path<u64>,
) -> Result<Json<EventSummary>, ApiError> {
    let event = thl
        .admin()
        .find(seqno)?
        .ok_or_else(|| ThlError::from(StorageError::NotFound { seqno, fragno: 0 }))?;
    Ok(Json(EventSummary {
        header: event.header(),
        event_type: event.event_type,
        status: event.status,
        comment: event.comment.clone(),
        payload_len: event.payload.len(),
    }))
}

async fn metrics_handler() -> String {
    crate::telemetry::get_metrics()
}

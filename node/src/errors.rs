// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thl::error::{StorageError, ThlError};

/// `ThlError` as returned by the HTTP status router.
#[derive(Debug)]
pub struct ApiError(pub ThlError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ThlError::Storage(StorageError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ThlError::Storage(StorageError::DuplicateEntry { .. }) => StatusCode::CONFLICT,
            ThlError::Config(_) => StatusCode::BAD_REQUEST,
            ThlError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.0.to_string()
        }));

        (status, body).into_response()
    }
}

impl From<ThlError> for ApiError {
    fn from(e: ThlError) -> Self {
        ApiError(e)
    }
}

/// Attaches a description to SQLite failures and lifts them into `ThlError`.
pub trait SqlResultExt<T> {
    fn sql_context(self, context: &str) -> thl::Result<T>;
}

impl<T> SqlResultExt<T> for Result<T, rusqlite::Error> {
    fn sql_context(self, context: &str) -> thl::Result<T> {
        self.map_err(|e| ThlError::Storage(StorageError::backend(context, e)))
    }
}

//! Defines the HTTP surface of the store.
//!
//! ## Structure
//! - `POST /upload`         multipart upload, returns the one-time reference
//! - `GET  /d/{reference}`  redeem the reference and stream the payload
//! - `GET  /healthz`        liveness
//! - `GET  /readyz`         readiness (catalog + chunk storage)

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{download_object, upload_object},
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Upper bound the transport puts on a single upload body.
pub const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

/// Build and return the router, carrying `StorageService` as shared state.
pub fn routes() -> Router<StorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/upload",
            post(upload_object).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/d/{reference}", get(download_object))
}

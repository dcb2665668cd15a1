//! HTTP handlers for upload and one-time download.
//! Bodies are streamed in both directions; storage and lifecycle decisions
//! are delegated to `StorageService`.

use crate::{
    errors::AppError,
    models::object::ObjectEntry,
    services::storage_service::StorageService,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::io;

/// Multipart field carrying the payload.
const FILE_FIELD: &str = "file";
const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";
const FALLBACK_FILENAME: &str = "download";

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub id: String,
    pub reference: String,
    pub download_path: String,
    pub size_bytes: i64,
    pub content_type: String,
    pub original_name: String,
    pub expires_at: DateTime<Utc>,
}

impl UploadResponse {
    fn new(entry: &ObjectEntry, expires_at: DateTime<Utc>) -> Self {
        let reference = entry.id.to_reference();
        Self {
            id: entry.id.to_string(),
            download_path: format!("/d/{}", reference),
            reference,
            size_bytes: entry.size_bytes,
            content_type: entry.content_type.clone(),
            original_name: entry.original_name.clone(),
            expires_at,
        }
    }
}

/// `POST /upload`: multipart form with a single `file` field.
pub async fn upload_object(
    State(service): State<StorageService>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(err.body_text()))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let original_name = field.file_name().unwrap_or(FALLBACK_FILENAME).to_string();
        let content_type = field
            .content_type()
            .unwrap_or(FALLBACK_CONTENT_TYPE)
            .to_string();
        let stream = field.map(|chunk| chunk.map_err(io::Error::other));

        let entry = service
            .ingest(&content_type, &original_name, stream)
            .await?;
        let expires_at = service.policy.expires_at(&entry);

        return Ok((StatusCode::CREATED, Json(UploadResponse::new(&entry, expires_at))));
    }

    Err(AppError::bad_request("No file uploaded"))
}

/// `GET /d/{reference}`: stream the object once, then it is gone.
pub async fn download_object(
    State(service): State<StorageService>,
    Path(reference): Path<String>,
) -> Result<Response, AppError> {
    let delivery = service.redeem(&reference).await?;

    let mut response = Response::new(Body::from_stream(delivery.body));
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &delivery.entry);

    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &ObjectEntry) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(FALLBACK_CONTENT_TYPE)),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&meta.size_bytes.max(0).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    headers.insert(header::CONTENT_DISPOSITION, content_disposition(&meta.original_name));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
}

/// `attachment` disposition with an ASCII fallback name and the exact name
/// percent-encoded in `filename*`.
fn content_disposition(original_name: &str) -> HeaderValue {
    let name = if original_name.trim().is_empty() {
        FALLBACK_FILENAME
    } else {
        original_name
    };
    let ascii: String = name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() || c == ' ') && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let value = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii,
        urlencoding::encode(name)
    );
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

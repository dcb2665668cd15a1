//! Represents a one-time object and the reference used to redeem it.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Length of an encoded reference: 16 bytes in unpadded base64.
const REFERENCE_LEN: usize = 22;

/// Opaque object identifier.
///
/// Backed by a random UUID v4, so ids carry 122 random bits. The same value
/// keys the catalog row and groups the object's chunks on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct ObjectId(Uuid);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed object reference")]
pub struct InvalidReference;

impl ObjectId {
    /// Draw a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Shareable form: URL-safe base64 of the raw id bytes.
    pub fn to_reference(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0.as_bytes())
    }

    /// Parse an untrusted reference string.
    ///
    /// Accepts the 22-character base64 form produced by [`to_reference`](Self::to_reference)
    /// and the hyphenated UUID text. Everything else is rejected.
    pub fn parse_reference(input: &str) -> Result<Self, InvalidReference> {
        let input = input.trim();
        if input.len() == REFERENCE_LEN {
            let bytes = URL_SAFE_NO_PAD
                .decode(input)
                .map_err(|_| InvalidReference)?;
            let bytes: [u8; 16] = bytes.try_into().map_err(|_| InvalidReference)?;
            return Ok(Self(Uuid::from_bytes(bytes)));
        }
        if input.len() == 36 {
            return Uuid::parse_str(input).map(Self).map_err(|_| InvalidReference);
        }
        Err(InvalidReference)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Catalog entry for a single uploaded object.
///
/// Holds descriptive metadata only; the payload lives in the chunk store.
/// Lifecycle state is not stored here, see `services::lifecycle`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Identifier and redemption reference.
    pub id: ObjectId,

    /// Total payload size in bytes.
    pub size_bytes: i64,

    /// Declared content type, stored verbatim.
    pub content_type: String,

    /// Filename supplied by the uploader, stored verbatim.
    pub original_name: String,

    /// When ingest completed.
    pub created_at: DateTime<Utc>,

    /// Successful redemptions so far; never above 1.
    pub redemption_count: i64,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::records::FileRecord;

/// Response for a successful upload
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    /// Identifier of the new file
    pub id: String,
    /// Name the file is stored and served under
    pub filename: String,
    /// Public short link to the file
    pub url: String,
    pub original_name: String,
    /// Bytes received
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

impl UploadResponse {
    pub fn from_record(record: &FileRecord, url: String) -> Self {
        Self {
            success: true,
            id: record.id.clone(),
            filename: record.stored_filename.clone(),
            url,
            original_name: record.original_name.clone(),
            size: record.size,
            timestamp: record.upload_time,
        }
    }
}

/// Body of every error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    /// Underlying cause, present for storage failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

//! File metadata kept in the mapping document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Metadata describing one uploaded file.
///
/// Field names follow the JSON layout of existing mapping documents, so `stored_filename` is
/// written under the `filename` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Short random identifier, the key of this record in the mapping document
    pub id: String,
    /// Filename declared by the client. Untrusted, used for display and extension derivation only
    pub original_name: String,
    /// Lower-cased extension of `original_name`, or the configured fallback
    pub extension: String,
    /// Object name in the remote store: `{id}.{extension}`
    #[serde(rename = "filename")]
    pub stored_filename: String,
    /// When the upload was accepted
    pub upload_time: DateTime<Utc>,
    /// Number of bytes received by the server
    pub size: u64,
    /// Content type declared by the client. Untrusted
    pub mime_type: String,
}

/// Derive the stored extension from a client-supplied filename.
///
/// Takes the suffix after the last `.` of the final path component and lower-cases it. Names
/// without a usable extension (none, empty, dotfiles, or anything other than ASCII
/// alphanumerics) get `fallback`.
pub fn extension_of(original_name: &str, fallback: &str) -> String {
    std::path::Path::new(original_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| fallback.to_string())
}

/// The object name a file with this id and extension is stored under.
pub fn stored_filename(id: &str, extension: &str) -> String {
    format!("{id}.{extension}")
}

/// Candidate identifier for a requested filename: everything before the last `.`.
pub fn identifier_of(filename: &str) -> &str {
    match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => filename,
    }
}

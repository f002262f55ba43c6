use axum::{
    Json,
    extract::{
        Multipart, Path, State,
        multipart::{MultipartError, MultipartRejection},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use chrono::{SubsecRound, Utc};

use crate::AppState;
use crate::api::models::files::{ErrorResponse, UploadResponse};
use crate::errors::{Error, Result};
use crate::ids::{self, DEFAULT_ID_LENGTH};
use crate::records::{self, FileRecord};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

fn file_too_large(max_file_size: u64) -> Error {
    const MIB: u64 = 1024 * 1024;
    let limit = if max_file_size % MIB == 0 {
        format!("{}MB", max_file_size / MIB)
    } else {
        format!("{max_file_size} bytes")
    };
    Error::BadRequest {
        message: format!("File size exceeds {limit} limit"),
    }
}

fn no_file() -> Error {
    Error::BadRequest {
        message: "No file uploaded".to_string(),
    }
}

fn multipart_error(e: MultipartError, max_file_size: u64) -> Error {
    // The transport-level body limit surfaces as a multipart read failure
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return file_too_large(max_file_size);
    }
    Error::BadRequest {
        message: format!("Failed to parse multipart data: {e}"),
    }
}

fn file_not_found(id: &str) -> Error {
    Error::NotFound {
        resource: "File".to_string(),
        id: id.to_string(),
    }
}

#[utoipa::path(
    post,
    path = "/api/upload",
    tag = "files",
    summary = "Upload file",
    description = "Upload a single file in the `file` field of a multipart form. The file is stored in the configured \
                   repository and served under the returned short link.",
    request_body(content_type = "multipart/form-data", description = "Form with a `file` field"),
    responses(
        (status = 200, description = "File uploaded successfully", body = UploadResponse),
        (status = 400, description = "No file in the request, or the file exceeds the size limit", body = ErrorResponse),
        (status = 500, description = "Storing the file or its record failed", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip_all)]
pub async fn upload_file(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>> {
    let max_file_size = state.config.upload.max_file_size;
    let mut multipart = multipart.map_err(|e| {
        tracing::debug!("Rejected multipart request: {}", e);
        no_file()
    })?;

    // Skip over any fields before the file
    let mut field = loop {
        match multipart.next_field().await.map_err(|e| multipart_error(e, max_file_size))? {
            Some(field) if field.name() == Some("file") && field.file_name().is_some() => break field,
            Some(_) => continue,
            None => return Err(no_file()),
        }
    };

    let original_name = field.file_name().unwrap_or_default().to_string();
    let mime_type = field.content_type().unwrap_or(DEFAULT_MIME_TYPE).to_string();

    // Buffer the file, failing as soon as it crosses the limit so nothing oversized is stored
    let mut content = BytesMut::new();
    while let Some(chunk) = field.chunk().await.map_err(|e| multipart_error(e, max_file_size))? {
        if (content.len() + chunk.len()) as u64 > max_file_size {
            tracing::warn!(
                original_name = %original_name,
                received = content.len() + chunk.len(),
                max_file_size,
                "File size limit exceeded, aborting upload"
            );
            return Err(file_too_large(max_file_size));
        }
        content.extend_from_slice(&chunk);
    }
    let size = content.len() as u64;

    let id = ids::generate(DEFAULT_ID_LENGTH);
    let extension = records::extension_of(&original_name, &state.config.upload.fallback_extension);
    let stored_filename = records::stored_filename(&id, &extension);

    // An unreadable mapping would leave the file orphaned, so find out before writing it
    state
        .mappings
        .load()
        .await
        .map_err(|e| Error::store("Upload failed", e))?;

    tracing::info!(id = %id, original_name = %original_name, size, mime_type = %mime_type, "Storing upload");

    state
        .store
        .write_object(
            &stored_filename,
            content.freeze(),
            &format!("Upload: {original_name} -> {stored_filename}"),
            None,
        )
        .await
        .map_err(|e| Error::store("Upload failed", e))?;

    let record = FileRecord {
        id,
        original_name,
        extension,
        stored_filename,
        upload_time: Utc::now().trunc_subsecs(3),
        size,
        mime_type,
    };

    // A conflict that outlasts every retry still orphans the file object
    state
        .mappings
        .insert(record.clone())
        .await
        .map_err(|e| Error::store("Upload failed", e))?;

    let url = state.config.upload.public_url(&record.stored_filename);
    Ok(Json(UploadResponse::from_record(&record, url)))
}

#[utoipa::path(
    get,
    path = "/{filename}",
    tag = "files",
    summary = "Open file",
    description = "Redirect to the raw content of an uploaded file. The identifier is the filename without its extension.",
    params(("filename" = String, Path, description = "Stored filename, e.g. `a1b2c3d4.png`")),
    responses(
        (status = 302, description = "Redirect to the raw file content", headers(("Location" = String))),
        (status = 404, description = "No file with this identifier", body = ErrorResponse),
        (status = 500, description = "Reading the file mapping failed", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state))]
pub async fn redirect_to_file(State(state): State<AppState>, Path(filename): Path<String>) -> Result<Response> {
    let id = records::identifier_of(&filename);

    let record = state
        .mappings
        .get(id)
        .await
        .map_err(|e| Error::store("File retrieval failed", e))?;
    if record.is_none() {
        return Err(file_not_found(id));
    }

    let location = state.store.raw_url(&filename);
    tracing::debug!(location = %location, "Redirecting to raw content");
    Ok((StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response())
}

#[utoipa::path(
    get,
    path = "/api/info/{id}",
    tag = "files",
    summary = "Get file info",
    params(("id" = String, Path, description = "File identifier")),
    responses(
        (status = 200, description = "Metadata of the file", body = FileRecord),
        (status = 404, description = "No file with this identifier", body = ErrorResponse),
        (status = 500, description = "Reading the file mapping failed", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state))]
pub async fn get_file_info(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<FileRecord>> {
    state
        .mappings
        .get(&id)
        .await
        .map_err(|e| Error::store("Failed to get file info", e))?
        .map(Json)
        .ok_or_else(|| file_not_found(&id))
}

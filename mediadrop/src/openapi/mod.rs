//! OpenAPI document for the relay, served at `/api-docs/openapi.json` and rendered at `/docs`.

use utoipa::OpenApi;

use crate::api;
use crate::records::FileRecord;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "mediadrop",
        description = "Upload files into a GitHub repository and share them through short links."
    ),
    paths(
        api::handlers::files::upload_file,
        api::handlers::files::get_file_info,
        api::handlers::files::redirect_to_file,
        api::handlers::health::health,
    ),
    components(schemas(
        FileRecord,
        api::models::files::UploadResponse,
        api::models::files::ErrorResponse,
        api::models::health::HealthResponse,
    )),
    tags(
        (name = "files", description = "Uploading and resolving files"),
        (name = "health", description = "Liveness"),
    )
)]
pub struct ApiDoc;

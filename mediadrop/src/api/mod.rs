//! HTTP surface of the relay.
//!
//! - **[`handlers`]**: axum route handlers
//! - **[`models`]**: response bodies
//!
//! | Route | Handler |
//! |---|---|
//! | `POST /api/upload` | [`handlers::files::upload_file`] |
//! | `GET /api/info/{id}` | [`handlers::files::get_file_info`] |
//! | `GET /{filename}` | [`handlers::files::redirect_to_file`] |
//! | `GET /health` | [`handlers::health::health`] |
//!
//! The OpenAPI document is served at `/api-docs/openapi.json` with a browsable reference at
//! `/docs`.

pub mod handlers;
pub mod models;

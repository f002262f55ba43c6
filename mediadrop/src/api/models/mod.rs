//! Response bodies, annotated with `utoipa` for the OpenAPI document.

pub mod files;
pub mod health;

//! Route handlers.
//!
//! Handlers return [`crate::errors::Result`], so every failure reaches the client as a JSON body
//! of the form `{"error": ...}` with the matching status code.

pub mod files;
pub mod health;

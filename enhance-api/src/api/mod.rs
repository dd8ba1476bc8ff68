//! HTTP layer.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Request/response shapes used in the OpenAPI document
//!
//! The service exposes a single functional endpoint, `POST /enhance`. API documentation is
//! available at `/docs` when the server is running.

pub mod handlers;
pub mod models;

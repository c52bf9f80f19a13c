//! HTTP route handlers for the retrace server.

pub mod replay;
pub mod shadow;
pub mod traces;

/// Health check endpoint.
pub async fn health() -> &'static str {
    "OK"
}

/**
 * Routes Module
 * API route handlers
 */
use serde::{Deserialize, Serialize};

pub mod admin;
pub mod health;
pub mod subscribe;
pub mod webhook;

/// Error response shared by every handler
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

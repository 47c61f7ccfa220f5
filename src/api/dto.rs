//! Data Transfer Objects
//!
//! Response bodies for the HTTP endpoints.

use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Live WebSocket connections
    pub connections: usize,
    pub uptime_secs: u64,
}

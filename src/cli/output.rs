//! CLI output: error mapping from gateway errors to stable CLI surface.

use crate::error::GatewayError;

/// Map gateway errors to a string for CLI output.
/// Capacity failures carry a retry hint so they read differently from backend rejections.
pub fn map_error(e: &GatewayError) -> String {
    if e.is_retry_later() {
        format!("{} (gateway at capacity, try again later)", e)
    } else {
        e.to_string()
    }
}

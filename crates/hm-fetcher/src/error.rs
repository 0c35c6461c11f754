//! Fetch cycle failures.

use std::time::Duration;

use hm_core::BusError;
use hm_state::StateError;
use thiserror::Error;

use crate::http::BoxError;

/// Why a fetch cycle ended without a complete snapshot.
///
/// Every variant ends the cycle: no further pages are requested and
/// freshness is left alone.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to request authentication info: {0}")]
    AuthRequest(#[source] BusError),

    #[error("Timed out waiting for authentication info after {0:?}")]
    AuthTimeout(Duration),

    #[error("Failed to parse authentication info from JSON: {0}")]
    AuthParse(#[source] serde_json::Error),

    #[error("Failed to generate URL request: {0}")]
    UrlConstruction(String),

    #[error("HTTP request failed with error: {0}")]
    HttpTransport(#[source] BoxError),

    #[error("HTTP request received unauthorized response code")]
    Unauthorized,

    #[error("HTTP request received non-200 response ({0})")]
    UnexpectedStatus(u16),

    #[error("Failed to read HTTP response body: {0}")]
    BodyRead(#[source] BoxError),

    #[error("Failed to parse HTTP response body JSON: {0}")]
    BodyParse(#[source] serde_json::Error),

    #[error("Failed to store desired state in store: {0}")]
    StoreWrite(#[source] StateError),

    #[error("Failed to bump desired state freshness: {0}")]
    FreshnessBump(#[source] StateError),
}

impl FetchError {
    /// Fixed human-readable summary, without the underlying cause.
    pub fn message(&self) -> String {
        match self {
            FetchError::AuthRequest(_) => "Failed to request authentication info".to_string(),
            FetchError::AuthTimeout(_) => "Timed out waiting for authentication info".to_string(),
            FetchError::AuthParse(_) => {
                "Failed to parse authentication info from JSON".to_string()
            }
            FetchError::UrlConstruction(_) => "Failed to generate URL request".to_string(),
            FetchError::HttpTransport(_) => "HTTP request failed with error".to_string(),
            FetchError::Unauthorized => {
                "HTTP request received unauthorized response code".to_string()
            }
            FetchError::UnexpectedStatus(code) => {
                format!("HTTP request received non-200 response ({code})")
            }
            FetchError::BodyRead(_) => "Failed to read HTTP response body".to_string(),
            FetchError::BodyParse(_) => "Failed to parse HTTP response body JSON".to_string(),
            FetchError::StoreWrite(_) => "Failed to store desired state in store".to_string(),
            FetchError::FreshnessBump(_) => {
                "Failed to bump desired state freshness".to_string()
            }
        }
    }
}

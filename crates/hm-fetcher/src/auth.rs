//! Credentials for the bulk API.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// Reply payload of the credentials request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuthInfo {
    pub user: String,
    pub password: String,
}

impl BasicAuthInfo {
    /// `Authorization` header value.
    pub fn encode(&self) -> String {
        let raw = format!("{}:{}", self.user, self.password);
        format!("Basic {}", STANDARD.encode(raw))
    }
}

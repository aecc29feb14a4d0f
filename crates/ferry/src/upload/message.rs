use serde::{Deserialize, Serialize};

use crate::error::FerryError;

/// First message of a session, sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerCapabilities {
    /// Largest frame (header included) the server accepts.
    pub buffer_size: usize,
}

impl ServerCapabilities {
    pub fn parse(text: &str) -> Result<Self, FerryError> {
        serde_json::from_str(text).map_err(|e| {
            FerryError::protocol("handshake", format!("invalid capabilities message: {e}"))
        })
    }
}

/// Client reply naming the upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadDescriptor {
    pub file_name: String,
    /// `None` for live or otherwise unbounded sources; serialised as `null`.
    pub total_file_size: Option<u64>,
    pub buffer_size: usize,
}

impl UploadDescriptor {
    pub fn to_json(&self) -> Result<String, FerryError> {
        serde_json::to_string(self)
            .map_err(|e| FerryError::protocol("handshake", format!("cannot encode descriptor: {e}")))
    }
}

use serde::{Deserialize, Serialize};

use crate::storage::types::MediaKind;

/// Error payload returned with every non-2xx response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub participant_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub participant_id: String,
}

/// Query string of a recording upload.
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadQuery {
    pub kind: MediaKind,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ListQuery {
    pub submitted: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub removed_recordings: usize,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::SessionId;

/// Options posted alongside the files on `POST /upload`. The server expects
/// them as plain form fields, `use_gpu` included, so everything serializes
/// to strings on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSettings {
    pub ocr_languages: String,
    pub target_language: String,
    pub use_gpu: bool,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            ocr_languages: "en".to_string(),
            target_language: "Japanese".to_string(),
            use_gpu: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub session_id: SessionId,
    pub file_count: u32,
}

/// One translated artifact as reported by the server. `original_url` is
/// optional on the wire: older servers only send `download_url` and leave
/// the client to derive the uploaded image's location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadLink {
    pub original_name: String,
    pub download_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Body of `GET /output/{session_id}`, the legacy results listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputListing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub files: Vec<DownloadLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Incremental progress for the active session. Every field except the
/// session id is optional; absent fields leave the previous displayed
/// value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_files: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

/// Events pushed by the server over the websocket channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Progress(ProgressUpdate),
    ProcessingComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default)]
        download_links: Vec<DownloadLink>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_folder: Option<String>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        message: String,
    },
}

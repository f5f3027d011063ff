use serde::{Deserialize, Serialize};

/// Event names an upload channel emits over its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadEventType {
    LoadStart,
    Progress,
    Abort,
    Error,
    Load,
    Timeout,
    LoadEnd,
}

impl UploadEventType {
    pub const ALL: [UploadEventType; 7] = [
        UploadEventType::LoadStart,
        UploadEventType::Progress,
        UploadEventType::Abort,
        UploadEventType::Error,
        UploadEventType::Load,
        UploadEventType::Timeout,
        UploadEventType::LoadEnd,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UploadEventType::LoadStart => "loadstart",
            UploadEventType::Progress => "progress",
            UploadEventType::Abort => "abort",
            UploadEventType::Error => "error",
            UploadEventType::Load => "load",
            UploadEventType::Timeout => "timeout",
            UploadEventType::LoadEnd => "loadend",
        }
    }
}

/// Progress notification handed to upload listeners.
///
/// Serialises into (and parses from) the shape scripts observe on the event
/// object.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub length_computable: bool,
    pub loaded: u64,
    pub total: u64,
}

impl ProgressEvent {
    pub fn new(event_type: impl Into<String>, loaded: u64, total: u64) -> Self {
        Self {
            event_type: event_type.into(),
            length_computable: total > 0,
            loaded,
            total,
        }
    }

    pub fn simple(event_type: impl Into<String>) -> Self {
        Self::new(event_type, 0, 0)
    }

    pub fn upload(kind: UploadEventType, loaded: u64, total: u64) -> Self {
        Self::new(kind.as_str(), loaded, total)
    }
}

use serde::{Deserialize, Serialize};

use crate::snapshot::diff::SnapshotDiff;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub String);

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque correlation id, assigned when a request is sent and carried by
/// every later event of that request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One operation performed against a browser session (or one outgoing HTTP
/// call on the API path). Only `end_time` and `error` change, and only on
/// completion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionMetadata {
    pub id: ActionId,
    #[serde(rename = "type")]
    pub kind: String,
    pub method: String,
    pub title: String,
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub error: Option<ErrorDescriptor>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub message: String,
}

impl ErrorDescriptor {
    pub fn new(message: impl Into<String>) -> Self {
        ErrorDescriptor {
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleMessage {
    pub level: String,
    pub text: String,
    pub timestamp: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestOutcome {
    Completed,
    Failed,
    /// The owning action finished before the request did.
    Pending,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceCategory {
    Api,
    Document,
    Static,
    Other,
}

impl ResourceCategory {
    pub fn from_resource_type(resource_type: &str) -> Self {
        match resource_type.to_ascii_lowercase().as_str() {
            "xhr" | "fetch" => ResourceCategory::Api,
            "document" => ResourceCategory::Document,
            "script" | "stylesheet" | "image" | "font" | "media" => {
                ResourceCategory::Static
            }
            _ => ResourceCategory::Other,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequestRecord {
    #[serde(skip)]
    pub request_id: Option<RequestId>,
    pub method: String,
    pub url: String,
    pub host: Option<String>,
    pub path: String,
    pub status: Option<u16>,
    pub status_text: String,
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub duration: Option<u64>,
    pub category: ResourceCategory,
    pub resource_type: String,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    pub outcome: RequestOutcome,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkCapture {
    pub requests: Vec<NetworkRequestRecord>,
    pub summary: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotCapture {
    pub before: Option<String>,
    pub after: Option<String>,
    pub diff: Option<SnapshotDiff>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStart {
    pub id: ActionId,
    pub action_type: String,
    pub method: String,
    pub title: String,
    pub start_time: u64,
}

impl From<&ActionMetadata> for ActionStart {
    fn from(metadata: &ActionMetadata) -> Self {
        ActionStart {
            id: metadata.id.clone(),
            action_type: metadata.kind.clone(),
            method: metadata.method.clone(),
            title: metadata.title.clone(),
            start_time: metadata.start_time,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionCapture {
    pub id: ActionId,
    pub action_type: String,
    pub method: String,
    pub title: String,
    pub start_time: u64,
    pub end_time: u64,
    pub duration: u64,
    pub network: NetworkCapture,
    pub console: Vec<ConsoleMessage>,
    pub snapshot: SnapshotCapture,
    pub page_url: Option<String>,
    pub error: Option<ErrorDescriptor>,
}

/// The unit delivered to the collector. A `Start` for an action id always
/// precedes its `Capture`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CaptureEvent {
    #[serde(rename = "action:start")]
    Start(ActionStart),
    #[serde(rename = "action:capture")]
    Capture(Box<ActionCapture>),
}

impl CaptureEvent {
    pub fn action_id(&self) -> &ActionId {
        match self {
            CaptureEvent::Start(start) => &start.id,
            CaptureEvent::Capture(capture) => &capture.id,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<'a> {
    pub session_id: &'a str,
    pub timestamp: u64,
    #[serde(flatten)]
    pub event: &'a CaptureEvent,
}

#[derive(Serialize)]
pub struct Payload<'a> {
    pub events: Vec<Envelope<'a>>,
}

use std::future::Future;

use anyhow::Result;
use tokio::sync::oneshot;

use crate::event::{
    ActionId, ActionMetadata, ConsoleMessage, ErrorDescriptor, RequestId,
};

/// Notifications the automation runtime delivers to the capture engine.
/// Action events come from the before/after hooks around each operation,
/// the rest from the browser session.
#[derive(Debug)]
pub enum FeedEvent {
    /// `ready` fires once the before-snapshot is taken, or the action has
    /// been ignored. The operation must not run before that.
    ActionStarted {
        metadata: ActionMetadata,
        ready: Option<oneshot::Sender<()>>,
    },
    ActionEnded {
        id: ActionId,
        end_time: u64,
        error: Option<ErrorDescriptor>,
    },
    RequestSent(RequestSent),
    ResponseReceived(ResponseReceived),
    RequestFinished {
        request: RequestId,
        timestamp: u64,
    },
    RequestFailed {
        request: RequestId,
        timestamp: u64,
        error_text: String,
    },
    Console(ConsoleMessage),
    /// A response body fetched after its request finished.
    ResponseBody {
        request: RequestId,
        body: String,
    },
}

#[derive(Clone, Debug)]
pub struct RequestSent {
    pub request: RequestId,
    pub method: String,
    pub url: String,
    pub resource_type: String,
    pub post_data: Option<String>,
    pub timestamp: u64,
}

#[derive(Clone, Debug)]
pub struct ResponseReceived {
    pub request: RequestId,
    pub status: u16,
    pub status_text: String,
    pub content_type: Option<String>,
}

/// The live page an action runs against.
pub trait PageHandle: Send + Sync + 'static {
    /// Textual accessibility-tree snapshot of the page.
    fn accessibility_snapshot(
        &self,
    ) -> impl Future<Output = Result<String>> + Send;

    fn url(&self) -> impl Future<Output = Option<String>> + Send;

    fn response_body(
        &self,
        request: &RequestId,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

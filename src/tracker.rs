use std::collections::HashMap;
use std::sync::Arc;

use tokio::time::timeout;

use crate::body::truncate;
use crate::config::CaptureOptions;
use crate::emitter::EventSink;
use crate::event::{
    ActionCapture, ActionId, ActionMetadata, CaptureEvent, ConsoleMessage,
    ErrorDescriptor, NetworkCapture, RequestId, SnapshotCapture,
};
use crate::feed::{FeedEvent, PageHandle};
use crate::network::{NetworkAccumulator, summarize};
use crate::snapshot::{capture_snapshot, diff};

/// Runtime objects whose calls are plumbing, never user actions.
const INTERNAL_KINDS: &[&str] = &[
    "Artifact",
    "BindingCall",
    "JsonPipe",
    "LocalUtils",
    "Playwright",
    "Selectors",
    "Stream",
    "Tracing",
    "WritableStream",
];

/// Calls that only read page state.
const QUERY_METHODS: &[&str] = &[
    "ariaSnapshot",
    "boundingBox",
    "content",
    "evaluateExpression",
    "evaluateExpressionHandle",
    "getAttribute",
    "innerHTML",
    "innerText",
    "inputValue",
    "isChecked",
    "isDisabled",
    "isEditable",
    "isEnabled",
    "isHidden",
    "isVisible",
    "querySelector",
    "querySelectorAll",
    "queryCount",
    "screenshot",
    "textContent",
    "title",
    "url",
    "waitForEventInfo",
];

pub fn is_tracked(action: &ActionMetadata) -> bool {
    !INTERNAL_KINDS.contains(&action.kind.as_str())
        && !QUERY_METHODS.contains(&action.method.as_str())
}

/// Accumulated state of one open action. Exists from the action's start
/// until its completion, and only there.
#[derive(Debug)]
struct PendingAction {
    metadata: ActionMetadata,
    console: Vec<ConsoleMessage>,
    network: NetworkAccumulator,
    before: Option<String>,
}

/// Correlates the feed into one `start` and one `capture` event per tracked
/// action. Several actions may be open at once; network and console events
/// are applied to all of them.
pub struct ActionTracker<P: PageHandle> {
    page: Arc<P>,
    sink: Arc<dyn EventSink>,
    options: CaptureOptions,
    pending: HashMap<ActionId, PendingAction>,
}

impl<P: PageHandle> ActionTracker<P> {
    pub fn new(
        page: Arc<P>,
        sink: Arc<dyn EventSink>,
        options: CaptureOptions,
    ) -> Self {
        ActionTracker {
            page,
            sink,
            options,
            pending: HashMap::new(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Applies one feed event. Returns a request whose response body should
    /// now be fetched and fed back as `FeedEvent::ResponseBody`.
    pub async fn process(&mut self, event: FeedEvent) -> Option<RequestId> {
        match event {
            FeedEvent::ActionStarted { metadata, ready } => {
                self.action_started(metadata).await;
                if let Some(ready) = ready {
                    let _ = ready.send(());
                }
                None
            }
            FeedEvent::ActionEnded {
                id,
                end_time,
                error,
            } => {
                self.action_ended(&id, end_time, error).await;
                None
            }
            FeedEvent::RequestSent(event) => {
                let limit = self.options.request_body_limit;
                for pending in self.pending.values_mut() {
                    pending.network.request_sent(&event, limit);
                }
                None
            }
            FeedEvent::ResponseReceived(event) => {
                for pending in self.pending.values_mut() {
                    pending.network.response_received(&event);
                }
                None
            }
            FeedEvent::RequestFinished { request, timestamp } => {
                let mut wants_body = false;
                for pending in self.pending.values_mut() {
                    wants_body |=
                        pending.network.request_finished(&request, timestamp);
                }
                wants_body.then_some(request)
            }
            FeedEvent::RequestFailed {
                request,
                timestamp,
                error_text,
            } => {
                for pending in self.pending.values_mut() {
                    pending
                        .network
                        .request_failed(&request, timestamp, &error_text);
                }
                None
            }
            FeedEvent::Console(message) => {
                for pending in self.pending.values_mut() {
                    pending.console.push(message.clone());
                }
                None
            }
            FeedEvent::ResponseBody { request, body } => {
                let body = truncate(&body, self.options.response_body_limit);
                for pending in self.pending.values_mut() {
                    pending.network.attach_response_body(&request, &body);
                }
                None
            }
        }
    }

    async fn action_started(&mut self, metadata: ActionMetadata) {
        if !is_tracked(&metadata) {
            log::debug!(
                "not tracking {}.{} ({})",
                metadata.kind,
                metadata.method,
                metadata.id
            );
            return;
        }
        if self.pending.contains_key(&metadata.id) {
            log::warn!("action {} started twice, ignoring", metadata.id);
            return;
        }

        let id = metadata.id.clone();
        log::debug!("action {} started: {}", id, metadata.title);
        self.sink.send(CaptureEvent::Start((&metadata).into()));
        // Registered before awaiting the snapshot so traffic caused while
        // it is taken is attributed.
        self.pending.insert(
            id.clone(),
            PendingAction {
                metadata: metadata.clone(),
                console: Vec::new(),
                network: NetworkAccumulator::default(),
                before: None,
            },
        );

        let before = capture_snapshot(
            self.page.as_ref(),
            &metadata,
            self.options.snapshot_timeout,
        )
        .await;
        if let Some(pending) = self.pending.get_mut(&id) {
            pending.before = before;
        }
    }

    async fn action_ended(
        &mut self,
        id: &ActionId,
        end_time: u64,
        error: Option<ErrorDescriptor>,
    ) {
        let Some(PendingAction {
            mut metadata,
            console,
            network,
            before,
        }) = self.pending.remove(id)
        else {
            log::debug!("completion of untracked action {}", id);
            return;
        };
        metadata.end_time = Some(end_time);
        metadata.error = error;

        let after = capture_snapshot(
            self.page.as_ref(),
            &metadata,
            self.options.snapshot_timeout,
        )
        .await;
        let page_url = timeout(self.options.snapshot_timeout, self.page.url())
            .await
            .ok()
            .flatten();

        let requests = network.into_records();
        let summary = summarize(&requests);
        let diff = diff::diff(
            before.as_deref(),
            after.as_deref(),
            self.options.diff_line_cap,
        );

        log::debug!(
            "action {} captured: {} request(s), {} console message(s)",
            id,
            requests.len(),
            console.len()
        );

        self.sink.send(CaptureEvent::Capture(Box::new(ActionCapture {
            id: metadata.id,
            action_type: metadata.kind,
            method: metadata.method,
            title: metadata.title,
            start_time: metadata.start_time,
            end_time,
            duration: end_time.saturating_sub(metadata.start_time),
            network: NetworkCapture { requests, summary },
            console,
            snapshot: SnapshotCapture {
                before,
                after,
                diff,
            },
            page_url,
            error: metadata.error,
        })));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::ChannelSink;
    use crate::event::{ActionCapture, RequestOutcome};
    use crate::feed::{RequestSent, ResponseReceived};
    use anyhow::{Result, anyhow};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct ScriptedPage {
        snapshots: Mutex<VecDeque<Option<String>>>,
    }

    impl ScriptedPage {
        fn new(snapshots: &[Option<&str>]) -> Arc<Self> {
            Arc::new(ScriptedPage {
                snapshots: Mutex::new(
                    snapshots
                        .iter()
                        .map(|snapshot| snapshot.map(str::to_string))
                        .collect(),
                ),
            })
        }
    }

    impl PageHandle for ScriptedPage {
        async fn accessibility_snapshot(&self) -> Result<String> {
            self.snapshots
                .lock()
                .unwrap()
                .pop_front()
                .flatten()
                .ok_or(anyhow!("page unavailable"))
        }

        async fn url(&self) -> Option<String> {
            Some("http://shop.test/cart".to_string())
        }

        async fn response_body(&self, _request: &RequestId) -> Result<Vec<u8>> {
            Err(anyhow!("not used"))
        }
    }

    fn tracker(
        page: Arc<ScriptedPage>,
    ) -> (ActionTracker<ScriptedPage>, UnboundedReceiver<CaptureEvent>) {
        let (sink, receiver) = ChannelSink::new();
        let options = CaptureOptions {
            response_body_limit: 8,
            ..CaptureOptions::default()
        };
        (ActionTracker::new(page, Arc::new(sink), options), receiver)
    }

    fn metadata(id: &str, kind: &str, method: &str, at: u64) -> ActionMetadata {
        ActionMetadata {
            id: ActionId(id.to_string()),
            kind: kind.to_string(),
            method: method.to_string(),
            title: format!("{} {}", kind, method),
            start_time: at,
            end_time: None,
            error: None,
        }
    }

    fn started(id: &str, kind: &str, method: &str, at: u64) -> FeedEvent {
        FeedEvent::ActionStarted {
            metadata: metadata(id, kind, method, at),
            ready: None,
        }
    }

    fn ended(id: &str, at: u64) -> FeedEvent {
        FeedEvent::ActionEnded {
            id: ActionId(id.to_string()),
            end_time: at,
            error: None,
        }
    }

    fn request_sent(id: &str, url: &str, at: u64) -> FeedEvent {
        FeedEvent::RequestSent(RequestSent {
            request: RequestId(id.to_string()),
            method: "GET".to_string(),
            url: url.to_string(),
            resource_type: "Fetch".to_string(),
            post_data: None,
            timestamp: at,
        })
    }

    fn finished(id: &str, at: u64) -> FeedEvent {
        FeedEvent::RequestFinished {
            request: RequestId(id.to_string()),
            timestamp: at,
        }
    }

    fn drain(
        receiver: &mut UnboundedReceiver<CaptureEvent>,
    ) -> Vec<CaptureEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    fn capture_of(event: &CaptureEvent) -> &ActionCapture {
        match event {
            CaptureEvent::Capture(capture) => capture,
            other => panic!("expected capture, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_precedes_capture_with_diff() {
        let page = ScriptedPage::new(&[
            Some("button 'Add to Cart'"),
            Some("button 'Add to Cart'\ndialog 'Confirm Purchase'"),
        ]);
        let (mut tracker, mut events) = tracker(page);

        tracker.process(started("call@1", "Frame", "click", 10)).await;
        tracker.process(ended("call@1", 35)).await;

        let events = drain(&mut events);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            CaptureEvent::Start(start) if start.id.0 == "call@1"
        ));
        let capture = capture_of(&events[1]);
        assert_eq!(capture.id.0, "call@1");
        assert_eq!(capture.duration, 25);
        assert_eq!(capture.page_url.as_deref(), Some("http://shop.test/cart"));
        let diff = capture.snapshot.diff.as_ref().unwrap();
        assert_eq!(diff.added, vec!["dialog 'Confirm Purchase'"]);
        assert!(diff.removed.is_empty());
        assert_eq!(diff.summary, "1 added");
        assert_eq!(capture.network.summary, "no network activity");
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ready_fires_after_before_snapshot() {
        let page = ScriptedPage::new(&[Some("button 'Buy'")]);
        let (mut tracker, _events) = tracker(page.clone());

        let (ready, mut ready_receiver) = tokio::sync::oneshot::channel();
        tracker
            .process(FeedEvent::ActionStarted {
                metadata: metadata("call@1", "Frame", "click", 0),
                ready: Some(ready),
            })
            .await;
        assert_eq!(ready_receiver.try_recv(), Ok(()));
        assert!(page.snapshots.lock().unwrap().is_empty());

        let (ready, mut ready_receiver) = tokio::sync::oneshot::channel();
        tracker
            .process(FeedEvent::ActionStarted {
                metadata: metadata("call@2", "Frame", "innerText", 1),
                ready: Some(ready),
            })
            .await;
        assert_eq!(ready_receiver.try_recv(), Ok(()));
    }

    #[tokio::test]
    async fn test_query_methods_are_never_emitted() {
        let page = ScriptedPage::new(&[]);
        let (mut tracker, mut events) = tracker(page);

        tracker.process(started("call@1", "Frame", "textContent", 0)).await;
        tracker.process(ended("call@1", 1)).await;
        tracker.process(started("call@2", "Tracing", "tracingStart", 0)).await;
        tracker.process(ended("call@2", 1)).await;

        assert!(drain(&mut events).is_empty());
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_actions_share_requests() {
        let page = ScriptedPage::new(&[]);
        let (mut tracker, mut events) = tracker(page);

        tracker.process(started("call@1", "Frame", "goto", 0)).await;
        tracker.process(started("call@2", "Frame", "click", 5)).await;
        tracker
            .process(request_sent("r1", "http://shop.test/api/cart", 6))
            .await;
        tracker
            .process(FeedEvent::ResponseReceived(ResponseReceived {
                request: RequestId("r1".to_string()),
                status: 200,
                status_text: "OK".to_string(),
                content_type: Some("application/json".to_string()),
            }))
            .await;
        let wanted = tracker.process(finished("r1", 20)).await;
        assert_eq!(wanted, Some(RequestId("r1".to_string())));
        tracker
            .process(FeedEvent::ResponseBody {
                request: RequestId("r1".to_string()),
                body: r#"{"items":[1,2,3]}"#.to_string(),
            })
            .await;
        tracker.process(ended("call@2", 30)).await;
        tracker.process(ended("call@1", 40)).await;

        let events = drain(&mut events);
        let captures = events
            .iter()
            .filter(|event| matches!(event, CaptureEvent::Capture(_)))
            .map(capture_of)
            .collect::<Vec<_>>();
        assert_eq!(captures.len(), 2);
        for capture in captures {
            assert_eq!(capture.network.requests.len(), 1);
            let request = &capture.network.requests[0];
            assert_eq!(request.status, Some(200));
            assert_eq!(request.outcome, RequestOutcome::Completed);
            assert_eq!(request.response_body.as_deref(), Some(r#"{"items""#));
        }
    }

    #[tokio::test]
    async fn test_unfinished_request_is_flushed_as_pending() {
        let page = ScriptedPage::new(&[]);
        let (mut tracker, mut events) = tracker(page);

        tracker.process(started("call@1", "Frame", "click", 0)).await;
        tracker
            .process(request_sent("r1", "http://shop.test/api/slow", 2))
            .await;
        tracker.process(ended("call@1", 10)).await;
        // Arrives after completion and must not resurrect the action.
        tracker.process(finished("r1", 50)).await;

        let events = drain(&mut events);
        let capture = capture_of(&events[1]);
        assert_eq!(capture.network.requests.len(), 1);
        assert_eq!(
            capture.network.requests[0].outcome,
            RequestOutcome::Pending
        );
        assert_eq!(capture.network.requests[0].status, None);
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_error_descriptor_and_console() {
        let page = ScriptedPage::new(&[]);
        let (mut tracker, mut events) = tracker(page);

        tracker.process(started("call@1", "Frame", "click", 0)).await;
        tracker
            .process(FeedEvent::Console(ConsoleMessage {
                level: "error".to_string(),
                text: "cart failed".to_string(),
                timestamp: 3,
            }))
            .await;
        tracker
            .process(FeedEvent::ActionEnded {
                id: ActionId("call@1".to_string()),
                end_time: 9,
                error: Some(ErrorDescriptor::new("Timeout 30000ms exceeded")),
            })
            .await;
        tracker
            .process(FeedEvent::Console(ConsoleMessage {
                level: "log".to_string(),
                text: "too late".to_string(),
                timestamp: 12,
            }))
            .await;

        let events = drain(&mut events);
        let capture = capture_of(&events[1]);
        assert_eq!(
            capture.error,
            Some(ErrorDescriptor::new("Timeout 30000ms exceeded"))
        );
        assert_eq!(capture.console.len(), 1);
        assert_eq!(capture.console[0].text, "cart failed");
        // Snapshots were unavailable, so there is nothing to diff.
        assert_eq!(capture.snapshot.diff, None);
    }

    #[tokio::test]
    async fn test_completion_without_start_is_ignored() {
        let page = ScriptedPage::new(&[]);
        let (mut tracker, mut events) = tracker(page);
        tracker.process(ended("call@9", 10)).await;
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_requests_outside_actions_are_dropped() {
        let page = ScriptedPage::new(&[]);
        let (mut tracker, mut events) = tracker(page);

        tracker
            .process(request_sent("r0", "http://shop.test/early", 0))
            .await;
        tracker.process(started("call@1", "Frame", "click", 1)).await;
        assert_eq!(tracker.process(finished("r0", 2)).await, None);
        tracker.process(ended("call@1", 3)).await;

        let events = drain(&mut events);
        assert!(capture_of(&events[1]).network.requests.is_empty());
    }
}

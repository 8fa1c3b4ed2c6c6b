use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio::{select, spawn};

use crate::body::capped_text;
use crate::config::{CaptureOptions, now_millis};
use crate::emitter::EventSink;
use crate::event::{ActionId, ActionMetadata, ErrorDescriptor, RequestId};
use crate::feed::{FeedEvent, PageHandle};
use crate::tracker::ActionTracker;

/// Owns the capture event loop for one browser session and exposes the
/// before/after hook (`instrument`) that operations are run through.
pub struct Recorder {
    feed_sender: mpsc::UnboundedSender<FeedEvent>,
    shutdown_sender: oneshot::Sender<()>,
    done_receiver: oneshot::Receiver<()>,
    next_action: AtomicU64,
}

impl Recorder {
    /// Starts capturing. `session_events` is the session-level feed
    /// (network and console); action events arrive through `instrument` or
    /// `feed`.
    pub fn start<P, S>(
        page: Arc<P>,
        sink: Arc<dyn EventSink>,
        options: CaptureOptions,
        session_events: S,
    ) -> Self
    where
        P: PageHandle,
        S: Stream<Item = FeedEvent> + Send + Unpin + 'static,
    {
        let (feed_sender, feed_receiver) = mpsc::unbounded_channel();
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();
        let (done_sender, done_receiver) = oneshot::channel();

        let context = LoopContext {
            tracker: ActionTracker::new(page.clone(), sink, options.clone()),
            page,
            options,
            feed_sender: feed_sender.clone(),
        };
        run_event_loop(
            context,
            session_events,
            feed_receiver,
            shutdown_receiver,
            done_sender,
        );

        Recorder {
            feed_sender,
            shutdown_sender,
            done_receiver,
            next_action: AtomicU64::new(1),
        }
    }

    /// Sender for feeding events from another source, such as a runtime
    /// that reports its own before/after notifications.
    pub fn feed(&self) -> mpsc::UnboundedSender<FeedEvent> {
        self.feed_sender.clone()
    }

    /// Runs `operation` as one action. The operation starts only after the
    /// before-snapshot is taken. Its result is returned unchanged; a failure
    /// is also recorded on the capture event.
    pub async fn instrument<T, E, F>(
        &self,
        kind: &str,
        method: &str,
        title: impl Into<String>,
        operation: F,
    ) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let id = ActionId(format!(
            "call@{}",
            self.next_action.fetch_add(1, Ordering::Relaxed)
        ));
        let (ready, ready_receiver) = oneshot::channel();
        self.send(FeedEvent::ActionStarted {
            metadata: ActionMetadata {
                id: id.clone(),
                kind: kind.to_string(),
                method: method.to_string(),
                title: title.into(),
                start_time: now_millis(),
                end_time: None,
                error: None,
            },
            ready: Some(ready),
        });
        // Dropped unsent when the loop is gone, which also releases us.
        let _ = ready_receiver.await;

        let result = operation.await;

        self.send(FeedEvent::ActionEnded {
            id,
            end_time: now_millis(),
            error: result
                .as_ref()
                .err()
                .map(|error| ErrorDescriptor::new(error.to_string())),
        });
        result
    }

    fn send(&self, event: FeedEvent) {
        if self.feed_sender.send(event).is_err() {
            log::debug!("capture loop is gone, event dropped");
        }
    }

    /// Processes everything already fed, then stops the loop.
    pub async fn terminate(self) -> Result<()> {
        let Recorder {
            shutdown_sender,
            done_receiver,
            ..
        } = self;
        if let Ok(()) = shutdown_sender.send(()) {
            done_receiver.await?;
        } else {
            log::warn!("capture loop already stopped");
        }
        Ok(())
    }
}

struct LoopContext<P: PageHandle> {
    tracker: ActionTracker<P>,
    page: Arc<P>,
    options: CaptureOptions,
    feed_sender: mpsc::UnboundedSender<FeedEvent>,
}

impl<P: PageHandle> LoopContext<P> {
    async fn process(&mut self, event: FeedEvent) {
        if let Some(request) = self.tracker.process(event).await {
            self.fetch_response_body(request);
        }
    }

    /// Fetches the body off the loop and feeds it back. Failures only mean
    /// the record goes without a body.
    fn fetch_response_body(&self, request: RequestId) {
        let page = self.page.clone();
        let sender = self.feed_sender.clone();
        let limit = self.options.response_body_limit;
        let deadline = self.options.snapshot_timeout;
        spawn(async move {
            match timeout(deadline, page.response_body(&request)).await {
                Ok(Ok(bytes)) => {
                    let body = capped_text(&bytes, limit);
                    let _ =
                        sender.send(FeedEvent::ResponseBody { request, body });
                }
                Ok(Err(error)) => {
                    log::debug!("no body for request {}: {:#}", request, error)
                }
                Err(_) => log::debug!("body of request {} timed out", request),
            }
        });
    }
}

fn run_event_loop<P, S>(
    mut context: LoopContext<P>,
    mut session_events: S,
    mut feed_receiver: mpsc::UnboundedReceiver<FeedEvent>,
    mut shutdown_receiver: oneshot::Receiver<()>,
    done_sender: oneshot::Sender<()>,
) where
    P: PageHandle,
    S: Stream<Item = FeedEvent> + Send + Unpin + 'static,
{
    // Session events share the feed channel so the loop sees every event in
    // arrival order, whichever source it came from.
    let forward_sender = context.feed_sender.clone();
    let forwarder = spawn(async move {
        while let Some(event) = session_events.next().await {
            if forward_sender.send(event).is_err() {
                break;
            }
        }
        log::debug!("session events ended");
    });

    spawn(async move {
        log::info!("capturing actions");
        loop {
            select! {
                biased;
                _ = &mut shutdown_receiver => {
                    forwarder.abort();
                    while let Ok(event) = feed_receiver.try_recv() {
                        context.process(event).await;
                    }
                    log::debug!(
                        "stopping capture loop with {} open action(s)",
                        context.tracker.pending_count()
                    );
                    break;
                },
                event = feed_receiver.recv() => match event {
                    Some(event) => context.process(event).await,
                    None => break,
                },
            }
        }
        let _ = done_sender.send(());
    });
}

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::{Method, Request};
use http_body_util::Full;
use hyper_util::rt::TokioIo;
use serde_json as json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use url::Url;

use crate::config::{CaptureOptions, now_millis};
use crate::event::{ActionId, CaptureEvent, Envelope, Payload};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives capture events. Implementations must not block and must not
/// fail the caller.
pub trait EventSink: Send + Sync + 'static {
    fn send(&self, event: CaptureEvent);
}

/// Posts every event to the collector on its own task. Nothing is retried or
/// queued: an event that can't be delivered is dropped. A capture is posted
/// only once the post of its start is over.
pub struct CollectorEmitter {
    collector_url: Url,
    session_id: String,
    deliveries: Mutex<Deliveries>,
}

#[derive(Default)]
struct Deliveries {
    /// Start posts still in flight, by action.
    starts: HashMap<ActionId, JoinHandle<()>>,
    others: Vec<JoinHandle<()>>,
}

impl CollectorEmitter {
    pub fn new(options: &CaptureOptions) -> Self {
        CollectorEmitter {
            collector_url: options.collector_url.clone(),
            session_id: options.session_id.clone(),
            deliveries: Mutex::new(Deliveries::default()),
        }
    }

    pub fn collector_url(&self) -> &Url {
        &self.collector_url
    }

    pub fn payload(&self, event: &CaptureEvent) -> Result<String> {
        let payload = Payload {
            events: vec![Envelope {
                session_id: &self.session_id,
                timestamp: now_millis(),
                event,
            }],
        };
        json::to_string(&payload).context("serialize capture event")
    }

    /// Waits for deliveries still in flight, e.g. before the process exits.
    pub async fn flush(&self) {
        let Deliveries { starts, others } = std::mem::take(
            &mut *self
                .deliveries
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for delivery in starts.into_values().chain(others) {
            let _ = delivery.await;
        }
    }
}

impl EventSink for CollectorEmitter {
    fn send(&self, event: CaptureEvent) {
        let body = match self.payload(&event) {
            Ok(body) => body,
            Err(error) => {
                log::warn!("dropping capture event: {:#}", error);
                return;
            }
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("no async runtime, dropping capture event");
            return;
        };
        let url = self.collector_url.clone();
        let action_id = event.action_id().clone();
        let mut deliveries = self
            .deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let start = match event {
            CaptureEvent::Start(_) => None,
            CaptureEvent::Capture(_) => deliveries.starts.remove(&action_id),
        };
        let delivery = runtime.spawn(async move {
            if let Some(start) = start {
                let _ = start.await;
            }
            match timeout(DELIVERY_TIMEOUT, post(&url, body)).await {
                Ok(Ok(())) => {
                    log::debug!("delivered capture event for {}", action_id)
                }
                Ok(Err(error)) => log::debug!(
                    "capture event for {} not delivered: {:#}",
                    action_id,
                    error
                ),
                Err(_) => log::debug!(
                    "capture event for {} timed out after {:?}",
                    action_id,
                    DELIVERY_TIMEOUT
                ),
            }
        });
        deliveries.starts.retain(|_, start| !start.is_finished());
        deliveries.others.retain(|other| !other.is_finished());
        if let CaptureEvent::Start(start) = event {
            deliveries.starts.insert(start.id, delivery);
        } else {
            deliveries.others.push(delivery);
        }
    }
}

async fn post(url: &Url, body: String) -> Result<()> {
    if url.scheme() != "http" {
        bail!("unsupported collector scheme: {}", url.scheme());
    }
    let host = url
        .host_str()
        .ok_or(anyhow!("collector url has no host: {}", url))?;
    let port = url.port_or_known_default().unwrap_or(80);

    let stream = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("connect to collector at {}", url))?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) =
        hyper::client::conn::http1::handshake::<_, Full<Bytes>>(io).await?;

    tokio::spawn(async move {
        if let Err(err) = conn.await {
            log::debug!("collector connection failed: {:?}", err);
        }
    });

    let path_and_query = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };
    let request = Request::builder()
        .method(Method::POST)
        .uri(path_and_query)
        .header(HOST, format!("{}:{}", host, port))
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))?;

    let response = sender.send_request(request).await?;
    if !response.status().is_success() {
        bail!("collector answered {}", response.status());
    }
    Ok(())
}

/// In-process sink, for consumers living in the same program.
#[derive(Clone)]
pub struct ChannelSink(mpsc::UnboundedSender<CaptureEvent>);

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ChannelSink(sender), receiver)
    }
}

impl EventSink for ChannelSink {
    fn send(&self, event: CaptureEvent) {
        if self.0.send(event).is_err() {
            log::debug!("capture event receiver dropped");
        }
    }
}

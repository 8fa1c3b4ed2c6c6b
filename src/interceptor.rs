//! Capture for sessions without a browser: every call made through an HTTP
//! client service wrapped in [`CaptureLayer`] becomes one action with a
//! single network record.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, HOST, HeaderName};
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use tower::{Layer, Service};
use url::Url;

use crate::body::{capped_text, decode_content, truncate};
use crate::config::{CaptureOptions, now_millis};
use crate::emitter::EventSink;
use crate::event::{
    ActionCapture, ActionId, ActionStart, CaptureEvent, ErrorDescriptor,
    NetworkCapture, NetworkRequestRecord, RequestOutcome, ResourceCategory,
    SnapshotCapture,
};
use crate::network::{split_url, summarize};

const ACTION_TYPE: &str = "APIRequestContext";

#[derive(Clone)]
pub struct CaptureLayer {
    shared: Arc<Shared>,
}

struct Shared {
    sink: Arc<dyn EventSink>,
    options: CaptureOptions,
    next_call: AtomicU64,
}

impl CaptureLayer {
    pub fn new(sink: Arc<dyn EventSink>, options: CaptureOptions) -> Self {
        CaptureLayer {
            shared: Arc::new(Shared {
                sink,
                options,
                next_call: AtomicU64::new(1),
            }),
        }
    }
}

impl<S> Layer<S> for CaptureLayer {
    type Service = CaptureService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CaptureService {
            inner,
            shared: self.shared.clone(),
        }
    }
}

/// Buffers request and response bodies so they can be recorded, then hands
/// both on unchanged.
#[derive(Clone)]
pub struct CaptureService<S> {
    inner: S,
    shared: Arc<Shared>,
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CaptureService<S>
where
    S: Service<Request<Full<Bytes>>, Response = Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
    S::Error: Into<anyhow::Error>,
    ReqBody: Body<Data = Bytes> + Send + 'static,
    ReqBody::Error: Into<anyhow::Error>,
    ResBody: Body<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<anyhow::Error>,
{
    type Response = Response<Full<Bytes>>;
    type Error = anyhow::Error;
    type Future = BoxFuture<anyhow::Result<Self::Response>>;

    fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        // The clone may not be ready; keep the one that is.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let shared = self.shared.clone();

        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let body = body
                .collect()
                .await
                .map_err(Into::<anyhow::Error>::into)?
                .to_bytes();
            let url = request_url(&parts.uri, &parts.headers);

            if is_collector(&url, &shared.options.collector_url) {
                let request = Request::from_parts(parts, Full::new(body));
                let response = inner
                    .call(request)
                    .await
                    .map_err(Into::<anyhow::Error>::into)?;
                let (parts, bytes) = buffer_response(response).await?;
                return Ok(Response::from_parts(parts, Full::new(bytes)));
            }

            let call =
                ApiCall::begin(&shared, parts.method.as_str(), url, &body);
            let request = Request::from_parts(parts, Full::new(body));

            let response = match inner.call(request).await {
                Ok(response) => response,
                Err(error) => {
                    let error = error.into();
                    call.fail(&shared, &error);
                    return Err(error);
                }
            };
            match buffer_response(response).await {
                Ok((parts, bytes)) => {
                    call.complete(&shared, &parts, &bytes);
                    Ok(Response::from_parts(parts, Full::new(bytes)))
                }
                Err(error) => {
                    call.fail(&shared, &error);
                    Err(error)
                }
            }
        })
    }
}

async fn buffer_response<B>(
    response: Response<B>,
) -> anyhow::Result<(http::response::Parts, Bytes)>
where
    B: Body<Data = Bytes>,
    B::Error: Into<anyhow::Error>,
{
    let (parts, body) = response.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(Into::<anyhow::Error>::into)?
        .to_bytes();
    Ok((parts, bytes))
}

/// Absolute URL of an outgoing request, from the request target or, for
/// origin-form targets, the `Host` header.
fn request_url(uri: &http::Uri, headers: &http::HeaderMap) -> String {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return uri.to_string();
    }
    let path = uri
        .path_and_query()
        .map(|path| path.as_str())
        .unwrap_or("/");
    match headers.get(HOST).and_then(|host| host.to_str().ok()) {
        Some(host) => format!("http://{}{}", host, path),
        None => path.to_string(),
    }
}

fn is_collector(url: &str, collector: &Url) -> bool {
    let Ok(url) = Url::parse(url) else {
        return false;
    };
    url.host_str() == collector.host_str()
        && url.port_or_known_default() == collector.port_or_known_default()
}

/// An outgoing call between its `start` and `capture` events.
struct ApiCall {
    id: ActionId,
    method: String,
    url: String,
    title: String,
    start_time: u64,
    request_body: Option<String>,
}

impl ApiCall {
    fn begin(shared: &Shared, method: &str, url: String, body: &Bytes) -> Self {
        let id = ActionId(format!(
            "api@{}",
            shared.next_call.fetch_add(1, Ordering::Relaxed)
        ));
        let (_, path) = split_url(&url);
        let call = ApiCall {
            id,
            method: method.to_string(),
            title: format!("{} {}", method, path),
            url,
            start_time: now_millis(),
            request_body: (!body.is_empty()).then(|| {
                capped_text(body, shared.options.request_body_limit)
            }),
        };
        log::debug!("api call {} started: {}", call.id, call.title);
        shared.sink.send(CaptureEvent::Start(ActionStart {
            id: call.id.clone(),
            action_type: ACTION_TYPE.to_string(),
            method: call.method.clone(),
            title: call.title.clone(),
            start_time: call.start_time,
        }));
        call
    }

    fn complete(
        self,
        shared: &Shared,
        parts: &http::response::Parts,
        raw: &Bytes,
    ) {
        let header = |name: HeaderName| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let decoded = decode_content(
            raw,
            header(CONTENT_ENCODING).as_deref(),
            shared.options.api_response_body_limit,
        );
        let response_body = (!decoded.is_empty()).then(|| {
            truncate(
                &String::from_utf8_lossy(&decoded),
                shared.options.api_response_body_limit,
            )
        });
        let status = parts.status;
        let status_text = status.canonical_reason().unwrap_or("").to_string();
        self.emit(
            shared,
            Some(status.as_u16()),
            status_text,
            response_body,
            RequestOutcome::Completed,
            None,
        );
    }

    fn fail(self, shared: &Shared, error: &anyhow::Error) {
        let message = format!("{:#}", error);
        self.emit(
            shared,
            None,
            "failed".to_string(),
            None,
            RequestOutcome::Failed,
            Some(ErrorDescriptor::new(message)),
        );
    }

    fn emit(
        self,
        shared: &Shared,
        status: Option<u16>,
        status_text: String,
        response_body: Option<String>,
        outcome: RequestOutcome,
        error: Option<ErrorDescriptor>,
    ) {
        let end_time = now_millis();
        let duration = end_time.saturating_sub(self.start_time);
        let (host, path) = split_url(&self.url);
        let requests = vec![NetworkRequestRecord {
            request_id: None,
            method: self.method.clone(),
            url: self.url,
            host,
            path,
            status,
            status_text,
            start_time: self.start_time,
            end_time: Some(end_time),
            duration: Some(duration),
            category: ResourceCategory::Api,
            resource_type: "fetch".to_string(),
            request_body: self.request_body,
            response_body,
            outcome,
        }];
        let summary = summarize(&requests);
        log::debug!("api call {} captured: {}", self.id, summary);
        shared.sink.send(CaptureEvent::Capture(Box::new(ActionCapture {
            id: self.id,
            action_type: ACTION_TYPE.to_string(),
            method: self.method,
            title: self.title,
            start_time: self.start_time,
            end_time,
            duration,
            network: NetworkCapture { requests, summary },
            console: Vec::new(),
            snapshot: SnapshotCapture {
                before: None,
                after: None,
                diff: None,
            },
            page_url: None,
            error,
        })));
    }
}

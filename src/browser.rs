use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use chromiumoxide::browser::{BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::{accessibility, network};
use chromiumoxide::cdp::js_protocol::runtime;
use chromiumoxide::{BrowserConfig, Page};
use futures::{StreamExt, stream};
use serde::Serialize;
use serde_json as json;
use tokio::task::JoinHandle;

use crate::config::now_millis;
use crate::event::{ConsoleMessage, RequestId};
use crate::feed::{FeedEvent, PageHandle, RequestSent, ResponseReceived};
use crate::snapshot::render_ax_tree;

#[derive(Clone)]
pub struct BrowserOptions {
    pub headless: bool,
    pub user_data_directory: PathBuf,
    pub width: u16,
    pub height: u16,
    pub no_sandbox: bool,
}

pub struct Browser {
    browser: chromiumoxide::Browser,
    handler: JoinHandle<()>,
    pub page: Arc<Page>,
}

impl Browser {
    pub async fn launch(browser_options: &BrowserOptions) -> Result<Self> {
        let browser_config = browser_options_to_config(browser_options)?;
        let (browser, mut handler) =
            chromiumoxide::Browser::launch(browser_config).await?;

        let handler = tokio::spawn(async move {
            while handler.next().await.is_some() {}
            log::debug!("browser handler finished");
        });

        let page = Arc::new(browser.new_page("about:blank").await?);
        page.execute(network::EnableParams::builder().build()).await?;
        page.enable_runtime().await?;

        Ok(Browser {
            browser,
            handler,
            page,
        })
    }

    pub async fn terminate(self) -> Result<()> {
        let Browser {
            browser, handler, ..
        } = self;
        // `Browser::close` logs a websocket error, so the Chrome process is
        // cleaned up on drop instead.
        //
        // Reported here: https://github.com/mattsse/chromiumoxide/issues/287
        drop(browser);
        handler.abort();
        Ok(())
    }
}

/// `PageHandle` over a Chrome DevTools page.
#[derive(Clone)]
pub struct ChromiumPage {
    page: Arc<Page>,
}

impl ChromiumPage {
    pub fn new(page: Arc<Page>) -> Self {
        ChromiumPage { page }
    }
}

impl PageHandle for ChromiumPage {
    async fn accessibility_snapshot(&self) -> Result<String> {
        let returns = self
            .page
            .execute(accessibility::GetFullAxTreeParams::builder().build())
            .await?
            .result;
        let nodes = json::to_value(&returns.nodes)?;
        let nodes = nodes
            .as_array()
            .ok_or(anyhow!("accessibility tree nodes are not an array"))?;
        Ok(render_ax_tree(nodes))
    }

    async fn url(&self) -> Option<String> {
        self.page.url().await.ok().flatten()
    }

    async fn response_body(&self, request: &RequestId) -> Result<Vec<u8>> {
        let returns = self
            .page
            .execute(
                network::GetResponseBodyParams::builder()
                    .request_id(request.0.clone())
                    .build()
                    .map_err(|error| {
                        anyhow!(
                            "failed building GetResponseBodyParams: {}",
                            error
                        )
                    })?,
            )
            .await
            .context("failed getting response body")?
            .result;
        if returns.base64_encoded {
            Ok(BASE64_STANDARD.decode(returns.body.as_bytes())?)
        } else {
            Ok(returns.body.into_bytes())
        }
    }
}

type FeedStream = Pin<Box<dyn stream::Stream<Item = FeedEvent> + Send>>;

/// Network and console notifications of `page` as feed events.
pub async fn session_feed(page: &Page) -> Result<FeedStream> {
    let requests_sent = Box::pin(
        page.event_listener::<network::EventRequestWillBeSent>()
            .await?
            .map(|event| {
                FeedEvent::RequestSent(RequestSent {
                    request: RequestId(event.request_id.inner().clone()),
                    method: event.request.method.clone(),
                    url: event.request.url.clone(),
                    resource_type: event
                        .r#type
                        .as_ref()
                        .map(cdp_name)
                        .unwrap_or_else(|| "Other".to_string()),
                    post_data: post_data(&event.request),
                    timestamp: now_millis(),
                })
            }),
    ) as FeedStream;

    let responses_received = Box::pin(
        page.event_listener::<network::EventResponseReceived>()
            .await?
            .map(|event| {
                FeedEvent::ResponseReceived(ResponseReceived {
                    request: RequestId(event.request_id.inner().clone()),
                    status: u16::try_from(event.response.status).unwrap_or(0),
                    status_text: event.response.status_text.clone(),
                    content_type: Some(event.response.mime_type.clone()),
                })
            }),
    ) as FeedStream;

    let requests_finished = Box::pin(
        page.event_listener::<network::EventLoadingFinished>()
            .await?
            .map(|event| FeedEvent::RequestFinished {
                request: RequestId(event.request_id.inner().clone()),
                timestamp: now_millis(),
            }),
    ) as FeedStream;

    let requests_failed = Box::pin(
        page.event_listener::<network::EventLoadingFailed>()
            .await?
            .map(|event| FeedEvent::RequestFailed {
                request: RequestId(event.request_id.inner().clone()),
                timestamp: now_millis(),
                error_text: event.error_text.clone(),
            }),
    ) as FeedStream;

    let console = Box::pin(
        page.event_listener::<runtime::EventConsoleApiCalled>()
            .await?
            .map(|call| {
                FeedEvent::Console(ConsoleMessage {
                    level: cdp_name(&call.r#type),
                    text: call
                        .args
                        .iter()
                        .map(remote_object_to_text)
                        .collect::<Vec<_>>()
                        .join(" "),
                    timestamp: *call.timestamp.inner() as u64,
                })
            }),
    ) as FeedStream;

    Ok(Box::pin(stream::select_all(vec![
        requests_sent,
        responses_received,
        requests_finished,
        requests_failed,
        console,
    ])))
}

/// Wire name of a CDP enum value, e.g. `XHR` or `warning`.
fn cdp_name<T: Serialize>(value: &T) -> String {
    match json::to_value(value) {
        Ok(json::Value::String(name)) => name,
        _ => "Other".to_string(),
    }
}

/// Request body, from `postData` or else the concatenated
/// `postDataEntries`.
fn post_data(request: &network::Request) -> Option<String> {
    let request = json::to_value(request).ok()?;
    if let Some(json::Value::String(data)) = request.get("postData") {
        return Some(data.clone());
    }
    let entries = request.get("postDataEntries")?.as_array()?;
    let mut bytes = Vec::new();
    for entry in entries {
        let encoded = entry.get("bytes").and_then(json::Value::as_str)?;
        bytes.extend(BASE64_STANDARD.decode(encoded).ok()?);
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

fn remote_object_to_text(object: &runtime::RemoteObject) -> String {
    match (&object.value, &object.description) {
        (Some(json::Value::String(value)), _) => value.clone(),
        (Some(value), _) => value.to_string(),
        (None, Some(description)) => description.clone(),
        (None, None) => {
            format!("<object of type {}>", cdp_name(&object.r#type))
        }
    }
}

fn browser_options_to_config(
    browser_options: &BrowserOptions,
) -> Result<BrowserConfig> {
    let apply_sandbox =
        |builder: BrowserConfigBuilder| -> BrowserConfigBuilder {
            if browser_options.no_sandbox {
                builder.no_sandbox().args([
                    "--disable-setuid-sandbox",
                    "--disable-dev-shm-usage",
                ])
            } else {
                builder
            }
        };
    apply_sandbox(BrowserConfig::builder())
        .headless_mode(if browser_options.headless {
            HeadlessMode::New
        } else {
            HeadlessMode::False
        })
        .window_size(
            browser_options.width as u32,
            browser_options.height as u32,
        )
        .user_data_dir(browser_options.user_data_directory.clone())
        .args(["--no-crashpad", "--disable-crash-reporter"])
        .build()
        .map_err(|s| anyhow!(s))
}

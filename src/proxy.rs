//! A forward proxy that records every call passing through it, for API
//! tests whose HTTP client can be pointed at a proxy. Run it standalone:
//!
//! ```not_rust
//! $ cargo run -- proxy --port=3000
//! ```
//!
//! In another terminal:
//!
//! ```not_rust
//! $ curl -v -x "127.0.0.1:3000" http://localhost:8000/api/items
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use http::header::HOST;
use http::uri::PathAndQuery;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::task::JoinHandle;
use tower::{Layer, ServiceExt};

use crate::interceptor::CaptureLayer;

pub struct Proxy {
    pub port: u16,
    handle: JoinHandle<()>,
}

impl Proxy {
    /// Binds to `port` on loopback (0 picks a free one) and starts serving.
    pub async fn spawn(port: u16, capture: CaptureLayer) -> Result<Self> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind proxy to {}", addr))?;
        let port = listener.local_addr()?.port();
        log::info!("proxy listening on 127.0.0.1:{}", port);
        let handle = spawn(serve(listener, capture));
        Ok(Proxy { port, handle })
    }

    pub fn stop(self) {
        self.handle.abort();
    }

    pub async fn wait(self) -> Result<()> {
        self.handle.await.context("proxy task failed")
    }
}

pub async fn start_proxy(port: u16, capture: CaptureLayer) -> Result<()> {
    Proxy::spawn(port, capture).await?.wait().await
}

async fn serve(listener: TcpListener, capture: CaptureLayer) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(connection) => connection,
            Err(err) => {
                log::warn!("failed to accept connection: {:?}", err);
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let capture = capture.clone();
        spawn(async move {
            if let Err(err) = http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .serve_connection(
                    io,
                    hyper::service::service_fn(
                        move |request: Request<Incoming>| {
                            handle(capture.clone(), request)
                        },
                    ),
                )
                .await
            {
                log::debug!("failed to serve connection: {:?}", err);
            }
        });
    }
}

async fn handle(
    capture: CaptureLayer,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    log::debug!("proxying: {} {}", request.method(), request.uri());
    let service = capture.layer(tower::service_fn(forward));
    match service.oneshot(request).await {
        Ok(response) => Ok(response),
        Err(err) => {
            log::warn!("proxy error: {:#}", err);
            let mut response = Response::new(Full::new(Bytes::from_static(
                b"proxy error",
            )));
            *response.status_mut() = StatusCode::BAD_GATEWAY;
            Ok(response)
        }
    }
}

async fn forward(request: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
    let (parts, body) = request.into_parts();

    if parts.uri.scheme_str().is_some_and(|scheme| scheme != "http") {
        bail!("only plain http targets can be proxied: {}", parts.uri);
    }
    let authority = match parts.uri.authority() {
        Some(authority) => authority.to_string(),
        None => parts
            .headers
            .get(HOST)
            .ok_or(anyhow!("no target in request: {}", parts.uri))?
            .to_str()?
            .to_string(),
    };
    let target = if authority.contains(':') {
        authority.clone()
    } else {
        format!("{}:80", authority)
    };

    let stream = TcpStream::connect(&target)
        .await
        .with_context(|| format!("connect to {}", target))?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) =
        hyper::client::conn::http1::handshake::<_, Full<Bytes>>(io).await?;

    let mut target_request_builder = Request::builder()
        .method(parts.method)
        .version(parts.version)
        .uri(
            parts
                .uri
                .path_and_query()
                .unwrap_or(&PathAndQuery::from_static("/"))
                .as_str(),
        );

    for (name, value) in &parts.headers {
        if name != "proxy-connection" {
            target_request_builder =
                target_request_builder.header(name, value);
        }
    }
    if !parts.headers.contains_key(HOST) {
        target_request_builder = target_request_builder.header(HOST, authority);
    }

    let target_request = target_request_builder.body(body)?;

    spawn(async move {
        if let Err(err) = conn.await {
            log::debug!("target connection failed: {:?}", err);
        }
    });

    log::debug!("requesting from target: {:?}", &target_request);
    let response = sender.send_request(target_request).await?;
    log::debug!("response from target: {:?}", response.status());
    Ok(response)
}

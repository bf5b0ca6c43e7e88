//! WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing the
//! [`FrameWriter`]/[`FrameReader`] halves both endpoints use. The client
//! side opens connections through [`WsConnector`]; the mock broker upgrades
//! accepted TCP streams with [`accept`], rejecting paths outside the bridge
//! prefix.

// Rust guideline compliant 2026-02

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{self, http};
use tokio_tungstenite::WebSocketStream;

use crate::transport::{Connector, FrameReader, FrameWriter, Transport};

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, tungstenite::Message>,
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: String) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(frame))
            .await
            .context("WebSocket send failed")
    }

    async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

#[async_trait]
impl<S> FrameReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Text frames are returned as is and binary frames if they are UTF-8.
    /// Control frames are skipped; tungstenite answers pings itself.
    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(tungstenite::Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(text)),
                    Err(e) => {
                        log::warn!("[ws] Dropping non UTF-8 binary frame: {}", e);
                    }
                },
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    log::debug!("[ws] Close frame received: {:?}", frame);
                    return None;
                }
                Some(Ok(
                    tungstenite::Message::Ping(_)
                    | tungstenite::Message::Pong(_)
                    | tungstenite::Message::Frame(_),
                )) => {}
                Some(Err(e)) => return Some(Err(anyhow!("WebSocket read error: {e}"))),
                None => return None,
            }
        }
    }
}

fn split<S>(stream: WebSocketStream<S>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = stream.split();
    Transport::new(WsWriter { sink }, WsReader { stream })
}

/// Connect to a WebSocket URL with optional headers.
///
/// `http(s)://` URLs are rewritten to `ws(s)://` first.
///
/// # Errors
///
/// Returns an error if the URL is invalid, header values are malformed,
/// or the WebSocket handshake fails.
pub async fn connect(url: &str, headers: &[(String, String)]) -> Result<Transport> {
    use tungstenite::client::IntoClientRequest;

    let url = http_to_ws_scheme(url);
    let mut request = url
        .as_str()
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    for (name, value) in headers {
        let header_name = http::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let header_value = http::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for {name}"))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket connect failed")?;

    Ok(split(ws_stream))
}

/// Perform the server side of the handshake on an accepted stream.
///
/// Requests whose path is not `prefix` or below it get a 404.
///
/// # Errors
///
/// Returns an error if the path is rejected or the handshake fails.
pub async fn accept(stream: TcpStream, prefix: &str) -> Result<Transport> {
    let prefix = prefix.trim_end_matches('/').to_string();
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let path = request.uri().path();
        if path_within_prefix(path, &prefix) {
            Ok(response)
        } else {
            log::debug!("[ws] Rejecting upgrade for {}", path);
            let mut rejection = ErrorResponse::new(Some(format!("no bridge at {path}")));
            *rejection.status_mut() = http::StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .context("WebSocket handshake failed")?;
    Ok(split(ws_stream))
}

/// Whether `path` is `prefix` itself or a sub-path of it.
fn path_within_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

/// [`Connector`] that opens a WebSocket per connection attempt.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    headers: Vec<(String, String)>,
}

impl WsConnector {
    /// Connector for the bridge at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    /// Add a handshake header, e.g. an `Authorization` token.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// The target URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Transport> {
        connect(&self.url, &self.headers).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_to_ws_scheme_https() {
        assert_eq!(http_to_ws_scheme("https://example.com"), "wss://example.com");
    }

    #[test]
    fn test_http_to_ws_scheme_http() {
        assert_eq!(
            http_to_ws_scheme("http://localhost:9870/bridge"),
            "ws://localhost:9870/bridge"
        );
    }

    #[test]
    fn test_http_to_ws_scheme_passthrough() {
        assert_eq!(
            http_to_ws_scheme("wss://example.com/bridge"),
            "wss://example.com/bridge"
        );
        assert_eq!(
            http_to_ws_scheme("ws://localhost:9870/bridge"),
            "ws://localhost:9870/bridge"
        );
    }

    #[test]
    fn test_http_to_ws_scheme_only_rewrites_scheme() {
        assert_eq!(
            http_to_ws_scheme("http://host/redirect?to=http://other"),
            "ws://host/redirect?to=http://other"
        );
    }

    #[test]
    fn test_path_within_prefix() {
        assert!(path_within_prefix("/bridge", "/bridge"));
        assert!(path_within_prefix("/bridge/websocket", "/bridge"));
        assert!(!path_within_prefix("/bridgework", "/bridge"));
        assert!(!path_within_prefix("/other", "/bridge"));
        assert!(path_within_prefix("/anything", ""));
    }

    #[tokio::test]
    async fn test_connect_invalid_url_returns_error() {
        assert!(connect("not-a-url", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_unreachable_host_returns_error() {
        assert!(WsConnector::new("ws://127.0.0.1:1/bridge").connect().await.is_err());
    }

    #[tokio::test]
    async fn test_accept_rejects_foreign_path() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept(stream, "/bridge").await.is_err()
        });

        let result = connect(&format!("ws://{addr}/elsewhere"), &[]).await;
        assert!(result.is_err());
        assert!(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_accept_and_exchange_frames() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut transport = accept(stream, "/bridge/").await.unwrap();
            let frame = transport.reader.recv().await.unwrap().unwrap();
            transport.writer.send(format!("echo:{frame}")).await.unwrap();
            transport.writer.close().await.unwrap();
        });

        let mut client = WsConnector::new(format!("http://{addr}/bridge/websocket"))
            .connect()
            .await
            .unwrap();
        client.writer.send("hi".to_string()).await.unwrap();
        assert_eq!(client.reader.recv().await.unwrap().unwrap(), "echo:hi");
        assert!(client.reader.recv().await.is_none());
        server.await.unwrap();
    }
}

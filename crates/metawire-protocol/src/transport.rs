//! Transports: one HTTP exchange or one WebSocket connection behind a
//! shared `send` / `error` / `close` surface.
//!
//! [`HttpTransport`] is one-shot: its first reply is handed to the server
//! through a oneshot channel and every later reply fails. [`WsTransport`]
//! lives as long as the socket and feeds a bounded outbound queue drained by
//! the server's writer task; waiting for queue capacity is the
//! backpressure mechanism for both JSON and binary frames.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cookie::Cookie;
use http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, LOCATION, SET_COOKIE};
use http::{HeaderMap, HeaderValue, StatusCode};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::{ErrorOptions, ErrorResponse, SERVICE_UNAVAILABLE, TransportError};
use crate::packet::Packet;

/// Name of the cookie carrying the session token on HTTP.
pub const SESSION_COOKIE: &str = "token";

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Per-server transport settings, resolved once at startup.
#[derive(Clone, Debug)]
pub struct TransportOptions {
    /// Value of `Access-Control-Allow-Origin`, if any.
    pub cors_origin: Option<String>,
    /// `Domain` attribute of the session cookie.
    pub cookie_domain: Option<String>,
    /// Session cookie lifetime.
    pub cookie_ttl: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            cors_origin: None,
            cookie_domain: None,
            cookie_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Response produced by an [`HttpTransport`].
#[derive(Debug)]
pub struct HttpReply {
    /// Status line.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
}

/// One HTTP request/response exchange.
pub struct HttpTransport {
    address: String,
    options: Arc<TransportOptions>,
    reply: Mutex<Option<oneshot::Sender<HttpReply>>>,
    cookies: Mutex<Vec<HeaderValue>>,
}

impl HttpTransport {
    /// Create a transport and the receiver its single reply arrives on.
    pub fn new(
        address: impl Into<String>,
        options: Arc<TransportOptions>,
    ) -> (Self, oneshot::Receiver<HttpReply>) {
        let (tx, rx) = oneshot::channel();
        let transport = Self {
            address: address.into(),
            options,
            reply: Mutex::new(Some(tx)),
            cookies: Mutex::new(Vec::new()),
        };
        (transport, rx)
    }

    /// Peer address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the reply was already sent.
    pub fn is_finished(&self) -> bool {
        self.reply.lock().is_none()
    }

    /// Reply with `packet` as JSON.
    pub fn send(&self, packet: &impl Serialize, status: StatusCode) -> Result<(), TransportError> {
        let body = serde_json::to_vec(packet)?;
        self.write(status, JSON_CONTENT_TYPE, Bytes::from(body))
    }

    /// Reply with a raw body.
    pub fn write(
        &self,
        status: StatusCode,
        content_type: &str,
        body: Bytes,
    ) -> Result<(), TransportError> {
        let mut headers = self.base_headers();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            let _ = headers.insert(CONTENT_TYPE, value);
        }
        self.finish(HttpReply {
            status,
            headers,
            body,
        })
    }

    /// Reply with a `302 Found` redirect.
    pub fn redirect(&self, location: &str) -> Result<(), TransportError> {
        let mut headers = self.base_headers();
        if let Ok(value) = HeaderValue::from_str(location) {
            let _ = headers.insert(LOCATION, value);
        }
        self.finish(HttpReply {
            status: StatusCode::FOUND,
            headers,
            body: Bytes::new(),
        })
    }

    /// Reply with an error packet; the status follows [`ErrorResponse`].
    pub fn error(&self, code: i64, options: ErrorOptions) -> Result<(), TransportError> {
        let resolved = ErrorResponse::resolve(code, &options);
        log_error(&self.address, &resolved, &options);
        let status = StatusCode::from_u16(resolved.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        self.send(&Packet::error(options.id, resolved.code, resolved.message), status)
    }

    /// Attach a `Set-Cookie` for the session `token` to the reply.
    pub fn send_session_cookie(&self, token: &str) {
        let ttl = i64::try_from(self.options.cookie_ttl.as_secs()).unwrap_or(i64::MAX);
        let mut cookie = Cookie::build((SESSION_COOKIE, token.to_owned()))
            .path("/")
            .http_only(true)
            .max_age(cookie::time::Duration::seconds(ttl));
        if let Some(domain) = &self.options.cookie_domain {
            cookie = cookie.domain(domain.clone());
        }
        self.push_cookie(&cookie.build());
    }

    /// Attach a `Set-Cookie` that clears the session cookie.
    pub fn remove_session_cookie(&self) {
        let cookie = Cookie::build((SESSION_COOKIE, ""))
            .path("/")
            .max_age(cookie::time::Duration::ZERO)
            .build();
        self.push_cookie(&cookie);
    }

    /// Reply 503 if nothing was sent yet.
    pub fn close(&self) {
        if self.is_finished() {
            return;
        }
        let _ = self.error(SERVICE_UNAVAILABLE, ErrorOptions::default());
    }

    fn push_cookie(&self, cookie: &Cookie<'_>) {
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => self.cookies.lock().push(value),
            Err(err) => warn!(client = %self.address, error = %err, "invalid cookie value"),
        }
    }

    fn base_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(origin) = &self.options.cors_origin {
            if let Ok(value) = HeaderValue::from_str(origin) {
                let _ = headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
            }
        }
        for cookie in self.cookies.lock().drain(..) {
            headers.append(SET_COOKIE, cookie);
        }
        headers
    }

    fn finish(&self, reply: HttpReply) -> Result<(), TransportError> {
        let Some(tx) = self.reply.lock().take() else {
            return Err(TransportError::Finished);
        };
        tx.send(reply).map_err(|_| TransportError::Closed)
    }
}

/// A frame queued for a WebSocket writer.
#[derive(Debug)]
pub enum Outbound {
    /// JSON packet.
    Text(String),
    /// Chunk-codec frame.
    Binary(Bytes),
}

/// One WebSocket connection. Cheap to clone; clones share the socket.
#[derive(Clone)]
pub struct WsTransport {
    address: Arc<str>,
    tx: mpsc::Sender<Outbound>,
    closed: CancellationToken,
}

impl WsTransport {
    /// Wrap the outbound queue of a connection.
    pub fn new(address: &str, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            address: Arc::from(address),
            tx,
            closed: CancellationToken::new(),
        }
    }

    /// Peer address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Queue `packet` as a text frame.
    pub async fn send(&self, packet: &impl Serialize) -> Result<(), TransportError> {
        let text = serde_json::to_string(packet)?;
        self.enqueue(Outbound::Text(text)).await
    }

    /// Queue a binary frame.
    pub async fn send_binary(&self, frame: Bytes) -> Result<(), TransportError> {
        self.enqueue(Outbound::Binary(frame)).await
    }

    /// Send an error packet; the socket stays open.
    pub async fn error(&self, code: i64, options: ErrorOptions) -> Result<(), TransportError> {
        let resolved = ErrorResponse::resolve(code, &options);
        log_error(&self.address, &resolved, &options);
        self.send(&Packet::error(options.id, resolved.code, resolved.message))
            .await
    }

    /// Ask the connection to shut down.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Cancelled once [`close`](Self::close) was requested.
    pub fn close_requested(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn enqueue(&self, frame: Outbound) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }
}

fn log_error(address: &str, resolved: &ErrorResponse, options: &ErrorOptions) {
    let detail = options.message.as_deref().unwrap_or(&resolved.message);
    if options.pass {
        warn!(client = %address, code = resolved.code, status = resolved.status, error = detail, "request rejected");
    } else {
        error!(client = %address, code = resolved.code, status = resolved.status, error = detail, "request failed");
    }
}

/// A client's connection: one-shot HTTP or long-lived WebSocket.
pub enum Transport {
    /// One request, one response.
    Http(HttpTransport),
    /// Interleaved JSON and binary frames.
    Ws(WsTransport),
}

impl Transport {
    /// Peer address.
    pub fn address(&self) -> &str {
        match self {
            Self::Http(http) => http.address(),
            Self::Ws(ws) => ws.address(),
        }
    }

    /// Whether more than one frame can be exchanged.
    pub fn is_bidirectional(&self) -> bool {
        matches!(self, Self::Ws(_))
    }

    /// Send a JSON packet (HTTP: as a `200 OK` reply).
    pub async fn send(&self, packet: &impl Serialize) -> Result<(), TransportError> {
        match self {
            Self::Http(http) => http.send(packet, StatusCode::OK),
            Self::Ws(ws) => ws.send(packet).await,
        }
    }

    /// Send an error packet mapped to the transport.
    pub async fn error(&self, code: i64, options: ErrorOptions) -> Result<(), TransportError> {
        match self {
            Self::Http(http) => http.error(code, options),
            Self::Ws(ws) => ws.error(code, options).await,
        }
    }

    /// Close the connection.
    pub fn close(&self) {
        match self {
            Self::Http(http) => http.close(),
            Self::Ws(ws) => ws.close(),
        }
    }

    /// The HTTP variant, if this is one.
    pub fn as_http(&self) -> Option<&HttpTransport> {
        match self {
            Self::Http(http) => Some(http),
            Self::Ws(_) => None,
        }
    }

    /// The WebSocket variant, if this is one.
    pub fn as_ws(&self) -> Option<&WsTransport> {
        match self {
            Self::Ws(ws) => Some(ws),
            Self::Http(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketId;
    use serde_json::{Value, json};

    fn http(options: TransportOptions) -> (HttpTransport, oneshot::Receiver<HttpReply>) {
        HttpTransport::new("10.0.0.1:5000", Arc::new(options))
    }

    #[tokio::test]
    async fn http_send_is_one_shot() {
        let (transport, rx) = http(TransportOptions::default());
        transport.send(&json!({"a": 1}), StatusCode::OK).unwrap();
        assert!(matches!(
            transport.send(&json!({"a": 2}), StatusCode::OK),
            Err(TransportError::Finished)
        ));
        let reply = rx.await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.headers[CONTENT_TYPE], JSON_CONTENT_TYPE);
        let body: Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(body["a"], 1);
    }

    #[tokio::test]
    async fn http_error_sets_status_and_body() {
        let (transport, rx) = http(TransportOptions::default());
        transport
            .error(404, ErrorOptions::with_id(PacketId::from("x")))
            .unwrap();
        let reply = rx.await.unwrap();
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
        let body: Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(body["id"], "x");
        assert_eq!(body["error"]["code"], 404);
        assert_eq!(body["error"]["message"], "Not Found");
    }

    #[tokio::test]
    async fn http_adds_cors_header() {
        let (transport, rx) = http(TransportOptions {
            cors_origin: Some("*".into()),
            ..TransportOptions::default()
        });
        transport.send(&json!({}), StatusCode::OK).unwrap();
        let reply = rx.await.unwrap();
        assert_eq!(reply.headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn http_session_cookie_rides_on_reply() {
        let (transport, rx) = http(TransportOptions {
            cookie_domain: Some("example.com".into()),
            ..TransportOptions::default()
        });
        transport.send_session_cookie("abc123");
        transport.send(&json!({}), StatusCode::OK).unwrap();
        let reply = rx.await.unwrap();
        let cookie = reply.headers[SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("token=abc123"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("Domain=example.com"));
    }

    #[tokio::test]
    async fn http_close_replies_503_once() {
        let (transport, rx) = http(TransportOptions::default());
        transport.close();
        transport.close();
        assert!(transport.is_finished());
        assert_eq!(rx.await.unwrap().status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn http_redirect() {
        let (transport, rx) = http(TransportOptions::default());
        transport.redirect("http://host:8001/").unwrap();
        let reply = rx.await.unwrap();
        assert_eq!(reply.status, StatusCode::FOUND);
        assert_eq!(reply.headers[LOCATION], "http://host:8001/");
    }

    #[tokio::test]
    async fn app_error_uses_http_code_for_status() {
        let (transport, rx) = http(TransportOptions::default());
        let options = ErrorOptions {
            id: Some(PacketId::from("1")),
            message: Some("quota".into()),
            http_code: Some(200),
            pass: false,
        };
        transport.error(42, options).unwrap();
        let reply = rx.await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(body["error"]["code"], 42);
        assert_eq!(body["error"]["message"], "quota");
    }

    #[tokio::test]
    async fn ws_error_keeps_socket_open() {
        let (tx, mut rx) = mpsc::channel(8);
        let transport = Transport::Ws(WsTransport::new("1.2.3.4:1", tx));
        transport
            .error(404, ErrorOptions::with_id(PacketId::from("q")))
            .await
            .unwrap();
        transport.send(&json!({"ok": true})).await.unwrap();

        let Some(Outbound::Text(first)) = rx.recv().await else {
            panic!("expected text frame");
        };
        let first: Value = serde_json::from_str(&first).unwrap();
        assert_eq!(first["error"]["code"], 404);
        assert!(matches!(rx.recv().await, Some(Outbound::Text(_))));
    }

    #[tokio::test]
    async fn ws_send_after_close_fails() {
        let (tx, _rx) = mpsc::channel(8);
        let transport = WsTransport::new("1.2.3.4:1", tx);
        let token = transport.close_requested();
        transport.close();
        assert!(token.is_cancelled());
        assert!(matches!(
            transport.send(&json!({})).await,
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn bidirectional_flag() {
        let (tx, _rx) = mpsc::channel(1);
        assert!(Transport::Ws(WsTransport::new("a", tx)).is_bidirectional());
        let (http, _rx) = http(TransportOptions::default());
        assert!(!Transport::Http(http).is_bidirectional());
    }
}

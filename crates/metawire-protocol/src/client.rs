//! One connected peer: transport, streams and session binding.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::context::Context;
use crate::error::{ErrorOptions, ProtocolError, StreamError, TransportError};
use crate::packet::{Packet, PacketId};
use crate::session::{Session, SessionData, SessionRegistry, SessionStore};
use crate::stream::{ReadableStream, StreamHandle, StreamMap, WritableStream};
use crate::transport::Transport;

/// Generator of fresh ids for outbound streams and synthesized calls.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// A connected peer.
///
/// Created by [`Protocol::create_client`](crate::Protocol::create_client)
/// and destroyed by the engine when the connection ends. Dropping every
/// `Arc<Client>` without going through the engine leaks nothing but skips
/// the lifecycle notification.
pub struct Client {
    id: Uuid,
    transport: Transport,
    streams: Arc<StreamMap>,
    session: RwLock<Option<Arc<Session>>>,
    sessions: Arc<SessionRegistry>,
    store: Arc<dyn SessionStore>,
    generate_id: IdGenerator,
    closed: CancellationToken,
}

impl Client {
    pub(crate) fn new(
        transport: Transport,
        sessions: Arc<SessionRegistry>,
        store: Arc<dyn SessionStore>,
        generate_id: IdGenerator,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            transport,
            streams: Arc::new(Mutex::new(HashMap::new())),
            session: RwLock::new(None),
            sessions,
            store,
            generate_id,
            closed: CancellationToken::new(),
        }
    }

    /// Registry key of this client.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Peer network address.
    pub fn address(&self) -> &str {
        self.transport.address()
    }

    /// Whether the transport carries more than one exchange.
    pub fn is_bidirectional(&self) -> bool {
        self.transport.is_bidirectional()
    }

    /// Underlying transport.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Send a JSON packet to the peer.
    pub async fn send(&self, packet: &impl Serialize) -> Result<(), TransportError> {
        self.transport.send(packet).await
    }

    /// Send an error response.
    pub async fn error(&self, code: i64, options: ErrorOptions) -> Result<(), TransportError> {
        self.transport.error(code, options).await
    }

    /// Push an `event` packet to the peer.
    pub async fn send_event(&self, name: &str, data: Value) -> Result<(), TransportError> {
        if !self.is_bidirectional() {
            return Err(TransportError::Unsupported("send events"));
        }
        self.send(&Packet::event(name, data)).await
    }

    /// Fresh per-invocation context bound to the current session.
    pub fn create_context(self: &Arc<Self>) -> Context {
        Context {
            uuid: Uuid::new_v4(),
            state: Map::new(),
            session: self.session(),
            client: Arc::clone(self),
        }
    }

    /// Stream registered under `id`.
    pub fn get_stream(&self, id: &str) -> Result<StreamHandle, ProtocolError> {
        if !self.is_bidirectional() {
            return Err(TransportError::Unsupported("receive streams").into());
        }
        self.stream(id)
            .ok_or_else(|| StreamError::NotInitialized(id.to_owned()).into())
    }

    /// Inbound stream registered under `id`.
    pub fn get_readable(&self, id: &str) -> Result<Arc<ReadableStream>, ProtocolError> {
        match self.get_stream(id)? {
            StreamHandle::Readable(stream) => Ok(stream),
            StreamHandle::Writable(_) => Err(StreamError::NotReadable(id.to_owned()).into()),
        }
    }

    /// Announce a new outbound stream and register it.
    pub async fn create_stream(
        &self,
        name: &str,
        size: u64,
    ) -> Result<Arc<WritableStream>, ProtocolError> {
        let Some(ws) = self.transport.as_ws() else {
            return Err(TransportError::Unsupported("send streams").into());
        };
        let id = PacketId::Text((self.generate_id)());
        let stream =
            WritableStream::open(id, name, size, ws.clone(), Arc::downgrade(&self.streams)).await?;
        let _ = self.streams.lock().insert(
            stream.id().to_string(),
            StreamHandle::Writable(Arc::clone(&stream)),
        );
        Ok(stream)
    }

    pub(crate) fn stream(&self, id: &str) -> Option<StreamHandle> {
        self.streams.lock().get(id).cloned()
    }

    pub(crate) fn take_stream(&self, id: &str) -> Option<StreamHandle> {
        self.streams.lock().remove(id)
    }

    pub(crate) fn insert_readable(&self, stream: ReadableStream) -> Result<(), StreamError> {
        let mut streams = self.streams.lock();
        if streams.contains_key(stream.id()) {
            return Err(StreamError::AlreadyInitialized(stream.id().to_owned()));
        }
        let _ = streams.insert(
            stream.id().to_owned(),
            StreamHandle::Readable(Arc::new(stream)),
        );
        Ok(())
    }

    /// Number of live streams.
    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    /// Create a session, register it and bind it to this client.
    ///
    /// Any session already bound is finalized first. On HTTP the token is
    /// also sent back as a cookie.
    pub fn start_session(&self, token: &str, data: SessionData) -> Arc<Session> {
        let _ = self.finalize_session();
        let session = Arc::new(Session::new(token, data, Arc::clone(&self.store)));
        self.sessions.insert(Arc::clone(&session));
        *self.session.write() = Some(Arc::clone(&session));
        if let Some(http) = self.transport.as_http() {
            http.send_session_cookie(token);
        }
        debug!(client = %self.address(), "session started");
        session
    }

    /// Bind the registered session `token`. Returns `false` if unknown.
    ///
    /// A different session already bound is finalized first.
    pub fn restore_session(&self, token: &str) -> bool {
        let Some(session) = self.sessions.get(token) else {
            return false;
        };
        let bound = self.session().is_some_and(|current| current.token() == token);
        if !bound {
            let _ = self.finalize_session();
        }
        *self.session.write() = Some(session);
        true
    }

    /// Unbind and unregister the current session. Returns `false` if none.
    pub fn finalize_session(&self) -> bool {
        let Some(session) = self.session.write().take() else {
            return false;
        };
        let _ = self.sessions.remove(session.token());
        true
    }

    /// Currently bound session.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    /// Ask the transport to close; the engine destroys the client later.
    pub fn close(&self) {
        self.transport.close();
    }

    /// Cancelled once the client was destroyed.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Whether the client was destroyed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Tear down streams and session binding. Idempotent.
    pub(crate) fn destroy(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        let streams: Vec<StreamHandle> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in streams {
            match stream {
                StreamHandle::Readable(stream) => stream.terminate(),
                StreamHandle::Writable(stream) => stream.abort(),
            }
        }

        let session = self.session.write().take();
        // HTTP clients are per request; their session outlives them.
        if let Some(session) = session {
            if self.is_bidirectional() {
                let _ = self.sessions.remove(session.token());
            }
        }
        debug!(client = %self.address(), "client destroyed");
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("address", &self.address())
            .field("bidirectional", &self.is_bidirectional())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::session::{MemorySessionStore, NoopSessionStore};
    use crate::transport::{HttpReply, HttpTransport, Outbound, TransportOptions, WsTransport};
    use bytes::Bytes;
    use serde_json::json;
    use tokio::sync::{mpsc, oneshot};

    pub(crate) fn ws_client(
        sessions: Arc<SessionRegistry>,
    ) -> (Arc<Client>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(64);
        let transport = Transport::Ws(WsTransport::new("127.0.0.1:4000", tx));
        let client = Client::new(
            transport,
            sessions,
            Arc::new(NoopSessionStore),
            Arc::new(|| Uuid::now_v7().to_string()),
        );
        (Arc::new(client), rx)
    }

    pub(crate) fn http_client(
        sessions: Arc<SessionRegistry>,
    ) -> (Arc<Client>, oneshot::Receiver<HttpReply>) {
        let (http, rx) = HttpTransport::new("127.0.0.1:4001", Arc::new(TransportOptions::default()));
        let client = Client::new(
            Transport::Http(http),
            sessions,
            Arc::new(MemorySessionStore::new()),
            Arc::new(|| "generated".to_owned()),
        );
        (Arc::new(client), rx)
    }

    #[tokio::test]
    async fn session_round_trip_across_clients() {
        let sessions = Arc::new(SessionRegistry::new());
        let (first, _rx1) = ws_client(sessions.clone());
        let (second, _rx2) = ws_client(sessions.clone());

        let session = first.start_session("tok", SessionData::new());
        session.state().set("user", json!("max"));

        assert!(second.restore_session("tok"));
        let restored = second.session().unwrap();
        assert!(Arc::ptr_eq(&session, &restored));
        assert_eq!(restored.state().get("user"), Some(json!("max")));

        assert!(first.finalize_session());
        assert!(sessions.get("tok").is_none());
        let (third, _rx3) = ws_client(sessions);
        assert!(!third.restore_session("tok"));
    }

    #[tokio::test]
    async fn start_session_releases_previous() {
        let sessions = Arc::new(SessionRegistry::new());
        let (client, _rx) = ws_client(sessions.clone());
        let _ = client.start_session("a", SessionData::new());
        let _ = client.start_session("b", SessionData::new());
        assert!(sessions.get("a").is_none());
        assert_eq!(client.session().unwrap().token(), "b");
    }

    #[tokio::test]
    async fn restore_session_releases_previous() {
        let sessions = Arc::new(SessionRegistry::new());
        let (first, _rx1) = ws_client(sessions.clone());
        let (second, _rx2) = ws_client(sessions.clone());
        let _ = first.start_session("a", SessionData::new());
        let _ = second.start_session("b", SessionData::new());

        assert!(first.restore_session("b"));
        assert!(sessions.get("a").is_none());
        assert_eq!(first.session().unwrap().token(), "b");

        first.destroy();
        second.destroy();
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn restoring_bound_session_keeps_it() {
        let sessions = Arc::new(SessionRegistry::new());
        let (client, _rx) = ws_client(sessions.clone());
        let _ = client.start_session("a", SessionData::new());
        assert!(client.restore_session("a"));
        assert!(sessions.get("a").is_some());
        assert!(!client.restore_session("missing"));
        assert_eq!(client.session().unwrap().token(), "a");
    }

    #[tokio::test]
    async fn http_start_session_sets_cookie() {
        let sessions = Arc::new(SessionRegistry::new());
        let (client, rx) = http_client(sessions);
        let _ = client.start_session("tok", SessionData::new());
        client.send(&json!({"ok": true})).await.unwrap();
        let reply = rx.await.unwrap();
        let cookie = reply.headers[http::header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("token=tok"));
    }

    #[tokio::test]
    async fn http_rejects_streams_and_events() {
        let (client, _rx) = http_client(Arc::new(SessionRegistry::new()));
        assert!(matches!(
            client.create_stream("a", 1).await,
            Err(ProtocolError::Transport(TransportError::Unsupported(_)))
        ));
        assert!(matches!(
            client.get_stream("a"),
            Err(ProtocolError::Transport(TransportError::Unsupported(_)))
        ));
        assert!(matches!(
            client.send_event("tick", json!(1)).await,
            Err(TransportError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn send_event_over_ws() {
        let (client, mut rx) = ws_client(Arc::new(SessionRegistry::new()));
        client.send_event("tick", json!({"n": 1})).await.unwrap();
        let Some(Outbound::Text(text)) = rx.recv().await else {
            panic!("expected event");
        };
        let packet: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(packet, json!({"type": "event", "name": "tick", "data": {"n": 1}}));
    }

    #[tokio::test]
    async fn create_stream_registers_until_end() {
        let (client, mut rx) = ws_client(Arc::new(SessionRegistry::new()));
        let stream = client.create_stream("file.txt", 5).await.unwrap();
        assert_eq!(client.stream_count(), 1);
        let _ = rx.recv().await;
        stream.write(b"hello").await.unwrap();
        stream.end().await.unwrap();
        assert_eq!(client.stream_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_readable_is_rejected() {
        let (client, _rx) = ws_client(Arc::new(SessionRegistry::new()));
        client
            .insert_readable(ReadableStream::new("s", "a", 3))
            .unwrap();
        let err = client
            .insert_readable(ReadableStream::new("s", "b", 9))
            .unwrap_err();
        assert!(matches!(err, StreamError::AlreadyInitialized(_)));
        assert_eq!(client.get_readable("s").unwrap().name(), "a");
    }

    #[tokio::test]
    async fn destroy_terminates_streams_and_drops_ws_session() {
        let sessions = Arc::new(SessionRegistry::new());
        let (client, _rx) = ws_client(sessions.clone());
        let _ = client.start_session("tok", SessionData::new());
        client
            .insert_readable(ReadableStream::new("s", "a", 3))
            .unwrap();
        let stream = client.get_readable("s").unwrap();
        let closed = client.closed();

        client.destroy();
        client.destroy();

        assert!(closed.is_cancelled());
        assert!(client.is_closed());
        assert_eq!(client.stream_count(), 0);
        assert!(stream.push(Bytes::from_static(b"x")).is_err());
        assert!(sessions.get("tok").is_none());
    }

    #[tokio::test]
    async fn destroy_keeps_http_session_registered() {
        let sessions = Arc::new(SessionRegistry::new());
        let (client, _rx) = http_client(sessions.clone());
        let _ = client.start_session("tok", SessionData::new());
        client.destroy();
        assert!(sessions.get("tok").is_some());
        assert!(client.session().is_none());
    }
}

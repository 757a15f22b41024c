//! The dispatch engine: client and session registries plus packet routing.
//!
//! Every inbound payload goes through [`Protocol::message`] (JSON) or
//! [`Protocol::binary`] (chunk frames). Calls run through the procedure's
//! `enter` → `invoke` → `leave` sequence; every failure is answered on the
//! client's own transport and never escapes the connection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, Method};
use metrics::{counter, gauge, histogram};
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::{Access, Application, Procedure};
use crate::chunk;
use crate::client::{Client, IdGenerator};
use crate::error::{
    BAD_REQUEST, ErrorOptions, FORBIDDEN, HandlerError, INTERNAL_ERROR, NOT_FOUND, OK,
    ProtocolError, SERVICE_UNAVAILABLE, StreamError, TransportError,
};
use crate::metrics::{
    CLIENTS_ACTIVE, RPC_REQUEST_DURATION_SECONDS, RPC_REQUESTS_TOTAL, STREAM_ERRORS_TOTAL,
    STREAMS_OPENED_TOTAL,
};
use crate::packet::{
    CallPacket, Inbound, MAX_SAFE_INTEGER, MethodPath, Packet, PacketId, StreamPacket,
    StreamStatus,
};
use crate::session::{NoopSessionStore, SessionRegistry, SessionStore};
use crate::stream::{ReadableStream, StreamHandle};
use crate::transport::{SESSION_COOKIE, Transport};

/// Path of the packet endpoint.
pub const API_PATH: &str = "/api";

const STRUCTURE_ERROR: &str = "Packet structure error";

/// Engine construction options.
pub struct ProtocolOptions {
    /// Method and hook lookup.
    pub application: Arc<dyn Application>,
    /// Session persistence.
    pub session_store: Arc<dyn SessionStore>,
    /// Id generator; UUID v7 strings when absent.
    pub generate_id: Option<IdGenerator>,
}

impl ProtocolOptions {
    /// Options with a no-op session store and the default id generator.
    pub fn new(application: Arc<dyn Application>) -> Self {
        Self {
            application,
            session_store: Arc::new(NoopSessionStore),
            generate_id: None,
        }
    }
}

/// One HTTP request as seen by the engine.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    /// Request verb.
    pub method: Method,
    /// Path without the query string.
    pub path: String,
    /// Decoded query parameters, in order.
    pub query: Vec<(String, String)>,
    /// Request headers.
    pub headers: HeaderMap,
    /// Raw body.
    pub body: Bytes,
}

/// One WebSocket data frame.
#[derive(Clone, Debug)]
pub enum Frame {
    /// JSON packet.
    Text(Bytes),
    /// Chunk-codec frame.
    Binary(Bytes),
}

#[derive(Clone, Copy)]
enum Reply {
    /// Wrap the result in a `callback` packet.
    Callback,
    /// Send the result as-is.
    Raw,
}

/// The RPC, event and stream dispatcher.
pub struct Protocol {
    application: Arc<dyn Application>,
    store: Arc<dyn SessionStore>,
    generate_id: IdGenerator,
    clients: DashMap<Uuid, Arc<Client>>,
    sessions: Arc<SessionRegistry>,
}

impl Protocol {
    /// Create an engine with empty registries.
    pub fn new(options: ProtocolOptions) -> Self {
        let generate_id = options
            .generate_id
            .unwrap_or_else(|| Arc::new(|| Uuid::now_v7().to_string()));
        Self {
            application: options.application,
            store: options.session_store,
            generate_id,
            clients: DashMap::new(),
            sessions: Arc::new(SessionRegistry::new()),
        }
    }

    /// Fresh id from the configured generator.
    pub fn generate_id(&self) -> String {
        (self.generate_id)()
    }

    /// Wrap `transport` in a client and register it.
    pub fn create_client(&self, transport: Transport) -> Arc<Client> {
        let client = Arc::new(Client::new(
            transport,
            Arc::clone(&self.sessions),
            Arc::clone(&self.store),
            Arc::clone(&self.generate_id),
        ));
        let _ = self.clients.insert(client.id(), Arc::clone(&client));
        gauge!(CLIENTS_ACTIVE).increment(1.0);
        debug!(client = %client.address(), bidirectional = client.is_bidirectional(), "client created");
        client
    }

    /// Destroy `client` and unregister it. Called when the connection ends.
    pub fn release_client(&self, client: &Client) {
        client.destroy();
        if self.clients.remove(&client.id()).is_some() {
            gauge!(CLIENTS_ACTIVE).decrement(1.0);
        }
    }

    /// Number of live clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Process-wide session registry.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Ask every live client's transport to close.
    pub fn close_clients(&self) {
        let clients: Vec<Arc<Client>> = self.clients.iter().map(|e| Arc::clone(e.value())).collect();
        for client in clients {
            client.close();
        }
    }

    // ── Entry points ────────────────────────────────────────────────

    /// Route one HTTP request: `/api` takes a packet, `/api/...` a REST call.
    pub async fn handle_http_request(&self, client: &Arc<Client>, request: HttpRequest) {
        if let Some(token) = session_token(&request.headers) {
            if client.restore_session(&token) {
                debug!(client = %client.address(), "session restored from cookie");
            }
        }
        if request.path == API_PATH {
            if request.method == Method::POST {
                self.message(client, &request.body).await;
            } else {
                reply(client.error(FORBIDDEN, ErrorOptions::default()).await);
            }
            return;
        }
        self.request(client, request).await;
    }

    /// Route one WebSocket frame.
    ///
    /// Calls run on their own task so a slow handler never holds up the
    /// socket. Stream control and chunk frames are handled before the next
    /// frame is read, which keeps per-stream order; chunk delivery never
    /// waits on a stream's reader.
    pub async fn handle_ws_message(self: &Arc<Self>, client: &Arc<Client>, frame: Frame) {
        match frame {
            Frame::Binary(data) => self.binary(client, data).await,
            Frame::Text(data) => match Inbound::parse(&data) {
                Inbound::Call(call) => {
                    let protocol = Arc::clone(self);
                    let client = Arc::clone(client);
                    drop(tokio::spawn(async move {
                        protocol.rpc(&client, call).await;
                    }));
                }
                inbound => self.dispatch(client, inbound).await,
            },
        }
    }

    /// Handle one JSON payload: ping, call or stream control.
    pub async fn message(&self, client: &Arc<Client>, data: &[u8]) {
        self.dispatch(client, Inbound::parse(data)).await;
    }

    async fn dispatch(&self, client: &Arc<Client>, inbound: Inbound) {
        match inbound {
            Inbound::Ping => reply(client.send(&json!({})).await),
            Inbound::Call(call) => self.rpc(client, call).await,
            Inbound::Stream(packet) => self.stream(client, packet).await,
            Inbound::Invalid(reason) => {
                debug!(client = %client.address(), reason, "invalid packet");
                let options = ErrorOptions::passthrough(None, STRUCTURE_ERROR);
                reply(client.error(INTERNAL_ERROR, options).await);
            }
        }
    }

    // ── RPC ─────────────────────────────────────────────────────────

    /// Resolve and run a call, answering with a `callback` packet.
    pub async fn rpc(&self, client: &Arc<Client>, call: CallPacket) {
        let path = MethodPath::parse(&call.method);
        let Some(procedure) = self
            .application
            .lookup_method(path.unit, path.version, path.method)
        else {
            debug!(client = %client.address(), method = %call.method, "method not found");
            reply(client.error(NOT_FOUND, ErrorOptions::with_id(call.id)).await);
            return;
        };
        self.invoke(client, procedure.as_ref(), call, Reply::Callback)
            .await;
    }

    /// Run a REST hook. `params` carries `{verb, method, args, headers}`.
    pub async fn hook(
        &self,
        client: &Arc<Client>,
        procedure: &dyn Procedure,
        call: CallPacket,
        verb: &Method,
        headers: &HeaderMap,
    ) {
        let params = json!({
            "verb": verb.as_str(),
            "method": call.method,
            "args": call.args,
            "headers": headers_to_json(headers),
        });
        let call = CallPacket {
            args: params,
            ..call
        };
        self.invoke(client, procedure, call, Reply::Raw).await;
    }

    /// Turn `/api/<unit>/<method>?query` plus a JSON body into a call.
    ///
    /// Units with a hook go to the hook; anything else is dispatched as the
    /// RPC `<unit>/<method>`.
    pub async fn request(&self, client: &Arc<Client>, request: HttpRequest) {
        let path = request
            .path
            .strip_prefix(API_PATH)
            .map_or("", |rest| rest.trim_start_matches('/'));
        let (unit, method) = path.split_once('/').unwrap_or((path, ""));

        let mut args: Map<String, Value> = request
            .query
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect();
        if let Ok(Value::Object(body)) = serde_json::from_slice::<Value>(&request.body) {
            args.extend(body);
        }

        let call = CallPacket {
            id: PacketId::Text(self.generate_id()),
            method: format!("{unit}/{method}"),
            args: Value::Object(args),
        };
        match self.application.lookup_hook(unit) {
            Some(hook) => {
                self.hook(client, hook.as_ref(), call, &request.method, &request.headers)
                    .await;
            }
            None => self.rpc(client, call).await,
        }
    }

    async fn invoke(
        &self,
        client: &Arc<Client>,
        procedure: &dyn Procedure,
        call: CallPacket,
        shape: Reply,
    ) {
        let CallPacket { id, method, args } = call;
        if client.session().is_none() && procedure.access() != Access::Public {
            debug!(client = %client.address(), method, "session required");
            count_call(&method, FORBIDDEN);
            reply(client.error(FORBIDDEN, ErrorOptions::with_id(id)).await);
            return;
        }
        if let Err(err) = procedure.enter().await {
            warn!(client = %client.address(), method, error = %err, "admission rejected");
            count_call(&method, SERVICE_UNAVAILABLE);
            reply(client.error(SERVICE_UNAVAILABLE, ErrorOptions::with_id(id)).await);
            return;
        }

        let started = Instant::now();
        let outcome = {
            let _leave = LeaveGuard(procedure);
            procedure.invoke(client.create_context(), args).await
        };

        histogram!(RPC_REQUEST_DURATION_SECONDS, "method" => method.clone())
            .record(started.elapsed().as_secs_f64());
        let code = outcome.as_ref().map_or_else(HandlerError::code, |_| OK);
        count_call(&method, code);

        match outcome {
            Ok(result) => {
                info!(client = %client.address(), method, "call");
                let sent = match shape {
                    Reply::Callback => client.send(&Packet::callback(id, result)).await,
                    Reply::Raw => client.send(&result).await,
                };
                reply(sent);
            }
            Err(err) => {
                info!(client = %client.address(), method, code, "call failed");
                reply(client.error(code, err.to_options(id)).await);
            }
        }
    }

    // ── Streams ─────────────────────────────────────────────────────

    /// Apply a stream control packet: init, `end` or `terminate`.
    pub async fn stream(&self, client: &Arc<Client>, packet: StreamPacket) {
        let id = packet.id.clone();
        if let Err(err) = apply_stream(client, packet) {
            warn!(client = %client.address(), stream = %id, error = %err, "stream error");
            counter!(STREAM_ERRORS_TOTAL).increment(1);
            let options = ErrorOptions::passthrough(Some(id), err.to_string());
            reply(client.error(BAD_REQUEST, options).await);
        }
    }

    /// Append one chunk frame to its readable stream.
    pub async fn binary(&self, client: &Arc<Client>, frame: Bytes) {
        let decoded = chunk::decode(&frame).map(|c| (c.id.to_owned(), frame.slice_ref(c.payload)));
        let (id, payload) = match decoded {
            Ok(parts) => parts,
            Err(err) => {
                error!(client = %client.address(), error = %err, "undecodable chunk");
                let options = ErrorOptions {
                    id: Some(PacketId::Text(self.generate_id())),
                    message: Some(err.to_string()),
                    http_code: None,
                    pass: false,
                };
                reply(client.error(BAD_REQUEST, options).await);
                return;
            }
        };

        let pushed = match client.stream(&id) {
            Some(StreamHandle::Readable(stream)) => stream.push(payload),
            Some(StreamHandle::Writable(_)) => Err(StreamError::NotReadable(id.clone())),
            None => Err(StreamError::NotInitialized(id.clone())),
        };
        if let Err(err) = pushed {
            error!(client = %client.address(), stream = %id, error = %err, "stream chunk rejected");
            counter!(STREAM_ERRORS_TOTAL).increment(1);
            let options = ErrorOptions::passthrough(Some(PacketId::Text(id)), err.to_string());
            reply(client.error(BAD_REQUEST, options).await);
        }
    }
}

fn apply_stream(client: &Client, packet: StreamPacket) -> Result<(), ProtocolError> {
    if !client.is_bidirectional() {
        return Err(TransportError::Unsupported("receive streams").into());
    }
    let key = packet.id.to_string();
    if let Some(status) = packet.status {
        let stream = client
            .take_stream(&key)
            .ok_or_else(|| StreamError::NotInitialized(key.clone()))?;
        match (stream, status) {
            (StreamHandle::Readable(stream), StreamStatus::End) => stream.close(),
            (StreamHandle::Readable(stream), StreamStatus::Terminate) => stream.terminate(),
            (StreamHandle::Writable(stream), _) => stream.abort(),
        }
        debug!(client = %client.address(), stream = %key, ?status, "stream finished");
        return Ok(());
    }

    let name = packet
        .name
        .filter(|name| !name.is_empty())
        .ok_or(StreamError::InvalidPacket)?;
    let size = packet
        .size
        .as_ref()
        .and_then(serde_json::Number::as_u64)
        .filter(|size| *size <= MAX_SAFE_INTEGER)
        .ok_or(StreamError::InvalidPacket)?;
    client.insert_readable(ReadableStream::new(key.clone(), name.clone(), size))?;
    info!(client = %client.address(), stream = %key, name, size, "stream init");
    counter!(STREAMS_OPENED_TOTAL).increment(1);
    Ok(())
}

fn count_call(method: &str, code: i64) {
    counter!(RPC_REQUESTS_TOTAL, "method" => method.to_owned(), "code" => code.to_string())
        .increment(1);
}

struct LeaveGuard<'a>(&'a dyn Procedure);

impl Drop for LeaveGuard<'_> {
    fn drop(&mut self) {
        self.0.leave();
    }
}

fn reply(sent: Result<(), TransportError>) {
    if let Err(err) = sent {
        debug!(error = %err, "response not delivered");
    }
}

fn session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(http::header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(cookie::Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == SESSION_COOKIE)
        .map(|cookie| cookie.value().to_owned())
        .filter(|token| !token.is_empty())
}

fn headers_to_json(headers: &HeaderMap) -> Value {
    let map: BTreeMap<&str, &str> = headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)))
        .collect();
    json!(map)
}

//! Per-invocation handler context.

use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::client::Client;
use crate::session::Session;

/// Everything a handler sees besides its arguments.
///
/// Built fresh for every call and moved into the handler, so it never
/// outlives the invocation unless the handler keeps it on purpose.
#[derive(Debug)]
pub struct Context {
    /// Unique invocation id.
    pub uuid: Uuid,
    /// Scratch state, empty at the start of every call.
    pub state: Map<String, Value>,
    /// Session bound to the client when the call arrived.
    pub session: Option<Arc<Session>>,
    /// Invoking client.
    pub client: Arc<Client>,
}

//! # metawire-protocol
//!
//! RPC, event and chunked-stream protocol engine over HTTP and WebSocket.
//!
//! - **Packets**: JSON `call` / `callback` / `event` / `stream` packets
//! - **Chunks**: binary frames tagged with a stream id, interleaved with JSON
//! - **Transports**: one-shot HTTP and long-lived WebSocket behind one enum
//! - **Streams**: size-bounded readable and writable byte streams
//! - **Metrics**: names for the counters and gauges recorded via `metrics`
//! - **Sessions**: token-addressed state with write-through persistence
//! - **Engine**: [`Protocol`] owns the client and session registries and
//!   routes every packet to a host-supplied [`Application`]
//!
//! The crate does no socket I/O itself; `metawire-server` feeds it requests
//! and frames and drains the replies.

#![deny(unsafe_code)]

pub mod application;
pub mod chunk;
pub mod client;
pub mod context;
pub mod error;
pub mod metrics;
pub mod packet;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod transport;

pub use application::{Access, Application, FnProcedure, MethodRegistry, Procedure, procedure};
pub use client::{Client, IdGenerator};
pub use context::Context;
pub use error::{
    AdmissionError, ApplicationError, ErrorOptions, HandlerError, ProtocolError, StreamError,
    TransportError,
};
pub use packet::{Packet, PacketId};
pub use protocol::{Frame, HttpRequest, Protocol, ProtocolOptions};
pub use session::{MemorySessionStore, NoopSessionStore, Session, SessionData, SessionStore};
pub use stream::{ReadableStream, StreamHandle, WritableStream};
pub use transport::{HttpReply, HttpTransport, Outbound, Transport, TransportOptions, WsTransport};

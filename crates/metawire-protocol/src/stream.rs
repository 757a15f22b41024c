//! Byte streams multiplexed over a bidirectional transport.
//!
//! A [`ReadableStream`] receives chunks pushed by the peer; a
//! [`WritableStream`] sends chunks to the peer. Both are owned by one
//! client and keyed by an id unique within that client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::chunk;
use crate::error::{ProtocolError, StreamError};
use crate::packet::{Packet, PacketId, StreamPacket, StreamStatus};
use crate::transport::WsTransport;

/// Largest payload carried by one outgoing chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

const COLLECT_PREALLOC: usize = 2 * 1024 * 1024;

/// A client's streams keyed by id.
pub(crate) type StreamMap = Mutex<HashMap<String, StreamHandle>>;

/// A stream registered with a client.
#[derive(Clone)]
pub enum StreamHandle {
    /// Peer → server.
    Readable(Arc<ReadableStream>),
    /// Server → peer.
    Writable(Arc<WritableStream>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadState {
    Open,
    Closed,
    Terminated,
}

/// Inbound stream with a declared total size.
pub struct ReadableStream {
    id: String,
    name: String,
    size: u64,
    received: AtomicU64,
    state: Mutex<ReadState>,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl ReadableStream {
    /// Create an open stream expecting `size` bytes.
    ///
    /// The buffer holds at most `size` bytes, so a slow reader only holds
    /// back its own stream.
    pub fn new(id: impl Into<String>, name: impl Into<String>, size: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id: id.into(),
            name: name.into(),
            size,
            received: AtomicU64::new(0),
            state: Mutex::new(ReadState::Open),
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Stream id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stream name announced by the peer.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared total size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes accepted so far.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    /// Whether the peer ended or aborted the stream.
    pub fn is_finished(&self) -> bool {
        *self.state.lock() != ReadState::Open
    }

    /// Queue a chunk for the reader. Never waits.
    pub fn push(&self, data: Bytes) -> Result<(), StreamError> {
        let sender = match *self.state.lock() {
            ReadState::Open => self.tx.lock().clone(),
            ReadState::Closed => None,
            ReadState::Terminated => return Err(StreamError::Terminated(self.id.clone())),
        };
        let Some(sender) = sender else {
            return Err(StreamError::Finished(self.id.clone()));
        };

        let len = data.len() as u64;
        let reserved = self
            .received
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |received| {
                received.checked_add(len).filter(|total| *total <= self.size)
            });
        if let Err(received) = reserved {
            return Err(StreamError::SizeExceeded {
                id: self.id.clone(),
                declared: self.size,
                attempted: received.saturating_add(len),
            });
        }

        sender
            .send(data)
            .map_err(|_| StreamError::Finished(self.id.clone()))
    }

    /// End the stream; buffered chunks stay readable.
    pub fn close(&self) {
        self.finish(ReadState::Closed);
    }

    /// Abort the stream; readers get [`StreamError::Terminated`].
    pub fn terminate(&self) {
        self.finish(ReadState::Terminated);
    }

    fn finish(&self, next: ReadState) {
        {
            let mut state = self.state.lock();
            if *state != ReadState::Open {
                return;
            }
            *state = next;
        }
        drop(self.tx.lock().take());
        debug!(stream = %self.id, state = ?next, "readable stream finished");
    }

    /// Next chunk, or `None` once the stream ended and the buffer drained.
    pub async fn read(&self) -> Result<Option<Bytes>, StreamError> {
        if *self.state.lock() == ReadState::Terminated {
            return Err(StreamError::Terminated(self.id.clone()));
        }
        let chunk = self.rx.lock().await.recv().await;
        match chunk {
            Some(chunk) => Ok(Some(chunk)),
            None if *self.state.lock() == ReadState::Terminated => {
                Err(StreamError::Terminated(self.id.clone()))
            }
            None => Ok(None),
        }
    }

    /// Read the whole stream into one buffer.
    pub async fn collect(&self) -> Result<Bytes, StreamError> {
        let capacity = usize::try_from(self.size).unwrap_or(usize::MAX).min(COLLECT_PREALLOC);
        let mut buffer = BytesMut::with_capacity(capacity);
        while let Some(chunk) = self.read().await? {
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }
}

/// Outbound stream with a declared total size.
pub struct WritableStream {
    id: PacketId,
    key: String,
    name: String,
    size: u64,
    written: AtomicU64,
    finished: AtomicBool,
    transport: WsTransport,
    streams: Weak<StreamMap>,
}

impl WritableStream {
    /// Announce a new stream to the peer and return it.
    pub(crate) async fn open(
        id: PacketId,
        name: &str,
        size: u64,
        transport: WsTransport,
        streams: Weak<StreamMap>,
    ) -> Result<Arc<Self>, ProtocolError> {
        if name.is_empty() {
            return Err(StreamError::MissingName.into());
        }
        if size == 0 {
            return Err(StreamError::MissingSize.into());
        }
        let stream = Arc::new(Self {
            key: id.to_string(),
            id,
            name: name.to_owned(),
            size,
            written: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            transport,
            streams,
        });
        // Fails early on ids that can't be framed.
        let _ = chunk::encode(&stream.key, &[])?;
        stream
            .transport
            .send(&Packet::Stream(StreamPacket::init(stream.id.clone(), name, size)))
            .await?;
        Ok(stream)
    }

    /// Stream id.
    pub fn id(&self) -> &PacketId {
        &self.id
    }

    /// Stream name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared total size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes sent so far.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    /// Whether `end` or `terminate` was called, or the peer aborted.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Send `data` as one or more chunks.
    pub async fn write(&self, data: &[u8]) -> Result<(), ProtocolError> {
        if self.is_finished() {
            return Err(StreamError::Finished(self.key.clone()).into());
        }
        let len = data.len() as u64;
        let reserved = self
            .written
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |written| {
                written.checked_add(len).filter(|total| *total <= self.size)
            });
        if let Err(written) = reserved {
            return Err(StreamError::SizeExceeded {
                id: self.key.clone(),
                declared: self.size,
                attempted: written.saturating_add(len),
            }
            .into());
        }
        for piece in data.chunks(CHUNK_SIZE) {
            let frame = chunk::encode(&self.key, piece)?;
            self.transport.send_binary(frame).await?;
        }
        Ok(())
    }

    /// Tell the peer all data was sent.
    pub async fn end(&self) -> Result<(), ProtocolError> {
        self.finish(StreamStatus::End).await
    }

    /// Tell the peer the stream is aborted.
    pub async fn terminate(&self) -> Result<(), ProtocolError> {
        self.finish(StreamStatus::Terminate).await
    }

    async fn finish(&self, status: StreamStatus) -> Result<(), ProtocolError> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(StreamError::Finished(self.key.clone()).into());
        }
        self.unregister();
        let packet = Packet::Stream(StreamPacket::finish(self.id.clone(), status));
        self.transport.send(&packet).await?;
        Ok(())
    }

    /// Stop sending after the peer aborted the stream.
    pub(crate) fn abort(&self) {
        self.finished.store(true, Ordering::Release);
    }

    fn unregister(&self) {
        if let Some(streams) = self.streams.upgrade() {
            let _ = streams.lock().remove(&self.key);
        }
    }
}

//! Static file contract for non-API paths.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use metawire_protocol::HttpTransport;
use tracing::debug;

/// Serves non-API paths by replying on the given transport.
///
/// An implementation that does not reply leaves the request to the server,
/// which answers 404.
#[async_trait]
pub trait StaticFiles: Send + Sync {
    /// Reply to `path` (without query string) on `transport`.
    async fn serve(&self, path: &str, transport: &HttpTransport);
}

/// Fixed set of in-memory files.
#[derive(Debug, Default)]
pub struct MemoryFiles {
    files: HashMap<String, (String, Bytes)>,
}

impl MemoryFiles {
    /// Create an empty file set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file. `/` is served from `/index.html`.
    #[must_use]
    pub fn with_file(
        mut self,
        path: impl Into<String>,
        content_type: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        let _ = self
            .files
            .insert(path.into(), (content_type.into(), body.into()));
        self
    }
}

#[async_trait]
impl StaticFiles for MemoryFiles {
    async fn serve(&self, path: &str, transport: &HttpTransport) {
        let path = if path == "/" { "/index.html" } else { path };
        let Some((content_type, body)) = self.files.get(path) else {
            debug!(path, "static file not found");
            return;
        };
        if let Err(err) = transport.write(StatusCode::OK, content_type, body.clone()) {
            debug!(path, error = %err, "static reply not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metawire_protocol::TransportOptions;
    use std::sync::Arc;

    #[tokio::test]
    async fn serves_known_files() {
        let files = MemoryFiles::new().with_file("/index.html", "text/html", "<h1>hi</h1>");
        let (transport, rx) = HttpTransport::new("a", Arc::new(TransportOptions::default()));
        files.serve("/", &transport).await;
        let reply = rx.await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.headers["content-type"], "text/html");
        assert_eq!(&reply.body[..], b"<h1>hi</h1>");
    }

    #[tokio::test]
    async fn unknown_files_are_left_unanswered() {
        let files = MemoryFiles::new();
        let (transport, _rx) = HttpTransport::new("a", Arc::new(TransportOptions::default()));
        files.serve("/missing.js", &transport).await;
        assert!(!transport.is_finished());
    }
}

//! Graceful shutdown: stop accepting, then drain live clients.

use std::time::Duration;

use metawire_protocol::Protocol;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Result of waiting for clients to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every client was released.
    Drained,
    /// The deadline passed with clients still live.
    TimedOut {
        /// Clients still registered.
        remaining: usize,
    },
}

/// Coordinates shutdown of the accept loop and the client drain.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Close every client and poll until none is left or `timeout` passes.
    pub async fn drain(&self, protocol: &Protocol, poll: Duration, timeout: Duration) -> DrainOutcome {
        if protocol.client_count() == 0 {
            return DrainOutcome::Drained;
        }
        protocol.close_clients();
        info!(
            clients = protocol.client_count(),
            timeout_ms = timeout.as_millis(),
            "draining clients"
        );

        let wait = async {
            while protocol.client_count() > 0 {
                tokio::time::sleep(poll).await;
            }
        };
        if tokio::time::timeout(timeout, wait).await.is_ok() {
            DrainOutcome::Drained
        } else {
            let remaining = protocol.client_count();
            warn!(remaining, "drain timed out after {timeout:?}, clients still connected");
            DrainOutcome::TimedOut { remaining }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

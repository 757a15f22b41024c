//! Metric names recorded through the `metrics` facade.
//!
//! The host installs whatever recorder it wants; without one every
//! macro call is a no-op.

/// Clients currently registered with a [`Protocol`](crate::Protocol) (gauge).
pub const CLIENTS_ACTIVE: &str = "clients_active";
/// Calls handled (counter, labels: method, code).
pub const RPC_REQUESTS_TOTAL: &str = "rpc_requests_total";
/// Call latency from admission to reply (histogram, labels: method).
pub const RPC_REQUEST_DURATION_SECONDS: &str = "rpc_request_duration_seconds";
/// Readable streams opened by peers (counter).
pub const STREAMS_OPENED_TOTAL: &str = "streams_opened_total";
/// Stream packets or chunks rejected (counter).
pub const STREAM_ERRORS_TOTAL: &str = "stream_errors_total";
/// WebSocket upgrades accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket sessions ended (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Open WebSocket sessions (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket session lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const NAMES: [&str; 9] = [
        CLIENTS_ACTIVE,
        RPC_REQUESTS_TOTAL,
        RPC_REQUEST_DURATION_SECONDS,
        STREAMS_OPENED_TOTAL,
        STREAM_ERRORS_TOTAL,
        WS_CONNECTIONS_TOTAL,
        WS_DISCONNECTIONS_TOTAL,
        WS_CONNECTIONS_ACTIVE,
        WS_CONNECTION_DURATION_SECONDS,
    ];

    #[test]
    fn metric_constants_are_snake_case() {
        for name in NAMES {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }

    #[test]
    fn metric_constants_are_unique() {
        assert_eq!(NAMES.iter().collect::<HashSet<_>>().len(), NAMES.len());
    }
}

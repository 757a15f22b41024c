//! One-shot HTTP exchanges: API requests and static files.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::Query;
use axum::http::request::Parts;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use metawire_protocol::{HttpReply, HttpRequest, HttpTransport, Transport};
use tracing::{debug, warn};

use crate::server::AppState;

/// Turn an [`HttpReply`] into an axum response.
pub(crate) fn into_response(reply: HttpReply) -> Response<Body> {
    let mut response = Response::new(Body::from(reply.body));
    *response.status_mut() = reply.status;
    *response.headers_mut() = reply.headers;
    response
}

/// Run an `/api...` request through the engine.
///
/// The engine runs on its own task and outlives the peer; the client is
/// released once it finishes.
pub(crate) async fn handle_api(
    state: &AppState,
    parts: Parts,
    body: Body,
    address: String,
) -> Response<Body> {
    let body = match axum::body::to_bytes(body, state.config.max_body_size).await {
        Ok(body) => body,
        Err(err) => {
            warn!(client = %address, error = %err, "request body rejected");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };
    let query = Query::<Vec<(String, String)>>::try_from_uri(&parts.uri)
        .map(|Query(query)| query)
        .unwrap_or_default();
    let request = HttpRequest {
        method: parts.method,
        path: parts.uri.path().to_owned(),
        query,
        headers: parts.headers,
        body,
    };

    let (transport, reply) = HttpTransport::new(address, Arc::clone(&state.transport_options));
    let client = state.protocol.create_client(Transport::Http(transport));
    let protocol = Arc::clone(&state.protocol);
    drop(tokio::spawn(async move {
        protocol.handle_http_request(&client, request).await;
        // Answers 503 if nothing was sent.
        client.close();
        protocol.release_client(&client);
    }));

    match reply.await {
        Ok(reply) => into_response(reply),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Serve a non-API path from the configured static files, else 404.
pub(crate) async fn handle_static(state: &AppState, path: &str, address: String) -> Response<Body> {
    let Some(files) = state.static_files.as_ref().filter(|_| state.config.serve_static) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let (transport, mut reply) = HttpTransport::new(address, Arc::clone(&state.transport_options));
    files.serve(path, &transport).await;
    match reply.try_recv() {
        Ok(reply) => into_response(reply),
        Err(_) => {
            debug!(path, "no static reply");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// Redirect to the balancer's pick, or 503 when the pool is empty.
pub(crate) fn handle_balancer(state: &AppState, parts: &Parts, address: &str) -> Response<Body> {
    let Some(balancer) = state.balancer.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let host = parts
        .headers
        .get(axum::http::header::HOST)
        .and_then(|value| value.to_str().ok());
    let path = parts
        .uri
        .path_and_query()
        .map_or("/", |path| path.as_str());
    let Some(location) = balancer.redirect_location(host, path) else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    let (transport, mut reply) = HttpTransport::new(address, Arc::clone(&state.transport_options));
    if let Err(err) = transport.redirect(&location) {
        debug!(error = %err, "redirect not delivered");
    }
    debug!(client = %address, location, "balanced");
    match reply.try_recv() {
        Ok(reply) => into_response(reply),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

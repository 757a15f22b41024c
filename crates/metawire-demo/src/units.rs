//! Example units served by the demo host.

use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use metawire_protocol::{
    Access, Context, HandlerError, MethodRegistry, Procedure, SessionData, procedure,
};
use serde_json::{Value, json};
use tracing::debug;

const DOWNLOAD: &[u8] = b"metawire demo download\n";

/// Build the registry with every example unit.
pub fn registry() -> Arc<MethodRegistry> {
    let registry = Arc::new(MethodRegistry::new());
    register_auth(&registry);
    register_example(&registry);
    register_files(&registry);
    register_system(&registry);
    registry.register_hook("status", StatusHook::new());
    registry
}

fn register_system(registry: &Arc<MethodRegistry>) {
    let weak: Weak<MethodRegistry> = Arc::downgrade(registry);
    registry.register_method(
        "system",
        "1",
        "introspect",
        procedure(Access::Public, move |_ctx, _args| {
            let methods = weak.upgrade().map(|r| r.methods()).unwrap_or_default();
            async move { Ok(json!(methods)) }
        }),
    );
}

fn register_auth(registry: &MethodRegistry) {
    registry.register_method(
        "auth",
        "1",
        "signin",
        procedure(Access::Public, |ctx: Context, args: Value| async move {
            let login = args["login"].as_str().unwrap_or_default();
            if login.is_empty() {
                return Err(HandlerError::status(400, "login is required"));
            }
            let token = ctx.uuid.simple().to_string();
            let mut data = SessionData::new();
            let _ = data.insert("login".into(), json!(login));
            let _ = ctx.client.start_session(&token, data);
            debug!(login, "signed in");
            Ok(json!({"token": token}))
        }),
    );
    registry.register_method(
        "auth",
        "1",
        "restore",
        procedure(Access::Public, |ctx: Context, args: Value| async move {
            let token = args["token"].as_str().unwrap_or_default();
            Ok(json!(ctx.client.restore_session(token)))
        }),
    );
    registry.register_method(
        "auth",
        "1",
        "signout",
        procedure(Access::Session, |ctx: Context, _args| async move {
            Ok(json!(ctx.client.finalize_session()))
        }),
    );
}

fn register_example(registry: &MethodRegistry) {
    registry.register_method(
        "example",
        "1",
        "counter",
        procedure(Access::Session, |ctx: Context, _args| async move {
            let session = ctx
                .session
                .ok_or_else(|| HandlerError::status(403, "no session"))?;
            let count = session
                .state()
                .get("counter")
                .and_then(|value| value.as_u64())
                .unwrap_or(0)
                + 1;
            session.state().set("counter", json!(count));
            Ok(json!(count))
        }),
    );
}

fn register_files(registry: &MethodRegistry) {
    registry.register_method(
        "files",
        "1",
        "download",
        procedure(Access::Public, |ctx: Context, _args| async move {
            let failed = |err: metawire_protocol::ProtocolError| HandlerError::Failed(err.to_string());
            let stream = ctx
                .client
                .create_stream("download.txt", DOWNLOAD.len() as u64)
                .await
                .map_err(failed)?;
            stream.write(DOWNLOAD).await.map_err(failed)?;
            stream.end().await.map_err(failed)?;
            Ok(json!({"stream": stream.id().to_string()}))
        }),
    );
}

/// `/api/status/...` hook reporting uptime and the request it saw.
struct StatusHook {
    started: Instant,
}

impl StatusHook {
    fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

#[async_trait]
impl Procedure for StatusHook {
    fn access(&self) -> Access {
        Access::Public
    }

    async fn invoke(&self, _ctx: Context, params: Value) -> Result<Value, HandlerError> {
        Ok(json!({
            "status": "ok",
            "uptime_secs": self.started.elapsed().as_secs(),
            "verb": params["verb"],
            "method": params["method"],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metawire_protocol::Application;

    #[test]
    fn registers_every_unit() {
        let registry = registry();
        assert_eq!(
            registry.methods(),
            vec![
                "auth.1/restore",
                "auth.1/signin",
                "auth.1/signout",
                "example.1/counter",
                "files.1/download",
                "system.1/introspect",
            ]
        );
        assert!(registry.has_hook("status"));
    }

    #[test]
    fn unpinned_calls_resolve_latest_version() {
        let registry = registry();
        assert!(registry.lookup_method("system", "*", "introspect").is_some());
        assert!(registry.lookup_method("system", "2", "introspect").is_none());
    }

    #[test]
    fn status_hook_is_public() {
        assert_eq!(StatusHook::new().access(), Access::Public);
    }
}

//! Method and hook lookup supplied by the host application.
//!
//! The engine only looks procedures up and runs them through
//! `enter` → `invoke` → `leave`; it never looks inside a handler.
//! [`MethodRegistry`] is a ready-made in-memory [`Application`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::context::Context;
use crate::error::{AdmissionError, HandlerError};
use crate::packet::MethodPath;

/// Who may call a procedure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    /// Anyone, session or not.
    Public,
    /// Only clients with a bound session.
    #[default]
    Session,
}

/// A callable method or hook.
#[async_trait]
pub trait Procedure: Send + Sync {
    /// Access level checked before `enter`.
    fn access(&self) -> Access {
        Access::Session
    }

    /// Admission gate. A rejection answers 503 and skips `invoke`.
    async fn enter(&self) -> Result<(), AdmissionError> {
        Ok(())
    }

    /// Run the handler.
    async fn invoke(&self, ctx: Context, args: Value) -> Result<Value, HandlerError>;

    /// Cleanup after `invoke`, run whether it succeeded or not.
    fn leave(&self) {}
}

/// Procedure lookup used by the engine.
pub trait Application: Send + Sync {
    /// Method `unit`/`method` at `version` (`*` when the caller did not pin one).
    fn lookup_method(&self, unit: &str, version: &str, method: &str)
    -> Option<Arc<dyn Procedure>>;

    /// REST hook registered for `unit`.
    fn lookup_hook(&self, unit: &str) -> Option<Arc<dyn Procedure>>;
}

// ── Closure-backed procedures ───────────────────────────────────────

struct Gate {
    permits: Arc<Semaphore>,
    queue_timeout: Duration,
}

/// A [`Procedure`] backed by an async closure.
pub struct FnProcedure<F> {
    access: Access,
    gate: Option<Gate>,
    handler: F,
}

/// Wrap `handler` as a procedure with the given access level.
pub fn procedure<F, Fut>(access: Access, handler: F) -> FnProcedure<F>
where
    F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnProcedure {
        access,
        gate: None,
        handler,
    }
}

impl<F> FnProcedure<F> {
    /// Admit at most `concurrency` calls at once; later calls queue for up
    /// to `queue_timeout` before being rejected.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize, queue_timeout: Duration) -> Self {
        self.gate = Some(Gate {
            permits: Arc::new(Semaphore::new(concurrency)),
            queue_timeout,
        });
        self
    }
}

#[async_trait]
impl<F, Fut> Procedure for FnProcedure<F>
where
    F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    fn access(&self) -> Access {
        self.access
    }

    async fn enter(&self) -> Result<(), AdmissionError> {
        let Some(gate) = &self.gate else {
            return Ok(());
        };
        match tokio::time::timeout(gate.queue_timeout, gate.permits.acquire()).await {
            // Released again in `leave`.
            Ok(Ok(permit)) => {
                permit.forget();
                Ok(())
            }
            Ok(Err(_)) => Err(AdmissionError("gate closed".into())),
            Err(_) => Err(AdmissionError(format!(
                "queue timeout after {:?}",
                gate.queue_timeout
            ))),
        }
    }

    async fn invoke(&self, ctx: Context, args: Value) -> Result<Value, HandlerError> {
        (self.handler)(ctx, args).await
    }

    fn leave(&self) {
        if let Some(gate) = &self.gate {
            gate.permits.add_permits(1);
        }
    }
}

// ── In-memory registry ──────────────────────────────────────────────

type UnitMethods = HashMap<String, HashMap<String, Arc<dyn Procedure>>>;

/// In-memory [`Application`] with versioned units.
///
/// Lookup tries the exact version, then a `*` registration; an unpinned
/// call (`*`) with no `*` registration picks the highest numeric version.
#[derive(Default)]
pub struct MethodRegistry {
    // unit -> version -> method -> procedure
    methods: RwLock<HashMap<String, UnitMethods>>,
    hooks: RwLock<HashMap<String, Arc<dyn Procedure>>>,
}

impl MethodRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `unit.version/method`. Replaces an existing entry.
    pub fn register_method(
        &self,
        unit: &str,
        version: &str,
        method: &str,
        procedure: impl Procedure + 'static,
    ) {
        let _ = self
            .methods
            .write()
            .entry(unit.to_owned())
            .or_default()
            .entry(version.to_owned())
            .or_default()
            .insert(method.to_owned(), Arc::new(procedure));
    }

    /// Register the REST hook for `unit`.
    pub fn register_hook(&self, unit: &str, procedure: impl Procedure + 'static) {
        let _ = self
            .hooks
            .write()
            .insert(unit.to_owned(), Arc::new(procedure));
    }

    /// All registered methods as sorted `unit.version/method` strings.
    pub fn methods(&self) -> Vec<String> {
        let methods = self.methods.read();
        let mut names: Vec<String> = methods
            .iter()
            .flat_map(|(unit, versions)| {
                versions.iter().flat_map(move |(version, procs)| {
                    procs
                        .keys()
                        .map(move |method| format!("{unit}.{version}/{method}"))
                })
            })
            .collect();
        names.sort();
        names
    }

    /// Whether `unit` has a hook.
    pub fn has_hook(&self, unit: &str) -> bool {
        self.hooks.read().contains_key(unit)
    }
}

fn latest_version(versions: &UnitMethods) -> Option<&HashMap<String, Arc<dyn Procedure>>> {
    versions
        .iter()
        .filter_map(|(version, procs)| version.parse::<u64>().ok().map(|v| (v, procs)))
        .max_by_key(|(version, _)| *version)
        .map(|(_, procs)| procs)
}

impl Application for MethodRegistry {
    fn lookup_method(
        &self,
        unit: &str,
        version: &str,
        method: &str,
    ) -> Option<Arc<dyn Procedure>> {
        let methods = self.methods.read();
        let versions = methods.get(unit)?;
        let found = versions
            .get(version)
            .and_then(|procs| procs.get(method))
            .or_else(|| {
                versions
                    .get(MethodPath::ANY_VERSION)
                    .and_then(|procs| procs.get(method))
            })
            .or_else(|| {
                (version == MethodPath::ANY_VERSION)
                    .then(|| latest_version(versions))
                    .flatten()
                    .and_then(|procs| procs.get(method))
            });
        found.cloned()
    }

    fn lookup_hook(&self, unit: &str) -> Option<Arc<dyn Procedure>> {
        self.hooks.read().get(unit).cloned()
    }
}

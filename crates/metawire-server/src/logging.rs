//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Transport crates that log every frame at `debug` and below.
const NOISY_TARGETS: &[&str] = &["hyper", "hyper_util", "tungstenite", "tokio_tungstenite"];

/// Filter directives for `level`, with frame-level transport noise capped
/// at `info`.
pub fn default_directives(level: &str) -> String {
    let mut directives = level.to_owned();
    for target in NOISY_TARGETS {
        directives.push_str(&format!(",{target}=info"));
    }
    directives
}

/// Install the global stderr subscriber.
///
/// `RUST_LOG` replaces the default directives when set. Later calls are
/// no-ops.
pub fn init_subscriber(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(level)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

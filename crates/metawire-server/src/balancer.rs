//! Balancer role: redirect every request to a random port of the pool.

use rand::seq::IndexedRandom;

/// Host used when the request carried no `Host` header.
const MISSING_HOST: &str = "no-host-name-in-http-headers";

/// Uniform random redirector over a fixed port pool.
#[derive(Clone, Debug)]
pub struct Balancer {
    scheme: String,
    ports: Vec<u16>,
}

impl Balancer {
    /// Balance over `ports`, redirecting with `scheme`.
    pub fn new(scheme: impl Into<String>, ports: Vec<u16>) -> Self {
        Self {
            scheme: scheme.into(),
            ports,
        }
    }

    /// Target port, uniformly at random. `None` for an empty pool.
    pub fn pick(&self) -> Option<u16> {
        self.ports.choose(&mut rand::rng()).copied()
    }

    /// Redirect target for a request with `host_header` and `path`.
    pub fn redirect_location(&self, host_header: Option<&str>, path: &str) -> Option<String> {
        let port = self.pick()?;
        Some(redirect_location(&self.scheme, host_header, port, path))
    }
}

/// `scheme://host:port/path`, with the port of `host_header` replaced.
pub fn redirect_location(scheme: &str, host_header: Option<&str>, port: u16, path: &str) -> String {
    let host = host_header.map_or(MISSING_HOST, strip_port);
    let path = if path.is_empty() { "/" } else { path };
    format!("{scheme}://{host}:{port}{path}")
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // [v6]:port
        return host.find(']').map_or(host, |end| &host[..=end]);
    }
    host.split_once(':').map_or(host, |(name, _)| name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn pick_stays_in_pool() {
        let balancer = Balancer::new("http", vec![8001, 8002, 8003]);
        let picked: HashSet<u16> = (0..200).filter_map(|_| balancer.pick()).collect();
        assert!(picked.iter().all(|p| [8001, 8002, 8003].contains(p)));
        assert!(picked.len() > 1);
    }

    #[test]
    fn empty_pool_picks_nothing() {
        let balancer = Balancer::new("http", Vec::new());
        assert!(balancer.pick().is_none());
        assert!(balancer.redirect_location(Some("a"), "/").is_none());
    }

    #[test]
    fn location_replaces_port() {
        assert_eq!(
            redirect_location("https", Some("example.com:8000"), 8002, "/api/x?y=1"),
            "https://example.com:8002/api/x?y=1"
        );
        assert_eq!(
            redirect_location("http", Some("example.com"), 8001, "/"),
            "http://example.com:8001/"
        );
    }

    #[test]
    fn location_handles_ipv6_and_missing_host() {
        assert_eq!(
            redirect_location("http", Some("[::1]:8000"), 8001, "/"),
            "http://[::1]:8001/"
        );
        assert_eq!(
            redirect_location("http", None, 8001, ""),
            "http://no-host-name-in-http-headers:8001/"
        );
    }

    #[test]
    fn balancer_location_uses_pool() {
        let balancer = Balancer::new("http", vec![9005]);
        assert_eq!(
            balancer.redirect_location(Some("h:1"), "/api").as_deref(),
            Some("http://h:9005/api")
        );
    }
}

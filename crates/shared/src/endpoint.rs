//! The endpoint table entry: a single database node as seen by discovery.

use std::time::Instant;

/// A network address of one database node, including its assigned database
/// path and load factor.
///
/// Equality and hashing are defined over `(host, port)` only — `load_factor`
/// and `pessimized_until` change on every discovery cycle without the
/// endpoint becoming a "different" endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub load_factor: f32,
    pessimized_until: Option<Instant>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            load_factor: 0.0,
            pessimized_until: None,
        }
    }

    pub fn with_load_factor(mut self, load_factor: f32) -> Self {
        self.load_factor = load_factor;
        self
    }

    /// `host:port`, used for logging and as the map key callers reach for
    /// when they don't want to build the full `(host, port)` tuple.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_pessimized(&self, now: Instant) -> bool {
        matches!(self.pessimized_until, Some(until) if until > now)
    }

    pub fn pessimize_until(&mut self, until: Instant) {
        self.pessimized_until = Some(until);
    }

    pub fn pessimized_until(&self) -> Option<Instant> {
        self.pessimized_until
    }

    fn key(&self) -> (&str, u16) {
        (&self.host, self.port)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Endpoint {}

impl std::hash::Hash for Endpoint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_load_factor_and_pessimization() {
        let mut a = Endpoint::new("node-1", 2135, "/Root/db").with_load_factor(0.1);
        let b = Endpoint::new("node-1", 2135, "/Root/db").with_load_factor(0.9);
        assert_eq!(a, b);

        a.pessimize_until(Instant::now() + std::time::Duration::from_secs(60));
        assert_eq!(a, b);
    }

    #[test]
    fn different_port_is_a_different_endpoint() {
        let a = Endpoint::new("node-1", 2135, "/Root/db");
        let b = Endpoint::new("node-1", 2136, "/Root/db");
        assert_ne!(a, b);
    }

    #[test]
    fn pessimization_expires_by_time() {
        let mut e = Endpoint::new("node-1", 2135, "/Root/db");
        let now = Instant::now();
        assert!(!e.is_pessimized(now));
        e.pessimize_until(now + std::time::Duration::from_millis(10));
        assert!(e.is_pessimized(now));
        assert!(!e.is_pessimized(now + std::time::Duration::from_millis(20)));
    }
}

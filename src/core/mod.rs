/// Core abstractions: endpoints, topology signatures, backend connections,
/// role pools, the response cache and client sessions
pub mod cache;
pub mod connection;
pub mod pool;
pub mod session;

pub use cache::ResponseCache;
pub use connection::BackendConnection;
pub use pool::RolePool;
pub use session::{Session, SessionTimeouts, DEFAULT_MAX_REQUEST_BYTES};

use crate::error::TopologyError;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Host and port of one backend or sentinel process
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TopologyError::InvalidEndpoint(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(TopologyError::InvalidEndpoint(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| TopologyError::InvalidEndpoint(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Content hash of an ordered endpoint list, used as a topology generation tag.
///
/// The empty signature means "no topology known" and is never produced by
/// hashing a non-empty list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Signature(String);

impl Signature {
    /// The "nothing known" sentinel
    pub fn empty() -> Self {
        Self::default()
    }

    /// Hash an ordered sequence of endpoint strings. An empty sequence yields
    /// the empty signature.
    pub fn of<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hasher = Sha256::new();
        let mut any = false;
        for part in parts {
            hasher.update(part.as_ref().as_bytes());
            hasher.update(b"\n");
            any = true;
        }
        if !any {
            return Self::empty();
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Signature of a single endpoint
    pub fn of_endpoint(endpoint: &Endpoint) -> Self {
        Self::of([endpoint.to_string()])
    }

    /// Signature of a replica set; endpoints are sorted first so that any
    /// permutation of the same set hashes identically
    pub fn of_endpoint_set(endpoints: &[Endpoint]) -> Self {
        let mut names: Vec<String> = endpoints.iter().map(ToString::to_string).collect();
        names.sort();
        Self::of(names)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "<none>")
        } else {
            // Short form is enough to tell generations apart in logs
            write!(f, "{}", &self.0[..12.min(self.0.len())])
        }
    }
}

/// Which pool serves a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Primary,
    Replica,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Replica => write!(f, "replica"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse_and_display() {
        let endpoint: Endpoint = "10.0.0.5:6380".parse().unwrap();
        assert_eq!(endpoint.host(), "10.0.0.5");
        assert_eq!(endpoint.port(), 6380);
        assert_eq!(endpoint.to_string(), "10.0.0.5:6380");

        let v6: Endpoint = "[::1]:6379".parse().unwrap();
        assert_eq!(v6.host(), "::1");
        assert_eq!(v6.to_string(), "[::1]:6379");
    }

    #[test]
    fn test_endpoint_parse_errors() {
        assert!("localhost".parse::<Endpoint>().is_err());
        assert!(":6379".parse::<Endpoint>().is_err());
        assert!("host:99999".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_signature_is_deterministic() {
        let a = Signature::of(["127.0.0.1:6379"]);
        let b = Signature::of(["127.0.0.1:6379"]);
        let c = Signature::of(["127.0.0.1:6380"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_empty_signature_sentinel() {
        let none: [&str; 0] = [];
        assert!(Signature::of(none).is_empty());
        assert!(Signature::of_endpoint_set(&[]).is_empty());
        assert!(!Signature::of([""]).is_empty());
        assert_eq!(Signature::empty().to_string(), "<none>");
    }

    #[test]
    fn test_replica_signature_is_order_invariant() {
        let a = Endpoint::new("10.0.0.1", 6379);
        let b = Endpoint::new("10.0.0.2", 6379);
        let c = Endpoint::new("10.0.0.3", 6380);

        let permutations = [
            vec![a.clone(), b.clone(), c.clone()],
            vec![c.clone(), a.clone(), b.clone()],
            vec![b.clone(), c.clone(), a.clone()],
            vec![c.clone(), b.clone(), a.clone()],
        ];
        let expected = Signature::of_endpoint_set(&permutations[0]);
        for endpoints in &permutations {
            assert_eq!(Signature::of_endpoint_set(endpoints), expected);
        }

        assert_ne!(Signature::of_endpoint_set(&[a.clone(), b.clone()]), expected);
    }

    #[test]
    fn test_concatenation_does_not_collide() {
        assert_ne!(Signature::of(["a:1", "2"]), Signature::of(["a:12"]));
    }
}

//! Pool connections and their lifecycle.
//!
//! [`manager::PoolManager`] owns every configured pool. Each live pool has a
//! [`connection::PoolConnection`], pairing a transport with a protocol
//! session. Everything here runs on the IO thread; other threads only ever
//! see a [`PoolId`].

pub mod connection;
pub mod manager;
pub mod stats;

use crate::stratum::{StratumError, StratumResult};

pub use manager::{ManagerSettings, PoolEvent, PoolManager, Readiness, Submission};
pub use stats::{PoolStats, ShareStats};

/// Opaque pool identity, safe to hand to other threads.
pub type PoolId = slotmap::DefaultKey;

/// Where a pool lives, parsed from its URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Scheme after the optional `stratum+` prefix, `http` if absent
    pub service: String,
    pub host: String,
    pub explicit_port: Option<String>,
}

impl Endpoint {
    /// Parse `[stratum+][service://]host[:port][/]`.
    pub fn parse(url: &str) -> StratumResult<Self> {
        let rest = url.strip_prefix("stratum+").unwrap_or(url);
        let (service, rest) = match rest.split_once("://") {
            Some((service, rest)) => (service.to_string(), rest),
            None => ("http".to_string(), rest),
        };
        let rest = rest.strip_suffix('/').unwrap_or(rest);
        let (host, explicit_port) = match rest.split_once(':') {
            Some((host, port)) => (host, Some(port.to_string())),
            None => (rest, None),
        };

        if host.is_empty() {
            return Err(StratumError::InvalidUrl(format!("{}: missing host", url)));
        }
        if let Some(port) = &explicit_port {
            if port.parse::<u16>().is_err() {
                return Err(StratumError::InvalidUrl(format!("{}: bad port {}", url, port)));
            }
        }

        Ok(Self {
            service,
            host: host.to_string(),
            explicit_port,
        })
    }

    /// Port or service name to connect to.
    pub fn port(&self) -> &str {
        self.explicit_port.as_deref().unwrap_or(&self.service)
    }
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Connection attempt started
    Connecting,
    /// Socket connected, session created
    Ready,
    /// Deliberately closed
    Closing,
    /// A live connection was lost
    Failed,
    FailedResolve,
    BadSocket,
    FailedConnect,
    NoRoutes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("stratum+tcp://pool.example.com:3333", "tcp", "pool.example.com", Some("3333"); "stratum tcp")]
    #[test_case("http://p2pool.local:9332/", "http", "p2pool.local", Some("9332"); "trailing slash")]
    #[test_case("pool.example.com:4444", "http", "pool.example.com", Some("4444"); "no scheme")]
    #[test_case("stratum+tcp://pool.example.com", "tcp", "pool.example.com", None; "no port")]
    fn test_endpoint_parse(url: &str, service: &str, host: &str, port: Option<&str>) {
        let endpoint = Endpoint::parse(url).unwrap();
        assert_eq!(endpoint.service, service);
        assert_eq!(endpoint.host, host);
        assert_eq!(endpoint.explicit_port.as_deref(), port);
    }

    #[test]
    fn test_endpoint_port_falls_back_to_service() {
        assert_eq!(Endpoint::parse("stratum+tcp://a:3333").unwrap().port(), "3333");
        assert_eq!(Endpoint::parse("http://a").unwrap().port(), "http");
    }

    #[test]
    fn test_endpoint_errors() {
        assert!(matches!(
            Endpoint::parse("stratum+tcp://:3333"),
            Err(StratumError::InvalidUrl(_))
        ));
        assert!(matches!(
            Endpoint::parse("stratum+tcp://host:port"),
            Err(StratumError::InvalidUrl(_))
        ));
    }
}

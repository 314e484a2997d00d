//! Proxy chains
//!
//! A chain is the full ordered path a request takes through the IP
//! Protection proxies, one hostname per [`ProxyLayer`](crate::ProxyLayer).

use serde::{Deserialize, Serialize};

/// Transport used to reach the proxies of a chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    /// CONNECT over HTTPS (TCP)
    #[default]
    Https,
    /// CONNECT-UDP / MASQUE over QUIC
    Quic,
}

/// Ordered list of proxy hostnames forming one route
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyChain {
    /// Hostnames, first hop first
    pub hops: Vec<String>,
    /// Transport for every hop in the chain
    #[serde(default)]
    pub scheme: ProxyScheme,
}

impl ProxyChain {
    /// Create an HTTPS chain
    pub fn new<I, S>(hops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hops: hops.into_iter().map(Into::into).collect(),
            scheme: ProxyScheme::Https,
        }
    }

    /// Create a QUIC chain
    pub fn quic<I, S>(hops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scheme: ProxyScheme::Quic,
            ..Self::new(hops)
        }
    }

    /// Number of hops
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// Check if the chain has no hops
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Check if the chain is reached over QUIC
    pub fn is_quic(&self) -> bool {
        self.scheme == ProxyScheme::Quic
    }

    /// Hostname for a given hop
    pub fn hop(&self, index: usize) -> Option<&str> {
        self.hops.get(index).map(String::as_str)
    }
}

impl std::fmt::Display for ProxyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = match self.scheme {
            ProxyScheme::Https => "https",
            ProxyScheme::Quic => "quic",
        };
        write!(f, "[{}] {}", scheme, self.hops.join(" -> "))
    }
}

//! Blind-signed auth tokens
//!
//! A token is a single-use credential for one proxy layer. The cache never
//! inspects the token body; it only tracks expiration and the geo the
//! issuer associated with the batch.

use crate::geo::GeoHint;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// One hop of a multi-hop proxy chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyLayer {
    /// First hop (client-facing proxy)
    ProxyA,
    /// Second hop (egress proxy)
    ProxyB,
}

impl ProxyLayer {
    /// Get all proxy layers in chain order
    pub fn all() -> &'static [ProxyLayer] {
        &[ProxyLayer::ProxyA, ProxyLayer::ProxyB]
    }

    /// Position of this layer within a proxy chain
    pub fn index(&self) -> usize {
        match self {
            ProxyLayer::ProxyA => 0,
            ProxyLayer::ProxyB => 1,
        }
    }

    /// Layer at a chain position
    pub fn from_index(index: usize) -> Option<Self> {
        Self::all().get(index).copied()
    }
}

impl std::fmt::Display for ProxyLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyLayer::ProxyA => write!(f, "proxy-a"),
            ProxyLayer::ProxyB => write!(f, "proxy-b"),
        }
    }
}

/// A single usable blind-signed token
#[derive(Clone, PartialEq, Eq)]
pub struct BlindSignedAuthToken {
    /// Opaque token value, sent to the proxy as-is
    pub token: String,
    /// Absolute expiration time
    pub expiration: SystemTime,
    /// Geo the issuer bound this token to
    pub geo_hint: GeoHint,
}

impl BlindSignedAuthToken {
    /// Create a new token
    pub fn new(token: impl Into<String>, expiration: SystemTime, geo_hint: GeoHint) -> Self {
        Self {
            token: token.into(),
            expiration,
            geo_hint,
        }
    }

    /// Whether the token can no longer be handed out at `now`
    ///
    /// `margin` keeps tokens that are about to lapse from being served.
    pub fn is_expired(&self, now: SystemTime, margin: Duration) -> bool {
        match now.checked_add(margin) {
            Some(deadline) => deadline >= self.expiration,
            None => true,
        }
    }
}

// Token bodies are credentials; keep them out of logs.
impl std::fmt::Debug for BlindSignedAuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlindSignedAuthToken")
            .field("token", &"<redacted>")
            .field("expiration", &self.expiration)
            .field("geo_hint", &self.geo_hint)
            .finish()
    }
}

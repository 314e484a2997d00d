//! Config getter interface
//!
//! The getter is the bridge to the trusted process that talks to the token
//! issuer and the proxy-list service. The cache only consumes it; transport
//! and issuance live elsewhere.

use crate::geo::GeoHint;
use crate::proxy_chain::ProxyChain;
use crate::token::{BlindSignedAuthToken, ProxyLayer};
use async_trait::async_trait;
use std::time::SystemTime;

/// Outcome of a token batch request
#[derive(Debug, Clone, Default)]
pub struct TryGetAuthTokensResult {
    /// Issued tokens, `None` on failure
    pub tokens: Option<Vec<BlindSignedAuthToken>>,
    /// Earliest time the next request may be made
    pub try_again_after: Option<SystemTime>,
}

impl TryGetAuthTokensResult {
    /// Successful batch
    pub fn tokens(tokens: Vec<BlindSignedAuthToken>) -> Self {
        Self {
            tokens: Some(tokens),
            try_again_after: None,
        }
    }

    /// Failed batch with a server-supplied cooldown
    pub fn try_again_after(at: SystemTime) -> Self {
        Self {
            tokens: None,
            try_again_after: Some(at),
        }
    }

    /// Failed batch without any cooldown hint
    pub fn failed() -> Self {
        Self::default()
    }
}

/// Outcome of a proxy list request
#[derive(Debug, Clone, Default)]
pub struct GetProxyListResult {
    /// Proxy chains, `None` on failure
    pub proxy_chains: Option<Vec<ProxyChain>>,
    /// Geo the list was computed for
    pub geo_hint: Option<GeoHint>,
}

impl GetProxyListResult {
    /// Successful list
    pub fn chains(proxy_chains: Vec<ProxyChain>, geo_hint: Option<GeoHint>) -> Self {
        Self {
            proxy_chains: Some(proxy_chains),
            geo_hint,
        }
    }

    /// Failed fetch
    pub fn failed() -> Self {
        Self::default()
    }
}

/// Remote source of tokens and proxy lists
///
/// Implementations must not fail loudly: every transport problem is
/// reported through the `None` fields of the result types.
#[async_trait]
pub trait IpProtectionConfigGetter: Send + Sync + 'static {
    /// Request a batch of `batch_size` tokens for one proxy layer
    async fn try_get_auth_tokens(
        &self,
        batch_size: u32,
        proxy_layer: ProxyLayer,
    ) -> TryGetAuthTokensResult;

    /// Request the current list of proxy chains
    async fn get_proxy_list(&self) -> GetProxyListResult;
}

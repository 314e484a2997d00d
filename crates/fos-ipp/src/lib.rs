//! fOS IP Protection - Token and Proxy List Cache
//!
//! Keeps blind-signed auth tokens and the proxy chain list ready for the
//! request path of the privacy proxy. Everything the request path touches
//! is synchronous and I/O free; refills run as background tasks against
//! the trusted config getter.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Network Context                          │
//! │                                                              │
//! │  ┌──────────┐    ┌──────────────────────────────┐            │
//! │  │ Request  │───▶│  IpProtectionConfigCacheImpl │◀── network │
//! │  │  path    │    │  (QUIC latch, geo policy)    │    changes │
//! │  └──────────┘    └──────┬───────────────┬───────┘            │
//! │                         │               │                    │
//! │            ┌────────────▼───┐   ┌───────▼────────────┐       │
//! │            │ TokenManager   │   │ ProxyConfigManager │       │
//! │            │ (per layer)    │   │ (chain list)       │       │
//! │            └────────┬───────┘   └───────┬────────────┘       │
//! └─────────────────────│───────────────────│────────────────────┘
//!                       │  async fetches    │
//!                       ▼                   ▼
//!              ┌───────────────────────────────────┐
//!              │     IpProtectionConfigGetter      │
//!              │ (token issuer / proxy list, IPC)  │
//!              └───────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Single use**: a token is handed out at most once and never after it expires
//! - **All layers ready**: tokens count as available only when every hop has one
//! - **One fetch at a time**: refill and refresh requests coalesce per layer / list
//! - **Stale over empty**: a failed proxy list refresh keeps the previous list

mod clock;
mod config;
mod config_cache;
mod geo;
mod getter;
mod network;
mod proxy_chain;
mod proxy_config_manager;
mod token;
mod token_manager;

#[cfg(test)]
mod testing;

pub use clock::{Clock, SystemClock};
pub use config::{ConfigError, IpProtectionConfig};
pub use config_cache::{IpProtectionConfigCache, IpProtectionConfigCacheImpl};
pub use geo::{GeoHint, GeoObserver};
pub use getter::{GetProxyListResult, IpProtectionConfigGetter, TryGetAuthTokensResult};
pub use network::{ConnectionType, NetworkChangeObserver, spawn_network_change_listener};
pub use proxy_chain::{ProxyChain, ProxyScheme};
pub use proxy_config_manager::{IpProtectionProxyConfigManager, IpProtectionProxyConfigManagerImpl};
pub use token::{BlindSignedAuthToken, ProxyLayer};
pub use token_manager::{IpProtectionTokenManager, IpProtectionTokenManagerImpl, TokenManagerStats};

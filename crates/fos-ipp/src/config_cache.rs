//! IP Protection config cache
//!
//! Single point of contact for the request path. Owns one token manager per
//! proxy layer plus the proxy list manager, and applies the cross-cutting
//! policies: geo consistency between tokens and proxy chains, QUIC fallback,
//! and refresh after connectivity changes.
//!
//! # Usage
//!
//! ```rust,ignore
//! let cache = IpProtectionConfigCacheImpl::new(config, Some(getter), Arc::new(SystemClock));
//! cache.watch_network_changes(connection_rx);
//!
//! // Request path: synchronous, never blocks
//! if cache.are_auth_tokens_available() && cache.is_proxy_list_available() {
//!     let chains = cache.get_proxy_chain_list();
//!     let first_hop = cache.get_auth_token(0);
//!     let second_hop = cache.get_auth_token(1);
//! }
//! ```

use crate::clock::{Clock, SystemClock};
use crate::config::IpProtectionConfig;
use crate::geo::GeoObserver;
use crate::getter::IpProtectionConfigGetter;
use crate::network::{ConnectionType, NetworkChangeObserver, spawn_network_change_listener};
use crate::proxy_chain::ProxyChain;
use crate::proxy_config_manager::{IpProtectionProxyConfigManager, IpProtectionProxyConfigManagerImpl};
use crate::token::{BlindSignedAuthToken, ProxyLayer};
use crate::token_manager::{IpProtectionTokenManager, IpProtectionTokenManagerImpl, TokenManagerStats};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Request-path interface to IP Protection tokens and proxy chains
pub trait IpProtectionConfigCache: GeoObserver + NetworkChangeObserver {
    /// Check if every configured proxy layer has a token ready
    ///
    /// A cache with no layers has nothing to attach to a request and
    /// reports `false`.
    fn are_auth_tokens_available(&self) -> bool;

    /// Take a token for the layer at `chain_index`
    fn get_auth_token(&self, chain_index: usize) -> Option<BlindSignedAuthToken>;

    /// Clear the try-again-after cooldown of every layer
    fn invalidate_try_again_after_time(&self);

    /// Check if a proxy list has been fetched
    fn is_proxy_list_available(&self) -> bool;

    /// Proxy chains usable right now
    fn get_proxy_chain_list(&self) -> Vec<ProxyChain>;

    /// Fetch a fresh proxy list in the background
    fn request_refresh_proxy_list(&self);

    /// Stop offering QUIC proxies until the network changes
    fn quic_proxies_failed(&self);

    /// Check if QUIC proxies may be attempted
    fn is_ip_protection_over_quic_enabled(&self) -> bool;
}

struct CacheShared {
    token_managers: Vec<Arc<dyn IpProtectionTokenManager>>,
    proxy_config_manager: Arc<dyn IpProtectionProxyConfigManager>,
    /// QUIC allowed by configuration at all
    quic_enabled: bool,
    /// Cleared by a QUIC failure, re-armed by a network change
    ipp_over_quic: AtomicBool,
    last_connection_type: Mutex<Option<ConnectionType>>,
}

impl CacheShared {
    fn new(
        token_managers: Vec<Arc<dyn IpProtectionTokenManager>>,
        proxy_config_manager: Arc<dyn IpProtectionProxyConfigManager>,
        quic_enabled: bool,
    ) -> Self {
        Self {
            token_managers,
            proxy_config_manager,
            quic_enabled,
            ipp_over_quic: AtomicBool::new(quic_enabled),
            last_connection_type: Mutex::new(None),
        }
    }

    fn quic_allowed(&self) -> bool {
        self.quic_enabled && self.ipp_over_quic.load(Ordering::Relaxed)
    }
}

impl GeoObserver for CacheShared {
    fn geo_observed(&self, geo_id: &str) {
        if geo_id.is_empty() {
            return;
        }
        debug!("Geo observed: {}", geo_id);

        // Tokens may be geo-scoped, so every layer follows the new geo.
        for manager in &self.token_managers {
            if manager.current_geo().as_deref() != Some(geo_id) {
                manager.set_current_geo(geo_id);
            }
        }

        if self.proxy_config_manager.current_geo().as_deref() != Some(geo_id) {
            info!("Refreshing proxy list for geo {}", geo_id);
            self.proxy_config_manager.request_refresh_proxy_list();
        }
    }
}

impl NetworkChangeObserver for CacheShared {
    fn on_network_changed(&self, connection_type: ConnectionType) {
        let previous = self
            .last_connection_type
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(connection_type);
        info!(
            "Network changed: {} -> {}",
            previous.map_or_else(|| "unknown".to_string(), |t| t.to_string()),
            connection_type
        );

        if self.quic_enabled && !self.ipp_over_quic.swap(true, Ordering::Relaxed) {
            info!("Re-enabling QUIC proxies");
        }

        if !connection_type.is_online() {
            self.proxy_config_manager.invalidate_proxy_list();
            return;
        }

        for manager in &self.token_managers {
            manager.invalidate_try_again_after_time();
            if !manager.is_auth_token_available() {
                manager.request_refill();
            }
        }
        self.proxy_config_manager.request_refresh_proxy_list();
    }
}

/// Default [`IpProtectionConfigCache`]
///
/// Constructed once per network context and shared by reference with the
/// request path.
pub struct IpProtectionConfigCacheImpl {
    shared: Arc<CacheShared>,
}

impl IpProtectionConfigCacheImpl {
    /// Create a cache with one token manager per configured layer
    ///
    /// Nothing is fetched until the request path first asks for tokens or
    /// a proxy list refresh is requested.
    pub fn new(
        config: IpProtectionConfig,
        getter: Option<Arc<dyn IpProtectionConfigGetter>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<CacheShared>| {
            let observer: Weak<dyn GeoObserver> = weak.clone();

            let token_managers = config
                .layers
                .iter()
                .map(|layer| {
                    Arc::new(IpProtectionTokenManagerImpl::new(
                        *layer,
                        getter.clone(),
                        clock.clone(),
                        &config,
                        Some(observer.clone()),
                    )) as Arc<dyn IpProtectionTokenManager>
                })
                .collect();

            let proxy_config_manager = Arc::new(IpProtectionProxyConfigManagerImpl::new(
                getter.clone(),
                clock.clone(),
                Some(observer),
            ));

            CacheShared::new(token_managers, proxy_config_manager, config.enable_quic_proxies)
        });

        info!(
            "IP Protection cache initialized ({} layers, QUIC: {})",
            config.layers.len(),
            config.enable_quic_proxies
        );

        Self { shared }
    }

    /// Create with default configuration and the system clock
    pub fn with_defaults(getter: Option<Arc<dyn IpProtectionConfigGetter>>) -> Self {
        Self::new(IpProtectionConfig::default(), getter, Arc::new(SystemClock))
    }

    /// Create around existing managers
    ///
    /// Managers built this way report geo changes to whatever observer
    /// they were constructed with, not to this cache.
    pub fn with_managers(
        token_managers: Vec<Arc<dyn IpProtectionTokenManager>>,
        proxy_config_manager: Arc<dyn IpProtectionProxyConfigManager>,
        enable_quic_proxies: bool,
    ) -> Self {
        Self {
            shared: Arc::new(CacheShared::new(
                token_managers,
                proxy_config_manager,
                enable_quic_proxies,
            )),
        }
    }

    /// Forward connection type changes published on `rx`
    ///
    /// The listener stops once the cache is dropped. Returns `None` when
    /// called outside a tokio runtime.
    pub fn watch_network_changes(
        &self,
        rx: watch::Receiver<ConnectionType>,
    ) -> Option<JoinHandle<()>> {
        let shared: Weak<CacheShared> = Arc::downgrade(&self.shared);
        let observer: Weak<dyn NetworkChangeObserver> = shared;
        spawn_network_change_listener(observer, rx)
    }

    /// Configured layers, in chain order
    pub fn layers(&self) -> Vec<ProxyLayer> {
        self.shared
            .token_managers
            .iter()
            .map(|manager| manager.proxy_layer())
            .collect()
    }

    /// Per-layer token counters
    pub fn stats(&self) -> Vec<(ProxyLayer, TokenManagerStats)> {
        self.shared
            .token_managers
            .iter()
            .map(|manager| (manager.proxy_layer(), manager.stats()))
            .collect()
    }
}

impl GeoObserver for IpProtectionConfigCacheImpl {
    fn geo_observed(&self, geo_id: &str) {
        self.shared.geo_observed(geo_id);
    }
}

impl NetworkChangeObserver for IpProtectionConfigCacheImpl {
    fn on_network_changed(&self, connection_type: ConnectionType) {
        self.shared.on_network_changed(connection_type);
    }
}

impl IpProtectionConfigCache for IpProtectionConfigCacheImpl {
    fn are_auth_tokens_available(&self) -> bool {
        if self.shared.token_managers.is_empty() {
            return false;
        }

        // Ask every layer (no short-circuit) so each one gets a refill nudge.
        self.shared
            .token_managers
            .iter()
            .fold(true, |ready, manager| manager.is_auth_token_available() && ready)
    }

    fn get_auth_token(&self, chain_index: usize) -> Option<BlindSignedAuthToken> {
        debug_assert!(
            chain_index < self.shared.token_managers.len(),
            "proxy layer index {} out of range",
            chain_index
        );
        self.shared.token_managers.get(chain_index)?.get_auth_token()
    }

    fn invalidate_try_again_after_time(&self) {
        for manager in &self.shared.token_managers {
            manager.invalidate_try_again_after_time();
        }
    }

    fn is_proxy_list_available(&self) -> bool {
        self.shared.proxy_config_manager.is_proxy_list_available()
    }

    fn get_proxy_chain_list(&self) -> Vec<ProxyChain> {
        let mut chains = self.shared.proxy_config_manager.get_proxy_chain_list();
        if !self.shared.quic_allowed() {
            chains.retain(|chain| !chain.is_quic());
        }
        chains
    }

    fn request_refresh_proxy_list(&self) {
        self.shared.proxy_config_manager.request_refresh_proxy_list();
    }

    fn quic_proxies_failed(&self) {
        if self.shared.ipp_over_quic.swap(false, Ordering::Relaxed) {
            warn!("QUIC proxies failed, using HTTPS proxies until the network changes");
        }
        self.shared.proxy_config_manager.invalidate_proxy_list();
    }

    fn is_ip_protection_over_quic_enabled(&self) -> bool {
        self.shared.quic_allowed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::getter::{GetProxyListResult, TryGetAuthTokensResult};
    use crate::testing::{
        ManualClock, MockConfigGetter, init_logging, make_tokens, mountain_view, paris, settle,
    };
    use std::time::Duration;

    const HOUR: Duration = Duration::from_secs(3600);

    fn small_config() -> IpProtectionConfig {
        IpProtectionConfig {
            token_batch_size: 3,
            token_low_water_mark: 1,
            ..IpProtectionConfig::default()
        }
    }

    fn cache(
        getter: &Arc<MockConfigGetter>,
        clock: &Arc<ManualClock>,
        config: IpProtectionConfig,
    ) -> IpProtectionConfigCacheImpl {
        init_logging();
        IpProtectionConfigCacheImpl::new(
            config,
            Some(getter.clone() as Arc<dyn IpProtectionConfigGetter>),
            clock.clone(),
        )
    }

    fn push_us_tokens(getter: &MockConfigGetter, clock: &ManualClock, layer: ProxyLayer) {
        getter.push_tokens(
            layer,
            TryGetAuthTokensResult::tokens(make_tokens(
                &layer.to_string(),
                3,
                clock.now(),
                HOUR,
                &mountain_view(),
            )),
        );
    }

    fn chain(name: &str) -> ProxyChain {
        ProxyChain::new([format!("{}-a.proxy.example", name), format!("{}-b.proxy.example", name)])
    }

    #[tokio::test]
    async fn test_two_layers_fill_and_drain() {
        let getter = Arc::new(MockConfigGetter::new());
        let clock = Arc::new(ManualClock::new());
        push_us_tokens(&getter, &clock, ProxyLayer::ProxyA);
        push_us_tokens(&getter, &clock, ProxyLayer::ProxyB);
        let cache = cache(&getter, &clock, small_config());

        assert!(!cache.are_auth_tokens_available());
        settle().await;
        assert!(cache.are_auth_tokens_available());

        for layer in 0..2 {
            for _ in 0..3 {
                assert!(cache.get_auth_token(layer).is_some());
            }
            assert!(cache.get_auth_token(layer).is_none());
        }
        assert_eq!(getter.token_calls(ProxyLayer::ProxyA), 1);
        assert_eq!(getter.token_calls(ProxyLayer::ProxyB), 1);
    }

    #[tokio::test]
    async fn test_partial_token_set_not_ready() {
        let getter = Arc::new(MockConfigGetter::new());
        let clock = Arc::new(ManualClock::new());
        push_us_tokens(&getter, &clock, ProxyLayer::ProxyA);
        let cache = cache(&getter, &clock, small_config());

        cache.are_auth_tokens_available();
        settle().await;

        assert!(!cache.are_auth_tokens_available());
        assert!(cache.get_auth_token(0).is_some());
        assert!(cache.get_auth_token(1).is_none());
    }

    #[tokio::test]
    async fn test_no_getter_never_ready() {
        init_logging();
        let cache = IpProtectionConfigCacheImpl::with_defaults(None);

        assert!(!cache.are_auth_tokens_available());
        cache.request_refresh_proxy_list();
        settle().await;

        assert!(!cache.are_auth_tokens_available());
        assert!(!cache.is_proxy_list_available());
        assert!(cache.get_proxy_chain_list().is_empty());
        assert_eq!(cache.layers(), vec![ProxyLayer::ProxyA, ProxyLayer::ProxyB]);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "out of range"))]
    fn test_get_auth_token_out_of_range() {
        let cache = IpProtectionConfigCacheImpl::new(
            IpProtectionConfig::single_hop(),
            None,
            Arc::new(ManualClock::new()),
        );
        assert!(cache.get_auth_token(1).is_none());
    }

    #[tokio::test]
    async fn test_backoff_blocks_layer_until_elapsed() {
        let getter = Arc::new(MockConfigGetter::new());
        let clock = Arc::new(ManualClock::new());
        getter.push_tokens(
            ProxyLayer::ProxyA,
            TryGetAuthTokensResult::try_again_after(clock.now() + Duration::from_secs(60)),
        );
        let cache = cache(&getter, &clock, small_config());

        cache.are_auth_tokens_available();
        settle().await;

        clock.advance(Duration::from_secs(59));
        assert!(cache.get_auth_token(0).is_none());
        assert!(!cache.are_auth_tokens_available());
        settle().await;
        assert_eq!(getter.token_calls(ProxyLayer::ProxyA), 1);

        clock.advance(Duration::from_secs(2));
        push_us_tokens(&getter, &clock, ProxyLayer::ProxyA);
        cache.are_auth_tokens_available();
        settle().await;

        assert_eq!(getter.token_calls(ProxyLayer::ProxyA), 2);
        assert!(cache.get_auth_token(0).is_some());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_list() {
        let getter = Arc::new(MockConfigGetter::new());
        let clock = Arc::new(ManualClock::new());
        getter.push_proxy_list(GetProxyListResult::chains(vec![chain("a")], None));
        getter.push_proxy_list(GetProxyListResult::failed());
        let cache = cache(&getter, &clock, small_config());

        cache.request_refresh_proxy_list();
        settle().await;
        assert_eq!(cache.get_proxy_chain_list(), vec![chain("a")]);

        cache.request_refresh_proxy_list();
        settle().await;
        assert!(cache.is_proxy_list_available());
        assert_eq!(cache.get_proxy_chain_list(), vec![chain("a")]);
    }

    #[tokio::test]
    async fn test_proxy_geo_change_refreshes_all_layers() {
        let getter = Arc::new(MockConfigGetter::new());
        let clock = Arc::new(ManualClock::new());
        push_us_tokens(&getter, &clock, ProxyLayer::ProxyA);
        push_us_tokens(&getter, &clock, ProxyLayer::ProxyB);
        let cache = cache(&getter, &clock, small_config());

        cache.are_auth_tokens_available();
        settle().await;
        assert!(cache.are_auth_tokens_available());
        // The first token batch announced US, which asked for a proxy list
        assert_eq!(getter.proxy_calls(), 1);

        getter.push_proxy_list(GetProxyListResult::chains(
            vec![chain("b"), chain("c")],
            Some(paris()),
        ));
        cache.request_refresh_proxy_list();
        settle().await;

        assert_eq!(cache.get_proxy_chain_list(), vec![chain("b"), chain("c")]);
        assert_eq!(getter.token_calls(ProxyLayer::ProxyA), 2);
        assert_eq!(getter.token_calls(ProxyLayer::ProxyB), 2);
        assert_eq!(getter.proxy_calls(), 2);

        // US tokens were dropped; the refill failed so nothing is ready
        assert!(!cache.are_auth_tokens_available());
        for (_, stats) in cache.stats() {
            assert_eq!(stats.tokens_discarded, 3);
        }
    }

    #[tokio::test]
    async fn test_token_geo_change_syncs_sibling_layers() {
        let getter = Arc::new(MockConfigGetter::new());
        let clock = Arc::new(ManualClock::new());
        let config = IpProtectionConfig {
            token_batch_size: 3,
            token_low_water_mark: 3,
            ..IpProtectionConfig::default()
        };
        push_us_tokens(&getter, &clock, ProxyLayer::ProxyA);
        push_us_tokens(&getter, &clock, ProxyLayer::ProxyB);
        getter.push_proxy_list(GetProxyListResult::chains(vec![chain("a")], Some(mountain_view())));
        let cache = cache(&getter, &clock, config);

        cache.are_auth_tokens_available();
        settle().await;
        assert!(cache.are_auth_tokens_available());

        // Layer A drops below its low-water mark and gets a Paris batch
        getter.push_tokens(
            ProxyLayer::ProxyA,
            TryGetAuthTokensResult::tokens(make_tokens("fr", 3, clock.now(), HOUR, &paris())),
        );
        getter.push_proxy_list(GetProxyListResult::chains(vec![chain("fr")], Some(paris())));
        assert!(cache.get_auth_token(0).is_some());
        settle().await;

        assert_eq!(getter.token_calls(ProxyLayer::ProxyB), 2);
        assert_eq!(cache.get_proxy_chain_list(), vec![chain("fr")]);
        assert_eq!(cache.stats()[1].1.tokens_discarded, 3);
    }

    #[tokio::test]
    async fn test_quic_latch() {
        init_logging();
        let cache = IpProtectionConfigCacheImpl::with_defaults(None);
        assert!(cache.is_ip_protection_over_quic_enabled());

        cache.quic_proxies_failed();
        assert!(!cache.is_ip_protection_over_quic_enabled());
        cache.quic_proxies_failed();
        assert!(!cache.is_ip_protection_over_quic_enabled());

        cache.on_network_changed(ConnectionType::Wifi);
        assert!(cache.is_ip_protection_over_quic_enabled());
    }

    #[tokio::test]
    async fn test_quic_disabled_by_config() {
        let config = IpProtectionConfig {
            enable_quic_proxies: false,
            ..IpProtectionConfig::default()
        };
        let cache = IpProtectionConfigCacheImpl::new(config, None, Arc::new(ManualClock::new()));

        assert!(!cache.is_ip_protection_over_quic_enabled());
        cache.on_network_changed(ConnectionType::Ethernet);
        assert!(!cache.is_ip_protection_over_quic_enabled());
    }

    #[tokio::test]
    async fn test_quic_chains_hidden_after_failure() {
        let getter = Arc::new(MockConfigGetter::new());
        let clock = Arc::new(ManualClock::new());
        let quic = ProxyChain::quic(["q-a.proxy.example", "q-b.proxy.example"]);
        getter.push_proxy_list(GetProxyListResult::chains(vec![quic.clone(), chain("h")], None));
        let cache = cache(&getter, &clock, small_config());

        cache.request_refresh_proxy_list();
        settle().await;
        assert_eq!(cache.get_proxy_chain_list(), vec![quic.clone(), chain("h")]);

        cache.quic_proxies_failed();
        assert_eq!(cache.get_proxy_chain_list(), vec![chain("h")]);

        cache.on_network_changed(ConnectionType::Cellular4G);
        assert_eq!(cache.get_proxy_chain_list(), vec![quic, chain("h")]);
    }

    #[tokio::test]
    async fn test_network_change_clears_backoff_and_refills() {
        let getter = Arc::new(MockConfigGetter::new());
        let clock = Arc::new(ManualClock::new());
        getter.push_tokens(
            ProxyLayer::ProxyA,
            TryGetAuthTokensResult::try_again_after(clock.now() + HOUR),
        );
        push_us_tokens(&getter, &clock, ProxyLayer::ProxyB);
        let cache = cache(&getter, &clock, small_config());

        cache.are_auth_tokens_available();
        settle().await;
        assert!(!cache.are_auth_tokens_available());
        let proxy_calls = getter.proxy_calls();

        push_us_tokens(&getter, &clock, ProxyLayer::ProxyA);
        cache.on_network_changed(ConnectionType::Wifi);
        settle().await;

        assert_eq!(getter.token_calls(ProxyLayer::ProxyA), 2);
        // Layer B still had tokens, so it was left alone
        assert_eq!(getter.token_calls(ProxyLayer::ProxyB), 1);
        assert_eq!(getter.proxy_calls(), proxy_calls + 1);
        assert!(cache.are_auth_tokens_available());
    }

    #[tokio::test]
    async fn test_going_offline_does_not_fetch() {
        let getter = Arc::new(MockConfigGetter::new());
        let clock = Arc::new(ManualClock::new());
        getter.push_proxy_list(GetProxyListResult::chains(vec![chain("a")], None));
        let cache = cache(&getter, &clock, small_config());

        cache.request_refresh_proxy_list();
        settle().await;

        cache.quic_proxies_failed();
        cache.on_network_changed(ConnectionType::None);
        settle().await;

        assert!(cache.is_ip_protection_over_quic_enabled());
        assert_eq!(getter.proxy_calls(), 1);
        assert_eq!(getter.token_calls(ProxyLayer::ProxyA), 0);
        assert_eq!(cache.get_proxy_chain_list(), vec![chain("a")]);
    }

    #[tokio::test]
    async fn test_watch_network_changes() {
        init_logging();
        let cache = IpProtectionConfigCacheImpl::with_defaults(None);
        let (tx, rx) = watch::channel(ConnectionType::Ethernet);
        let listener = cache.watch_network_changes(rx).expect("runtime");

        cache.quic_proxies_failed();
        tx.send(ConnectionType::Wifi).unwrap();
        settle().await;
        assert!(cache.is_ip_protection_over_quic_enabled());

        drop(cache);
        tx.send(ConnectionType::Ethernet).unwrap();
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_completing_after_teardown() {
        let getter = Arc::new(MockConfigGetter::new());
        let clock = Arc::new(ManualClock::new());
        push_us_tokens(&getter, &clock, ProxyLayer::ProxyA);
        push_us_tokens(&getter, &clock, ProxyLayer::ProxyB);
        getter.hold();
        let cache = cache(&getter, &clock, small_config());

        cache.are_auth_tokens_available();
        cache.request_refresh_proxy_list();
        settle().await;
        drop(cache);

        getter.release();
        settle().await;
        assert_eq!(getter.proxy_calls(), 1);
    }

    #[tokio::test]
    async fn test_with_managers_without_layers() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let proxy = Arc::new(IpProtectionProxyConfigManagerImpl::new(None, clock, None));
        let cache = IpProtectionConfigCacheImpl::with_managers(Vec::new(), proxy, true);

        assert!(!cache.are_auth_tokens_available());
        assert!(cache.get_proxy_chain_list().is_empty());
    }
}

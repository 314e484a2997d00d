//! Proxy list manager
//!
//! Caches the best-known list of proxy chains. A list stays usable until a
//! newer one replaces it; failed refreshes keep serving the previous list.

use crate::clock::Clock;
use crate::geo::GeoObserver;
use crate::getter::{GetProxyListResult, IpProtectionConfigGetter};
use crate::proxy_chain::ProxyChain;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::SystemTime;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owner of the cached proxy chain list
pub trait IpProtectionProxyConfigManager: Send + Sync {
    /// Check if a list has been fetched at least once
    fn is_proxy_list_available(&self) -> bool;

    /// Current list, empty until the first successful fetch
    fn get_proxy_chain_list(&self) -> Vec<ProxyChain>;

    /// Fetch a new list unless a fetch is already in flight
    fn request_refresh_proxy_list(&self);

    /// Mark the list stale without dropping it
    fn invalidate_proxy_list(&self);

    /// Check if the list needs a refresh
    fn is_proxy_list_stale(&self) -> bool;

    /// Geo the current list was computed for
    fn current_geo(&self) -> Option<String>;

    /// Check if a fetch is outstanding
    fn is_fetching(&self) -> bool;
}

struct PendingFetch {
    started_at: SystemTime,
    task: JoinHandle<()>,
}

struct ProxyListState {
    /// Swapped whole on every successful fetch
    chains: Arc<Vec<ProxyChain>>,
    have_fetched: bool,
    stale: bool,
    fetched_at: Option<SystemTime>,
    current_geo: Option<String>,
    pending: Option<PendingFetch>,
}

struct ProxyConfigInner {
    getter: Option<Arc<dyn IpProtectionConfigGetter>>,
    clock: Arc<dyn Clock>,
    observer: Option<Weak<dyn GeoObserver>>,
    state: Mutex<ProxyListState>,
}

impl ProxyConfigInner {
    fn lock(&self) -> MutexGuard<'_, ProxyListState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh(self: &Arc<Self>, state: &mut ProxyListState) {
        let Some(getter) = self.getter.clone() else {
            return;
        };
        state.stale = true;
        if state.pending.is_some() {
            debug!("Proxy list fetch already in flight");
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!("No async runtime available, cannot refresh proxy list");
            return;
        };

        debug!("Refreshing proxy list");
        let weak = Arc::downgrade(self);
        let task = runtime.spawn(async move {
            let result = getter.get_proxy_list().await;
            match weak.upgrade() {
                Some(inner) => inner.on_got_proxy_list(result),
                None => debug!("Proxy config manager dropped before fetch completed"),
            }
        });

        state.pending = Some(PendingFetch {
            started_at: self.clock.now(),
            task,
        });
    }

    fn on_got_proxy_list(&self, result: GetProxyListResult) {
        let now = self.clock.now();

        let new_geo = {
            let mut state = self.lock();
            let started_at = state.pending.take().map(|pending| pending.started_at);

            let Some(chains) = result.proxy_chains else {
                warn!(
                    "Proxy list fetch failed, keeping {} cached chains",
                    state.chains.len()
                );
                return;
            };

            info!(
                "Received proxy list with {} chains (took {:?})",
                chains.len(),
                started_at
                    .and_then(|at| now.duration_since(at).ok())
                    .unwrap_or_default()
            );
            state.chains = Arc::new(chains);
            state.have_fetched = true;
            state.stale = false;
            state.fetched_at = Some(now);

            let geo_id = result
                .geo_hint
                .map(|hint| hint.geo_id())
                .filter(|id| !id.is_empty());
            match geo_id {
                Some(geo_id) if state.current_geo.as_deref() != Some(geo_id.as_str()) => {
                    info!(
                        "Proxy list geo changed: {} -> {}",
                        state.current_geo.as_deref().unwrap_or("none"),
                        geo_id
                    );
                    state.current_geo = Some(geo_id.clone());
                    Some(geo_id)
                }
                _ => None,
            }
        };

        if let Some(geo_id) = new_geo {
            if let Some(observer) = self.observer.as_ref().and_then(Weak::upgrade) {
                observer.geo_observed(&geo_id);
            }
        }
    }
}

impl Drop for ProxyConfigInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = state.pending.take() {
            pending.task.abort();
        }
    }
}

/// Default [`IpProtectionProxyConfigManager`] backed by an [`IpProtectionConfigGetter`]
pub struct IpProtectionProxyConfigManagerImpl {
    inner: Arc<ProxyConfigInner>,
}

impl IpProtectionProxyConfigManagerImpl {
    /// Create a manager; nothing is fetched until a refresh is requested
    pub fn new(
        getter: Option<Arc<dyn IpProtectionConfigGetter>>,
        clock: Arc<dyn Clock>,
        observer: Option<Weak<dyn GeoObserver>>,
    ) -> Self {
        let inner = ProxyConfigInner {
            getter,
            clock,
            observer,
            state: Mutex::new(ProxyListState {
                chains: Arc::new(Vec::new()),
                have_fetched: false,
                stale: true,
                fetched_at: None,
                current_geo: None,
                pending: None,
            }),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// When the current list was fetched
    pub fn last_fetched_at(&self) -> Option<SystemTime> {
        self.inner.lock().fetched_at
    }
}

impl IpProtectionProxyConfigManager for IpProtectionProxyConfigManagerImpl {
    fn is_proxy_list_available(&self) -> bool {
        self.inner.lock().have_fetched
    }

    fn get_proxy_chain_list(&self) -> Vec<ProxyChain> {
        let chains = Arc::clone(&self.inner.lock().chains);
        chains.as_ref().clone()
    }

    fn request_refresh_proxy_list(&self) {
        let mut state = self.inner.lock();
        self.inner.refresh(&mut state);
    }

    fn invalidate_proxy_list(&self) {
        let mut state = self.inner.lock();
        if !state.stale {
            debug!("Proxy list marked stale");
        }
        state.stale = true;
    }

    fn is_proxy_list_stale(&self) -> bool {
        self.inner.lock().stale
    }

    fn current_geo(&self) -> Option<String> {
        self.inner.lock().current_geo.clone()
    }

    fn is_fetching(&self) -> bool {
        self.inner.lock().pending.is_some()
    }
}

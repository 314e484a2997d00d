//! Per-layer token manager
//!
//! Keeps a ready supply of unexpired blind-signed tokens for one proxy layer
//! and serves them synchronously from the request path.
//!
//! # Lifecycle
//!
//! ```text
//!            request_refill / low-water mark
//!   EMPTY ─────────────────────────────────▶ FETCHING
//!     ▲                                      │      │
//!     │ consumption                  tokens  │      │ failure / backpressure
//!     │                                      ▼      ▼
//!     └─────────────────────────────── POPULATED  BACKOFF ──▶ (try-again-after elapses)
//! ```
//!
//! At most one fetch is outstanding per layer. Expired tokens are purged
//! lazily whenever the queue is consulted.

use crate::clock::Clock;
use crate::config::IpProtectionConfig;
use crate::geo::GeoObserver;
use crate::getter::{IpProtectionConfigGetter, TryGetAuthTokensResult};
use crate::token::{BlindSignedAuthToken, ProxyLayer};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Token manager for a single proxy layer
pub trait IpProtectionTokenManager: Send + Sync {
    /// Layer this manager serves
    fn proxy_layer(&self) -> ProxyLayer;

    /// Check if a token can be handed out right now (does not consume)
    fn is_auth_token_available(&self) -> bool;

    /// Take the oldest unexpired token
    fn get_auth_token(&self) -> Option<BlindSignedAuthToken>;

    /// Fetch more tokens if the queue is low and no fetch is in flight
    fn request_refill(&self);

    /// Clear any try-again-after cooldown
    fn invalidate_try_again_after_time(&self);

    /// Cooldown currently in force, if any
    fn try_again_after(&self) -> Option<SystemTime>;

    /// Geo of the most recent token batch
    fn current_geo(&self) -> Option<String>;

    /// Switch to a new geo, dropping tokens bound to any other geo
    fn set_current_geo(&self, geo_id: &str);

    /// Number of queued tokens, expired ones included until purged
    fn token_count(&self) -> usize;

    /// Check if a fetch is outstanding
    fn is_fetching(&self) -> bool;

    /// Counters since construction
    fn stats(&self) -> TokenManagerStats;
}

/// Token manager counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenManagerStats {
    /// Tokens received from the issuer
    pub tokens_fetched: u64,
    /// Tokens handed to callers
    pub tokens_served: u64,
    /// Tokens purged because they expired in the queue
    pub tokens_expired: u64,
    /// Tokens dropped because their geo went stale
    pub tokens_discarded: u64,
    /// Fetches started
    pub fetches: u64,
    /// Fetches that returned no tokens
    pub fetch_failures: u64,
}

impl TokenManagerStats {
    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "fetched: {}, served: {}, expired: {}, discarded: {}, fetches: {} ({} failed)",
            self.tokens_fetched,
            self.tokens_served,
            self.tokens_expired,
            self.tokens_discarded,
            self.fetches,
            self.fetch_failures
        )
    }
}

/// Fetch currently in flight
struct PendingFetch {
    started_at: SystemTime,
    task: JoinHandle<()>,
}

struct TokenState {
    /// Sorted by expiration, soonest first
    tokens: VecDeque<BlindSignedAuthToken>,
    try_again_after: Option<SystemTime>,
    current_geo: Option<String>,
    pending: Option<PendingFetch>,
    /// Re-checks the refill once a cooldown elapses
    refill_timer: Option<JoinHandle<()>>,
    consecutive_failures: u32,
    stats: TokenManagerStats,
}

impl TokenState {
    fn in_backoff(&self, now: SystemTime) -> bool {
        self.try_again_after.is_some_and(|at| now < at)
    }

    fn remove_expired(&mut self, now: SystemTime, margin: Duration) {
        let before = self.tokens.len();
        while self
            .tokens
            .front()
            .is_some_and(|token| token.is_expired(now, margin))
        {
            self.tokens.pop_front();
        }

        let removed = before - self.tokens.len();
        if removed > 0 {
            debug!("Purged {} expired tokens", removed);
            self.stats.tokens_expired += removed as u64;
        }
    }
}

struct TokenManagerInner {
    layer: ProxyLayer,
    getter: Option<Arc<dyn IpProtectionConfigGetter>>,
    clock: Arc<dyn Clock>,
    batch_size: u32,
    low_water_mark: usize,
    freshness_margin: Duration,
    failure_backoff: Duration,
    max_failure_backoff: Duration,
    observer: Option<Weak<dyn GeoObserver>>,
    state: Mutex<TokenState>,
}

impl TokenManagerInner {
    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a fetch if the queue is low. Spawning never runs the task
    /// inline, so calling this with the state lock held is safe.
    fn maybe_refill(self: &Arc<Self>, state: &mut TokenState) {
        let Some(getter) = self.getter.clone() else {
            return;
        };
        if state.pending.is_some() {
            return;
        }

        let now = self.clock.now();
        if state.in_backoff(now) {
            return;
        }
        state.try_again_after = None;

        state.remove_expired(now, self.freshness_margin);
        if !state.tokens.is_empty() && state.tokens.len() >= self.low_water_mark {
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!("No async runtime available, cannot fetch tokens for {}", self.layer);
            return;
        };

        debug!(
            "Fetching {} tokens for {} ({} queued)",
            self.batch_size,
            self.layer,
            state.tokens.len()
        );
        state.stats.fetches += 1;

        let weak = Arc::downgrade(self);
        let layer = self.layer;
        let batch_size = self.batch_size;
        let task = runtime.spawn(async move {
            let result = getter.try_get_auth_tokens(batch_size, layer).await;
            match weak.upgrade() {
                Some(inner) => inner.on_got_auth_tokens(result),
                None => debug!("Token manager for {} dropped before fetch completed", layer),
            }
        });

        state.pending = Some(PendingFetch {
            started_at: now,
            task,
        });
    }

    fn on_got_auth_tokens(self: &Arc<Self>, result: TryGetAuthTokensResult) {
        let now = self.clock.now();

        let new_geo = {
            let mut state = self.lock();
            if let Some(pending) = state.pending.take() {
                debug!(
                    "Token fetch for {} finished after {:?}",
                    self.layer,
                    now.duration_since(pending.started_at).unwrap_or_default()
                );
            }

            let fresh = result
                .tokens
                .map(|tokens| self.drop_stale_tokens(&mut state, tokens, now));

            // A failed fetch is retried by the refill timer, never inline.
            match fresh {
                Some(tokens) if !tokens.is_empty() => {
                    let new_geo = self.apply_batch(&mut state, tokens);
                    self.maybe_refill(&mut state);
                    new_geo
                }
                _ => {
                    self.apply_failure(&mut state, result.try_again_after, now);
                    None
                }
            }
        };

        // Notify without holding the lock; the observer calls back into
        // every manager, this one included.
        if let Some(geo_id) = new_geo {
            if let Some(observer) = self.observer.as_ref().and_then(Weak::upgrade) {
                observer.geo_observed(&geo_id);
            }
        }
    }

    /// Filter out tokens that are already inside the freshness margin.
    fn drop_stale_tokens(
        &self,
        state: &mut TokenState,
        mut tokens: Vec<BlindSignedAuthToken>,
        now: SystemTime,
    ) -> Vec<BlindSignedAuthToken> {
        let received = tokens.len();
        tokens.retain(|token| !token.is_expired(now, self.freshness_margin));

        let stale = received - tokens.len();
        if stale > 0 {
            warn!(
                "Dropped {} of {} tokens for {} that arrived already expired",
                stale, received, self.layer
            );
            state.stats.tokens_fetched += stale as u64;
            state.stats.tokens_expired += stale as u64;
        }
        tokens
    }

    /// Merge a batch into the queue, returning the new geo if it changed.
    fn apply_batch(
        &self,
        state: &mut TokenState,
        tokens: Vec<BlindSignedAuthToken>,
    ) -> Option<String> {
        let count = tokens.len();
        let batch_geo = tokens[0].geo_hint.geo_id();

        state.consecutive_failures = 0;
        state.try_again_after = None;
        state.stats.tokens_fetched += count as u64;

        let geo_changed =
            !batch_geo.is_empty() && state.current_geo.as_deref() != Some(batch_geo.as_str());
        if geo_changed {
            let before = state.tokens.len();
            state.tokens.retain(|token| token.geo_hint.geo_id() == batch_geo);
            state.stats.tokens_discarded += (before - state.tokens.len()) as u64;

            info!(
                "Geo for {} changed: {} -> {}",
                self.layer,
                state.current_geo.as_deref().unwrap_or("none"),
                batch_geo
            );
            state.current_geo = Some(batch_geo.clone());
        }

        state.tokens.extend(tokens);
        state
            .tokens
            .make_contiguous()
            .sort_by_key(|token| token.expiration);

        info!(
            "Received {} tokens for {} ({} queued)",
            count,
            self.layer,
            state.tokens.len()
        );

        geo_changed.then_some(batch_geo)
    }

    fn apply_failure(
        self: &Arc<Self>,
        state: &mut TokenState,
        try_again_after: Option<SystemTime>,
        now: SystemTime,
    ) {
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.stats.fetch_failures += 1;

        // A hint that is already due is no cooldown at all
        let failures = state.consecutive_failures;
        let until = match try_again_after {
            Some(at) if at > now => at,
            _ => now + self.local_backoff(failures),
        };
        state.try_again_after = Some(until);

        let delay = until.duration_since(now).unwrap_or_default();
        warn!(
            "Token fetch for {} failed (attempt {}), retrying in {:?}",
            self.layer, state.consecutive_failures, delay
        );

        self.schedule_refill_check(state, delay);
    }

    /// Doubling cooldown for failures the issuer gave no hint for
    fn local_backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.failure_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_failure_backoff)
    }

    fn schedule_refill_check(self: &Arc<Self>, state: &mut TokenState, delay: Duration) {
        let Ok(runtime) = Handle::try_current() else {
            return;
        };

        let weak = Arc::downgrade(self);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.lock();
                state.refill_timer = None;
                inner.maybe_refill(&mut state);
            }
        });

        if let Some(previous) = state.refill_timer.replace(timer) {
            previous.abort();
        }
    }
}

impl Drop for TokenManagerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = state.pending.take() {
            pending.task.abort();
        }
        if let Some(timer) = state.refill_timer.take() {
            timer.abort();
        }
    }
}

/// Default [`IpProtectionTokenManager`] backed by an [`IpProtectionConfigGetter`]
///
/// Without a getter the manager never has tokens.
pub struct IpProtectionTokenManagerImpl {
    inner: Arc<TokenManagerInner>,
}

impl IpProtectionTokenManagerImpl {
    /// Create a manager for `layer`
    ///
    /// `observer` is told about geo changes seen in fetched batches.
    pub fn new(
        layer: ProxyLayer,
        getter: Option<Arc<dyn IpProtectionConfigGetter>>,
        clock: Arc<dyn Clock>,
        config: &IpProtectionConfig,
        observer: Option<Weak<dyn GeoObserver>>,
    ) -> Self {
        if getter.is_none() {
            info!("No config getter for {}, tokens will never be available", layer);
        }

        let inner = TokenManagerInner {
            layer,
            getter,
            clock,
            batch_size: config.token_batch_size,
            low_water_mark: config.token_low_water_mark,
            freshness_margin: config.token_freshness_margin(),
            failure_backoff: config.failure_backoff(),
            max_failure_backoff: config.max_failure_backoff(),
            observer,
            state: Mutex::new(TokenState {
                tokens: VecDeque::new(),
                try_again_after: None,
                current_geo: None,
                pending: None,
                refill_timer: None,
                consecutive_failures: 0,
                stats: TokenManagerStats::default(),
            }),
        };

        Self {
            inner: Arc::new(inner),
        }
    }
}

impl IpProtectionTokenManager for IpProtectionTokenManagerImpl {
    fn proxy_layer(&self) -> ProxyLayer {
        self.inner.layer
    }

    fn is_auth_token_available(&self) -> bool {
        let now = self.inner.clock.now();
        let mut state = self.inner.lock();
        if state.in_backoff(now) {
            return false;
        }

        state.remove_expired(now, self.inner.freshness_margin);
        self.inner.maybe_refill(&mut state);
        !state.tokens.is_empty()
    }

    fn get_auth_token(&self) -> Option<BlindSignedAuthToken> {
        let now = self.inner.clock.now();
        let mut state = self.inner.lock();
        if state.in_backoff(now) {
            return None;
        }

        state.remove_expired(now, self.inner.freshness_margin);
        let token = state.tokens.pop_front();
        if token.is_some() {
            state.stats.tokens_served += 1;
        } else {
            debug!("No tokens available for {}", self.inner.layer);
        }

        self.inner.maybe_refill(&mut state);
        token
    }

    fn request_refill(&self) {
        let mut state = self.inner.lock();
        self.inner.maybe_refill(&mut state);
    }

    fn invalidate_try_again_after_time(&self) {
        let mut state = self.inner.lock();
        if state.try_again_after.take().is_some() {
            debug!("Cleared try-again-after for {}", self.inner.layer);
        }
        state.consecutive_failures = 0;
        if let Some(timer) = state.refill_timer.take() {
            timer.abort();
        }
    }

    fn try_again_after(&self) -> Option<SystemTime> {
        let now = self.inner.clock.now();
        let state = self.inner.lock();
        state.try_again_after.filter(|at| now < *at)
    }

    fn current_geo(&self) -> Option<String> {
        self.inner.lock().current_geo.clone()
    }

    fn set_current_geo(&self, geo_id: &str) {
        if geo_id.is_empty() {
            return;
        }

        let mut state = self.inner.lock();
        if state.current_geo.as_deref() == Some(geo_id) {
            return;
        }

        let before = state.tokens.len();
        state.tokens.retain(|token| token.geo_hint.geo_id() == geo_id);
        let discarded = before - state.tokens.len();
        state.stats.tokens_discarded += discarded as u64;

        info!(
            "Switching {} to geo {} ({} tokens discarded)",
            self.inner.layer, geo_id, discarded
        );
        state.current_geo = Some(geo_id.to_string());
        self.inner.maybe_refill(&mut state);
    }

    fn token_count(&self) -> usize {
        self.inner.lock().tokens.len()
    }

    fn is_fetching(&self) -> bool {
        self.inner.lock().pending.is_some()
    }

    fn stats(&self) -> TokenManagerStats {
        self.inner.lock().stats
    }
}

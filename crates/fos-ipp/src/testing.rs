//! Test doubles shared by the unit tests.

use crate::clock::Clock;
use crate::geo::GeoHint;
use crate::getter::{GetProxyListResult, IpProtectionConfigGetter, TryGetAuthTokensResult};
use crate::token::{BlindSignedAuthToken, ProxyLayer};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;

/// Install a log subscriber once per test binary (`RUST_LOG` controls output).
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}

/// Build `count` tokens expiring `ttl` after `now`.
pub fn make_tokens(
    prefix: &str,
    count: usize,
    now: SystemTime,
    ttl: Duration,
    geo: &GeoHint,
) -> Vec<BlindSignedAuthToken> {
    (0..count)
        .map(|i| BlindSignedAuthToken::new(format!("{}-{}", prefix, i), now + ttl, geo.clone()))
        .collect()
}

pub fn mountain_view() -> GeoHint {
    GeoHint::new("US", "US-CA", "Mountain View")
}

pub fn paris() -> GeoHint {
    GeoHint::new("FR", "FR-IDF", "Paris")
}

/// Getter replaying scripted responses.
///
/// Unscripted requests fail without a cooldown hint. While held, requests
/// park until [`MockConfigGetter::release`] is called.
pub struct MockConfigGetter {
    token_responses: Mutex<HashMap<ProxyLayer, VecDeque<TryGetAuthTokensResult>>>,
    proxy_responses: Mutex<VecDeque<GetProxyListResult>>,
    token_calls: Mutex<HashMap<ProxyLayer, usize>>,
    proxy_calls: AtomicUsize,
    held: watch::Sender<bool>,
}

impl MockConfigGetter {
    pub fn new() -> Self {
        let (held, _) = watch::channel(false);
        Self {
            token_responses: Mutex::new(HashMap::new()),
            proxy_responses: Mutex::new(VecDeque::new()),
            token_calls: Mutex::new(HashMap::new()),
            proxy_calls: AtomicUsize::new(0),
            held,
        }
    }

    pub fn push_tokens(&self, layer: ProxyLayer, result: TryGetAuthTokensResult) {
        self.token_responses
            .lock()
            .unwrap()
            .entry(layer)
            .or_default()
            .push_back(result);
    }

    pub fn push_proxy_list(&self, result: GetProxyListResult) {
        self.proxy_responses.lock().unwrap().push_back(result);
    }

    pub fn token_calls(&self, layer: ProxyLayer) -> usize {
        self.token_calls.lock().unwrap().get(&layer).copied().unwrap_or(0)
    }

    pub fn proxy_calls(&self) -> usize {
        self.proxy_calls.load(Ordering::SeqCst)
    }

    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    async fn wait_released(&self) {
        let mut rx = self.held.subscribe();
        let _ = rx.wait_for(|held| !*held).await;
    }
}

#[async_trait]
impl IpProtectionConfigGetter for MockConfigGetter {
    async fn try_get_auth_tokens(
        &self,
        _batch_size: u32,
        proxy_layer: ProxyLayer,
    ) -> TryGetAuthTokensResult {
        *self.token_calls.lock().unwrap().entry(proxy_layer).or_default() += 1;
        self.wait_released().await;

        self.token_responses
            .lock()
            .unwrap()
            .get_mut(&proxy_layer)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default()
    }

    async fn get_proxy_list(&self) -> GetProxyListResult {
        self.proxy_calls.fetch_add(1, Ordering::SeqCst);
        self.wait_released().await;

        self.proxy_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default()
    }
}

/// Let spawned fetch tasks run to completion on the current-thread runtime.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

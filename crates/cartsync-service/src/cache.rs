//! The shared cart cache.
//!
//! All widgets of a page read the cart through one [`CartCache`]. Reads are served from memory
//! while the last snapshot is younger than the configured TTL. Otherwise exactly one request is
//! sent to the server, and every reader arriving in the meantime waits for that same request.
//!
//! Every completed request, successful or not, is fanned out to all subscribers before the waiting
//! readers are released.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};
use tokio::time::Instant;

use crate::config::CartCacheConfig;
use crate::remote::{RemoteCartService, RemoteError};
use crate::scheduler::ScheduledTask;
use crate::session::AuthSession;
use crate::subscribers::{SubscriberRegistry, Subscription};
use crate::types::{Cart, CartSnapshot};
use crate::utils::CallOnDrop;

/// Resolves once the in-flight fetch has stored its result and notified all subscribers.
///
/// Resolves to `Err(Canceled)` if the fetch task died without producing a result.
type FetchChannel = Shared<oneshot::Receiver<Cart>>;

enum Phase {
    Empty,
    /// Fresh or stale, depending on the age of `fetched_at`.
    Cached {
        snapshot: Arc<CartSnapshot>,
        fetched_at: Instant,
    },
    Fetching {
        /// Sequence number of this fetch, see [`State::fetches_started`].
        generation: u64,
        previous: Option<Arc<CartSnapshot>>,
        channel: FetchChannel,
    },
}

struct State {
    phase: Phase,
    /// The number of fetches ever started, also the generation of the latest one.
    fetches_started: u64,
}

/// A point-in-time view of the cache, for observation and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    /// Nothing cached, the next read goes to the server.
    Empty,
    /// A snapshot younger than the TTL; reads are served from memory.
    Fresh {
        snapshot: Arc<CartSnapshot>,
        fetched_at: Instant,
    },
    /// A snapshot older than the TTL; the next read goes to the server.
    Stale {
        snapshot: Arc<CartSnapshot>,
        fetched_at: Instant,
    },
    /// A request is in flight, reads wait for it.
    Fetching {
        previous: Option<Arc<CartSnapshot>>,
    },
}

impl CacheStatus {
    pub fn name(&self) -> &'static str {
        match self {
            CacheStatus::Empty => "empty",
            CacheStatus::Fresh { .. } => "fresh",
            CacheStatus::Stale { .. } => "stale",
            CacheStatus::Fetching { .. } => "fetching",
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, CacheStatus::Fresh { .. })
    }

    pub fn is_fetching(&self) -> bool {
        matches!(self, CacheStatus::Fetching { .. })
    }
}

struct Inner {
    config: CartCacheConfig,
    remote: Arc<dyn RemoteCartService>,
    session: Arc<dyn AuthSession>,
    subscribers: SubscriberRegistry,
    invalidation: ScheduledTask,
    state: Mutex<State>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reads the cart from the server, absorbing every failure into [`Cart::Empty`].
    async fn fetch(&self) -> Cart {
        let Some(token) = self.session.token() else {
            tracing::debug!("No active session, not fetching cart");
            return Cart::Empty;
        };

        metric!(counter("cart.fetch") += 1);
        let start = std::time::Instant::now();
        let result = self.remote.fetch_cart(Some(token)).await;
        metric!(timer("cart.fetch.duration") = start.elapsed());

        match result {
            Ok(Some(snapshot)) => {
                tracing::debug!(lines = snapshot.lines().len(), "Fetched cart");
                Cart::from(snapshot)
            }
            Ok(None) => {
                tracing::debug!("Server reported no cart");
                Cart::Empty
            }
            Err(error) => {
                metric!(counter("cart.fetch.failed") += 1, "reason" => error.kind());
                match error {
                    RemoteError::Unauthorized => {
                        tracing::warn!("Cart fetch was rejected, session is not authorized")
                    }
                    error => tracing::error!(
                        error = &error as &dyn std::error::Error,
                        "Failed to fetch cart"
                    ),
                }
                Cart::Empty
            }
        }
    }

    /// Like [`fetch`](Self::fetch), but a panicking collaborator also resolves to [`Cart::Empty`].
    async fn fetch_isolated(&self) -> Cart {
        match AssertUnwindSafe(self.fetch()).catch_unwind().await {
            Ok(cart) => cart,
            Err(_) => {
                metric!(counter("cart.fetch.failed") += 1, "reason" => "panic");
                tracing::error!("Cart fetch panicked");
                Cart::Empty
            }
        }
    }

    /// Stores the outcome of the fetch `generation`.
    fn complete(&self, generation: u64, cart: &Cart) {
        let mut state = self.lock_state();
        let is_current =
            matches!(state.phase, Phase::Fetching { generation: g, .. } if g == generation);
        debug_assert!(is_current, "a completed fetch must be the in-flight one");
        if !is_current {
            return;
        }

        state.phase = match cart {
            Cart::Snapshot(snapshot) => Phase::Cached {
                snapshot: Arc::clone(snapshot),
                fetched_at: Instant::now(),
            },
            Cart::Empty => Phase::Empty,
        };
    }

    /// Leaves the `Fetching` state of a fetch task that was dropped before completing, for example
    /// when the runtime shuts down.
    fn abandon(&self, generation: u64) {
        let mut state = self.lock_state();
        if matches!(state.phase, Phase::Fetching { generation: g, .. } if g == generation) {
            tracing::error!("Cart fetch was aborted before completing");
            state.phase = Phase::Empty;
        }
    }
}

/// The cache of the shared cart.
///
/// This is cheap to clone, all clones share the same cached snapshot, in-flight request and
/// subscribers.
#[derive(Clone)]
pub struct CartCache {
    inner: Arc<Inner>,
}

impl fmt::Debug for CartCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CartCache")
            .field("config", &self.inner.config)
            .field("status", &self.status().name())
            .field("subscribers", &self.inner.subscribers)
            .finish()
    }
}

impl CartCache {
    pub fn new(
        config: CartCacheConfig,
        remote: impl RemoteCartService,
        session: impl AuthSession,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                remote: Arc::new(remote),
                session: Arc::new(session),
                subscribers: SubscriberRegistry::new(),
                invalidation: ScheduledTask::new(),
                state: Mutex::new(State {
                    phase: Phase::Empty,
                    fetches_started: 0,
                }),
            }),
        }
    }

    pub fn config(&self) -> &CartCacheConfig {
        &self.inner.config
    }

    pub(crate) fn remote(&self) -> &dyn RemoteCartService {
        &*self.inner.remote
    }

    pub(crate) fn session(&self) -> &dyn AuthSession {
        &*self.inner.session
    }

    /// Returns the cart.
    ///
    /// Served from memory while the cached snapshot is fresh. Joins the in-flight request if
    /// there is one, and starts a new request otherwise.
    ///
    /// This never fails: failed reads resolve to [`Cart::Empty`].
    pub async fn get(&self) -> Cart {
        metric!(counter("cart.access") += 1);

        let (channel, fetch) = {
            let mut state = self.inner.lock_state();
            let previous = match &state.phase {
                Phase::Cached {
                    snapshot,
                    fetched_at,
                } if fetched_at.elapsed() < self.inner.config.ttl => {
                    metric!(counter("cart.memory.hit") += 1);
                    tracing::trace!("Serving cart from memory");
                    return Cart::Snapshot(Arc::clone(snapshot));
                }
                Phase::Cached { snapshot, .. } => Ok(Some(Arc::clone(snapshot))),
                Phase::Empty => Ok(None),
                Phase::Fetching { channel, .. } => Err(channel.clone()),
            };

            match previous {
                Ok(previous) => {
                    let (channel, fetch) = self.begin_fetch(&mut state, previous);
                    (channel, Some(fetch))
                }
                Err(inflight) => {
                    metric!(counter("cart.fetch.joined") += 1);
                    tracing::debug!("Joining in-flight cart fetch");
                    (inflight, None)
                }
            }
        };

        if let Some(fetch) = fetch {
            tokio::spawn(fetch);
        }
        channel.await.unwrap_or_default()
    }

    /// Drops the cached snapshot and reads the cart from the server.
    ///
    /// A request already in flight when this is called may predate the change that prompted the
    /// refresh. It is awaited first and then followed by one new request. Requests started after
    /// this call are joined instead.
    pub async fn refresh(&self) -> Cart {
        let requested_after = self.inner.lock_state().fetches_started;

        loop {
            let (channel, fetch) = {
                let mut state = self.inner.lock_state();
                let inflight = match &state.phase {
                    Phase::Fetching {
                        generation,
                        channel,
                        ..
                    } => Some((*generation, channel.clone())),
                    Phase::Empty | Phase::Cached { .. } => None,
                };

                match inflight {
                    Some((generation, channel)) if generation > requested_after => {
                        (Ok(channel), None)
                    }
                    Some((_, outdated)) => (Err(outdated), None),
                    None => {
                        let (channel, fetch) = self.begin_fetch(&mut state, None);
                        (Ok(channel), Some(fetch))
                    }
                }
            };

            if let Some(fetch) = fetch {
                tokio::spawn(fetch);
            }

            match channel {
                Ok(channel) => return channel.await.unwrap_or_default(),
                Err(outdated) => {
                    tracing::debug!("Waiting for outdated cart fetch before refreshing");
                    outdated.await.ok();
                }
            }
        }
    }

    /// Schedules a [`refresh`](Self::refresh) after the configured debounce delay.
    ///
    /// Calls within the delay collapse into a single refresh. This returns immediately and must be
    /// called within a Tokio runtime.
    pub fn invalidate(&self) {
        metric!(counter("cart.invalidate") += 1);

        let cache = self.clone();
        let replaced = self.inner.invalidation.schedule(
            self.inner.config.invalidate_debounce,
            async move {
                cache.refresh().await;
            },
        );
        if replaced {
            tracing::trace!("Collapsed pending cart invalidation");
        }
    }

    /// Registers a callback that receives the result of every fetch.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Cart) + Send + Sync + 'static,
    {
        self.inner.subscribers.subscribe(callback)
    }

    pub fn subscribers(&self) -> &SubscriberRegistry {
        &self.inner.subscribers
    }

    pub fn status(&self) -> CacheStatus {
        let state = self.inner.lock_state();
        match &state.phase {
            Phase::Empty => CacheStatus::Empty,
            Phase::Cached {
                snapshot,
                fetched_at,
            } => {
                let snapshot = Arc::clone(snapshot);
                let fetched_at = *fetched_at;
                if fetched_at.elapsed() < self.inner.config.ttl {
                    CacheStatus::Fresh {
                        snapshot,
                        fetched_at,
                    }
                } else {
                    CacheStatus::Stale {
                        snapshot,
                        fetched_at,
                    }
                }
            }
            Phase::Fetching { previous, .. } => CacheStatus::Fetching {
                previous: previous.clone(),
            },
        }
    }

    /// Moves the cache into the `Fetching` state and returns the fetch task.
    ///
    /// The caller spawns the task once the state lock is released. The task runs to completion
    /// even if every reader stops waiting for it.
    fn begin_fetch(
        &self,
        state: &mut State,
        previous: Option<Arc<CartSnapshot>>,
    ) -> (FetchChannel, BoxFuture<'static, ()>) {
        state.fetches_started += 1;
        let generation = state.fetches_started;

        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        state.phase = Phase::Fetching {
            generation,
            previous,
            channel: channel.clone(),
        };

        let abandon_token = {
            let inner = Arc::clone(&self.inner);
            CallOnDrop::new(move || inner.abandon(generation))
        };

        let inner = Arc::clone(&self.inner);
        let task = async move {
            let cart = inner.fetch_isolated().await;

            // Subscribers are notified while this fetch is still in flight. The next fetch can
            // only start once it was stored, so deliveries never overtake each other.
            inner.subscribers.notify(&cart);
            inner.complete(generation, &cart);
            drop(abandon_token);

            sender.send(cart).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        (channel, task.boxed())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use reqwest::StatusCode;

    use super::*;
    use crate::session::StoredSession;
    use crate::test::{self, FetchResponse, MockRemote, line, settle};

    fn recording(cache: &CartCache) -> (Arc<Mutex<Vec<Cart>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscription = cache.subscribe({
            let seen = Arc::clone(&seen);
            move |cart: &Cart| seen.lock().unwrap().push(cart.clone())
        });
        (seen, subscription)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_gets_share_one_fetch() {
        test::setup();
        let remote = MockRemote::new(vec![line("p1", "9.99", 2)]);
        remote.set_delay(Duration::from_millis(50));
        let cache = test::cache_with(&remote, &test::session());

        let (a, b, c) = tokio::join!(cache.get(), cache.get(), cache.get());

        assert_eq!(remote.fetches(), 1);
        assert_eq!(a.item_count(), 2);
        assert!(a.ptr_eq(&b));
        assert!(a.ptr_eq(&c));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_get_is_served_from_memory() {
        test::setup();
        let remote = MockRemote::new(vec![line("p1", "9.99", 2)]);
        let cache = test::cache_with(&remote, &test::session());

        let first = cache.get().await;
        assert!(cache.status().is_fresh());

        assert_eq!(cache.config().ttl, Duration::from_secs(5));
        tokio::time::advance(cache.config().ttl - Duration::from_millis(1)).await;
        let second = cache.get().await;

        assert_eq!(remote.fetches(), 1);
        assert!(first.ptr_eq(&second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_get_fetches_once() {
        test::setup();
        let remote = MockRemote::new(vec![line("p1", "9.99", 2)]);
        let cache = test::cache_with(&remote, &test::session());

        cache.get().await;
        tokio::time::advance(Duration::from_millis(5001)).await;
        assert_eq!(cache.status().name(), "stale");

        cache.get().await;
        cache.get().await;
        assert_eq!(remote.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_transitions() {
        test::setup();
        let remote = MockRemote::new(vec![line("p1", "1.00", 1)]);
        remote.set_delay(Duration::from_millis(10));
        let cache = test::cache_with(&remote, &test::session());
        assert_eq!(cache.status(), CacheStatus::Empty);

        let pending = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get().await }
        });
        settle().await;
        assert_eq!(cache.status(), CacheStatus::Fetching { previous: None });

        let cart = pending.await.unwrap();
        let CacheStatus::Fresh { snapshot, .. } = cache.status() else {
            panic!("expected a fresh cache");
        };
        assert!(cart.ptr_eq(&Cart::Snapshot(Arc::clone(&snapshot))));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.status().name(), "stale");

        let pending = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get().await }
        });
        settle().await;
        let CacheStatus::Fetching { previous } = cache.status() else {
            panic!("expected a fetch in flight");
        };
        assert!(Arc::ptr_eq(&previous.unwrap(), &snapshot));
        pending.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_session_skips_network() {
        test::setup();
        let remote = MockRemote::new(vec![line("p1", "9.99", 2)]);
        let cache = test::cache_with(&remote, &Arc::new(StoredSession::new()));
        let (seen, _subscription) = recording(&cache);

        assert_eq!(cache.get().await, Cart::Empty);
        assert_eq!(remote.fetches(), 0);
        assert_eq!(*seen.lock().unwrap(), [Cart::Empty]);
        assert_eq!(cache.status(), CacheStatus::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_discards_snapshot() {
        test::setup();
        let remote = MockRemote::new(vec![line("p1", "9.99", 2)]);
        let cache = test::cache_with(&remote, &test::session());
        let (seen, _subscription) = recording(&cache);

        assert!(!cache.get().await.is_empty());

        remote.respond_with(FetchResponse::Fail(RemoteError::Status {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: None,
        }));
        assert_eq!(cache.refresh().await, Cart::Empty);
        assert_eq!(cache.status(), CacheStatus::Empty);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], Cart::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_body_is_empty_cart() {
        test::setup();
        let remote = MockRemote::new(vec![]);
        remote.respond_with(FetchResponse::Empty);
        let cache = test::cache_with(&remote, &test::session());

        assert_eq!(cache.get().await, Cart::Empty);
        assert_eq!(cache.status(), CacheStatus::Empty);

        // An empty cart is not cached, every read asks again.
        cache.get().await;
        assert_eq!(remote.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_before_waiters() {
        test::setup();
        let remote = MockRemote::new(vec![line("p1", "9.99", 2)]);
        let cache = test::cache_with(&remote, &test::session());
        let (seen, _subscription) = recording(&cache);

        let _boom = cache.subscribe(|_: &Cart| panic!("widget failed to render"));
        let (after, _after_subscription) = recording(&cache);

        let cart = cache.get().await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(seen.lock().unwrap()[0].ptr_eq(&cart));
        assert!(after.lock().unwrap()[0].ptr_eq(&cart));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribed_callback_is_not_called() {
        test::setup();
        let remote = MockRemote::new(vec![line("p1", "9.99", 2)]);
        let cache = test::cache_with(&remote, &test::session());
        let (seen, subscription) = recording(&cache);

        cache.get().await;
        subscription.unsubscribe();
        subscription.unsubscribe();
        cache.refresh().await;

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(remote.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_is_debounced() {
        test::setup();
        let remote = MockRemote::new(vec![line("p1", "9.99", 2)]);
        let cache = test::cache_with(&remote, &test::session());
        cache.get().await;

        for _ in 0..5 {
            cache.invalidate();
            tokio::time::advance(Duration::from_millis(20)).await;
        }
        settle().await;
        assert_eq!(remote.fetches(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        settle().await;
        assert_eq!(remote.fetches(), 2);
        assert!(cache.status().is_fresh());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_waits_for_outdated_fetch() {
        test::setup();
        let remote = MockRemote::new(vec![line("p1", "9.99", 1)]);
        remote.set_delay(Duration::from_millis(100));
        let cache = test::cache_with(&remote, &test::session());

        let outdated = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get().await }
        });
        settle().await;
        assert_eq!(remote.fetches(), 1);

        // The server changes while the first read is still in flight.
        remote.set_lines(vec![line("p1", "9.99", 1), line("p2", "5.00", 1)]);
        let refreshed = cache.refresh().await;

        assert_eq!(outdated.await.unwrap().lines().len(), 1);
        assert_eq!(refreshed.lines().len(), 2);
        assert_eq!(remote.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_joins_newer_fetch() {
        test::setup();
        let remote = MockRemote::new(vec![line("p1", "9.99", 1)]);
        remote.set_delay(Duration::from_millis(100));
        let cache = test::cache_with(&remote, &test::session());

        let (a, b) = tokio::join!(cache.refresh(), async {
            settle().await;
            cache.get().await
        });

        assert_eq!(remote.fetches(), 1);
        assert!(a.ptr_eq(&b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_survives_dropped_waiters() {
        test::setup();
        let remote = MockRemote::new(vec![line("p1", "9.99", 2)]);
        remote.set_delay(Duration::from_millis(100));
        let cache = test::cache_with(&remote, &test::session());
        let (seen, _subscription) = recording(&cache);

        let timed_out = tokio::time::timeout(Duration::from_millis(10), cache.get()).await;
        assert!(timed_out.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert!(cache.status().is_fresh());
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(remote.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_fetch_notifies_empty() {
        test::setup();
        let remote = MockRemote::new(vec![line("p1", "9.99", 2)]);
        let cache = test::cache_with(&remote, &test::session());
        let (seen, _subscription) = recording(&cache);

        assert_eq!(cache.get().await.item_count(), 2);

        remote.respond_with(FetchResponse::Panic);
        assert_eq!(cache.refresh().await, Cart::Empty);
        assert_eq!(cache.status(), CacheStatus::Empty);

        // Widgets only listening to the subscription drop the discarded snapshot too.
        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 2);
            assert_eq!(seen[1], Cart::Empty);
        }

        remote.respond_with(FetchResponse::Cart);
        assert_eq!(cache.get().await.item_count(), 2);
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_are_notified_before_the_fetch_is_stored() {
        test::setup();
        let remote = MockRemote::new(vec![line("p1", "9.99", 2)]);
        let cache = test::cache_with(&remote, &test::session());

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let _subscription = cache.subscribe({
            let statuses = Arc::clone(&statuses);
            let cache = cache.clone();
            move |_: &Cart| statuses.lock().unwrap().push(cache.status().name())
        });

        cache.get().await;
        cache.refresh().await;

        // No other fetch can start while a fan-out runs, so values arrive in fetch order.
        assert_eq!(*statuses.lock().unwrap(), ["fetching", "fetching"]);
        assert!(cache.status().is_fresh());
        assert_eq!(remote.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bearer_token_is_sent() {
        test::setup();
        let remote = MockRemote::new(vec![]);
        let cache = test::cache_with(&remote, &test::session());

        cache.get().await;
        assert_eq!(remote.last_token().unwrap().as_str(), "test-token");
    }
}

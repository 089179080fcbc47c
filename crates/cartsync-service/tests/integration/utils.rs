use std::sync::Arc;
use std::time::Duration;

use cartsync_service::cache::CartCache;
use cartsync_service::config::Config;
use cartsync_service::remote::HttpCartService;
use cartsync_service::session::StoredSession;
use cartsync_service::subscribers::Subscription;
use cartsync_service::types::Cart;

pub use cartsync_test::{self as test, CartResponse, CartServer, ServerLine};

/// Setup tests and create a cache talking to `server`.
///
/// The cache uses a short invalidation debounce so tests can wait for it in real time. The
/// `update_config` closure can modify any default configuration before the cache is created.
pub fn setup_cache(
    server: &CartServer,
    session: &Arc<StoredSession>,
    update_config: impl FnOnce(&mut Config),
) -> CartCache {
    test::setup();

    let mut config = Config::default();
    config.remote.base_url = server.base_url();
    config.remote.timeout = Duration::from_secs(5);
    config.cache.invalidate_debounce = Duration::from_millis(20);
    update_config(&mut config);

    let remote = HttpCartService::new(&config.remote).unwrap();
    CartCache::new(config.cache, remote, Arc::clone(session))
}

pub fn logged_in() -> Arc<StoredSession> {
    Arc::new(StoredSession::with_token("secret"))
}

/// Waits long enough for a pending invalidation to be refreshed.
pub async fn wait_for_refresh() {
    tokio::time::sleep(Duration::from_millis(250)).await;
}

/// Records every cart value a subscriber receives, until the subscription is cancelled.
pub fn record(cache: &CartCache) -> (Arc<std::sync::Mutex<Vec<Cart>>>, Subscription) {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let subscription = cache.subscribe({
        let seen = Arc::clone(&seen);
        move |cart: &Cart| seen.lock().unwrap().push(cart.clone())
    });
    (seen, subscription)
}

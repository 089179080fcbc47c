use std::sync::Arc;
use std::time::Duration;

use cartsync_service::actions::{CartActions, MutationError};
use cartsync_service::session::StoredSession;
use reqwest::StatusCode;

use crate::{CartServer, ServerLine, logged_in, record, setup_cache, wait_for_refresh};

#[tokio::test]
async fn test_add_refreshes_every_subscriber() {
    let server = CartServer::with_lines(vec![ServerLine::new("1", "9.99", 2)]);
    let cache = setup_cache(&server, &logged_in(), |_| {});
    let actions = CartActions::new(cache.clone());
    let (mini_cart, _mini_cart_subscription) = record(&cache);
    let (shipping, shipping_subscription) = record(&cache);

    cache.get().await;
    actions.add("2", 1).await.unwrap();
    assert_eq!(server.hits("/api/carts/add"), 1);

    wait_for_refresh().await;
    assert_eq!(server.reads(), 2);

    for seen in [&mini_cart, &shipping] {
        let seen = seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last.lines().len(), 2);
        assert_eq!(last.item_count(), 3);
        assert_eq!(last.subtotal().to_string(), "20.98");
    }

    // A cancelled recorder stops seeing refreshes.
    assert!(shipping_subscription.unsubscribe());
    actions.remove("2").await.unwrap();
    wait_for_refresh().await;
    assert_eq!(server.reads(), 3);
    assert_eq!(mini_cart.lock().unwrap().len(), 3);
    assert_eq!(shipping.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_remove_item() {
    let server = CartServer::with_lines(vec![
        ServerLine::new("1", "9.99", 2),
        ServerLine::new("2", "1.00", 1),
    ]);
    let cache = setup_cache(&server, &logged_in(), |_| {});
    let actions = CartActions::new(cache.clone());

    actions.remove("1").await.unwrap();
    assert_eq!(server.hits("/api/carts/remove/1"), 1);
    assert_eq!(server.lines().len(), 1);

    wait_for_refresh().await;
    let cart = cache.get().await;
    assert_eq!(cart.lines().len(), 1);
    assert_eq!(cart.lines()[0].product_id.as_str(), "2");
}

#[tokio::test]
async fn test_rejected_mutations() {
    let server = CartServer::new();
    let cache = setup_cache(&server, &logged_in(), |_| {});
    let actions = CartActions::new(cache);

    server.fail_mutations(Some((StatusCode::CONFLICT, Some("Out of stock".into()))));
    assert_eq!(
        actions.add("1", 1).await,
        Err(MutationError::ServerRejected {
            status: StatusCode::CONFLICT,
            message: "Out of stock".into(),
        })
    );

    server.fail_mutations(Some((StatusCode::BAD_REQUEST, None)));
    let error = actions.add("1", 1).await.unwrap_err();
    assert_eq!(error.to_string(), "Add to cart failed (400)");

    let error = actions.remove("1").await.unwrap_err();
    assert_eq!(error.to_string(), "Remove from cart failed (400)");

    server.fail_mutations(Some((StatusCode::UNAUTHORIZED, None)));
    assert_eq!(
        actions.add("1", 1).await,
        Err(MutationError::Unauthenticated)
    );

    wait_for_refresh().await;
    assert_eq!(server.reads(), 0);
}

#[tokio::test]
async fn test_logged_out_mutations_skip_network() {
    let server = CartServer::new();
    let cache = setup_cache(&server, &Arc::new(StoredSession::new()), |_| {});
    let actions = CartActions::new(cache);

    assert_eq!(
        actions.add("1", 1).await,
        Err(MutationError::Unauthenticated)
    );
    assert_eq!(
        actions.remove("1").await,
        Err(MutationError::Unauthenticated)
    );
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_burst_of_adds_reads_once() {
    let server = CartServer::new();
    let cache = setup_cache(&server, &logged_in(), |config| {
        config.cache.invalidate_debounce = Duration::from_millis(200);
    });
    let actions = CartActions::new(cache.clone());

    for _ in 0..3 {
        actions.add("7", 1).await.unwrap();
    }
    assert_eq!(server.reads(), 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(server.reads(), 1);
    assert_eq!(cache.get().await.item_count(), 3);
    assert_eq!(server.reads(), 1);
}

use std::sync::Arc;
use std::time::Duration;

use cartsync_service::session::StoredSession;
use cartsync_service::types::{Cart, Price};
use reqwest::StatusCode;

use crate::{CartResponse, CartServer, ServerLine, logged_in, record, setup_cache};

#[tokio::test]
async fn test_cart_is_parsed() {
    let server = CartServer::with_lines(vec![ServerLine::new("42", "9.99", 2)]);
    let cache = setup_cache(&server, &logged_in(), |_| {});

    let cart = cache.get().await;

    assert_eq!(cart.lines().len(), 1);
    let line = &cart.lines()[0];
    assert_eq!(line.product_id.as_str(), "42");
    assert_eq!(line.name, "Product 42");
    assert_eq!(line.unit_price, Price::from_cents(999));
    assert_eq!(line.quantity, 2);
    assert_eq!(line.image_ref, "/images/products/42.jpg");
    assert_eq!(cart.subtotal().to_string(), "19.98");
    assert_eq!(cart.item_count(), 2);
}

#[tokio::test]
async fn test_concurrent_reads_share_one_request() {
    let server = CartServer::with_lines(vec![ServerLine::new("1", "5.00", 1)]);
    server.set_read(CartResponse::Delayed(Duration::from_millis(100)));
    let cache = setup_cache(&server, &logged_in(), |_| {});

    let carts = futures::future::join_all((0..8).map(|_| cache.get())).await;

    assert_eq!(server.reads(), 1);
    assert!(carts.iter().all(|cart| cart.ptr_eq(&carts[0])));
    assert_eq!(carts[0].item_count(), 1);
}

#[tokio::test]
async fn test_fresh_cart_is_served_from_memory() {
    let server = CartServer::with_lines(vec![ServerLine::new("1", "5.00", 1)]);
    let cache = setup_cache(&server, &logged_in(), |_| {});

    cache.get().await;
    cache.get().await;
    cache.get().await;

    assert_eq!(server.reads(), 1);
}

#[tokio::test]
async fn test_expired_cart_is_read_again() {
    let server = CartServer::with_lines(vec![ServerLine::new("1", "5.00", 1)]);
    let cache = setup_cache(&server, &logged_in(), |config| {
        config.cache.ttl = Duration::from_millis(100);
    });

    cache.get().await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(cache.status().name(), "stale");

    cache.get().await;
    assert_eq!(server.reads(), 2);
}

#[tokio::test]
async fn test_server_error_yields_empty_cart() {
    let server = CartServer::with_lines(vec![ServerLine::new("1", "5.00", 1)]);
    let cache = setup_cache(&server, &logged_in(), |_| {});
    let (seen, _subscription) = record(&cache);

    assert!(!cache.get().await.is_empty());

    server.set_read(CartResponse::Status(
        StatusCode::INTERNAL_SERVER_ERROR,
        Some("database unavailable".into()),
    ));
    assert_eq!(cache.refresh().await, Cart::Empty);
    assert_eq!(cache.status().name(), "empty");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1], Cart::Empty);
}

#[tokio::test]
async fn test_empty_body_yields_empty_cart() {
    let server = CartServer::new();
    server.set_read(CartResponse::Empty);
    let cache = setup_cache(&server, &logged_in(), |_| {});

    assert_eq!(cache.get().await, Cart::Empty);
    assert_eq!(server.reads(), 1);
}

#[tokio::test]
async fn test_logged_out_reads_skip_network() {
    let server = CartServer::with_lines(vec![ServerLine::new("1", "5.00", 1)]);
    let cache = setup_cache(&server, &Arc::new(StoredSession::new()), |_| {});
    let (seen, _subscription) = record(&cache);

    assert_eq!(cache.get().await, Cart::Empty);
    assert_eq!(server.accesses(), 0);
    assert_eq!(*seen.lock().unwrap(), [Cart::Empty]);
}

#[tokio::test]
async fn test_bearer_token_is_sent() {
    let server = CartServer::new();
    let cache = setup_cache(&server, &logged_in(), |_| {});

    cache.get().await;
    assert_eq!(server.tokens(), [Some("secret".to_owned())]);
}

#[tokio::test]
async fn test_unreachable_server_yields_empty_cart() {
    let server = CartServer::new();
    let session = logged_in();
    let cache = setup_cache(&server, &session, |config| {
        config.remote.connect_timeout = Duration::from_millis(200);
    });
    drop(server);
    // Give the aborted server task a moment to close its listener.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(cache.get().await, Cart::Empty);
}

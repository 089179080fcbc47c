//! Helpers for testing cart clients against a real HTTP server.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`CartServer`], make sure that the server is held until all requests to
//!    the server have been made. If the server is dropped, all connections to it will fail. To
//!    avoid this, assign it to a variable: `let server = CartServer::new();`.
//!
//!  - The server runs on real sockets, so tests using it cannot pause the Tokio clock. Use short
//!    cache timings instead.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::extract::{self, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router, middleware};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `cartsync_service` crate and mutes
///    all other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("cartsync_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router.into_make_service())
                .await
                .unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// How the server answers cart reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CartResponse {
    /// The current cart as JSON.
    Json,
    /// `200 OK` without a body.
    Empty,
    /// The given status, with a JSON `{"message": ..}` body if a message is set.
    Status(StatusCode, Option<String>),
    /// The cart as it was when the request arrived, sent after a delay.
    Delayed(Duration),
}

/// A cart line in the format of the shop backend.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerLine {
    pub product_id: Value,
    pub name: String,
    pub price: String,
    pub quantity: u32,
    pub image_url: String,
}

impl ServerLine {
    /// Creates a line. Numeric ids are sent as JSON numbers, like the backend does.
    pub fn new(product_id: &str, price: &str, quantity: u32) -> Self {
        let id = match product_id.parse::<u64>() {
            Ok(id) => Value::from(id),
            Err(_) => Value::from(product_id),
        };
        Self {
            product_id: id,
            name: format!("Product {product_id}"),
            price: price.to_owned(),
            quantity,
            image_url: format!("/images/products/{product_id}.jpg"),
        }
    }

    pub fn id(&self) -> String {
        id_string(&self.product_id)
    }
}

fn id_string(id: &Value) -> String {
    match id {
        Value::String(id) => id.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug)]
struct CartState {
    lines: Vec<ServerLine>,
    read: CartResponse,
    mutation_failure: Option<(StatusCode, Option<String>)>,
    hits: BTreeMap<String, usize>,
    tokens: Vec<Option<String>>,
}

type SharedState = Arc<Mutex<CartState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, CartState> {
    state.lock().unwrap()
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::to_owned)
}

fn cart_body(lines: &[ServerLine]) -> Value {
    json!({ "id": 1, "userId": 1, "items": lines })
}

fn error_response(status: StatusCode, message: Option<String>) -> Response {
    match message {
        Some(message) => (status, Json(json!({ "message": message }))).into_response(),
        None => status.into_response(),
    }
}

async fn read_cart(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if bearer(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let (read, body) = {
        let state = lock(&state);
        (state.read.clone(), cart_body(&state.lines))
    };

    match read {
        CartResponse::Json => Json(body).into_response(),
        CartResponse::Empty => StatusCode::OK.into_response(),
        CartResponse::Status(status, message) => error_response(status, message),
        CartResponse::Delayed(delay) => {
            tokio::time::sleep(delay).await;
            Json(body).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddRequest {
    product_id: Value,
    quantity: Option<u32>,
}

async fn add_item(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<AddRequest>,
) -> Response {
    if bearer(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let mut state = lock(&state);
    if let Some((status, message)) = state.mutation_failure.clone() {
        return error_response(status, message);
    }

    let id = id_string(&request.product_id);
    let quantity = request.quantity.unwrap_or(1).max(1);
    match state.lines.iter().position(|line| line.id() == id) {
        Some(index) => state.lines[index].quantity += quantity,
        None => state.lines.push(ServerLine::new(&id, "1.00", quantity)),
    }
    Json(cart_body(&state.lines)).into_response()
}

async fn remove_item(
    State(state): State<SharedState>,
    headers: HeaderMap,
    extract::Path(product_id): extract::Path<String>,
) -> Response {
    if bearer(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let mut state = lock(&state);
    if let Some((status, message)) = state.mutation_failure.clone() {
        return error_response(status, message);
    }

    state.lines.retain(|line| line.id() != product_id);
    Json(cart_body(&state.lines)).into_response()
}

/// A mock of the shop backend's cart endpoints.
///
/// Serves `GET /api/carts/current`, `POST /api/carts/add` and
/// `DELETE /api/carts/remove/{productId}` on an in-memory cart. Requests without a bearer token are
/// answered with `401`. Every request is counted per path, along with the token it carried.
#[derive(Debug)]
pub struct CartServer {
    server: Server,
    state: SharedState,
}

impl CartServer {
    pub fn new() -> Self {
        Self::with_lines(Vec::new())
    }

    pub fn with_lines(lines: Vec<ServerLine>) -> Self {
        let state = Arc::new(Mutex::new(CartState {
            lines,
            read: CartResponse::Json,
            mutation_failure: None,
            hits: BTreeMap::new(),
            tokens: Vec::new(),
        }));

        let hitcounter = {
            let state = state.clone();
            move |extract::OriginalUri(uri): extract::OriginalUri,
                  request: extract::Request,
                  next: middleware::Next| {
                let state = state.clone();
                async move {
                    {
                        let mut state = lock(&state);
                        *state.hits.entry(uri.path().to_owned()).or_default() += 1;
                        let token = bearer(request.headers());
                        state.tokens.push(token);
                    }

                    next.run(request).await
                }
            }
        };

        let router = Router::new()
            .route("/api/carts/current", get(read_cart))
            .route("/api/carts/add", post(add_item))
            .route("/api/carts/remove/:product_id", delete(remove_item))
            .layer(middleware::from_fn(hitcounter))
            .with_state(state.clone());

        let server = Server::with_router(router);

        Self { server, state }
    }

    /// Changes how subsequent cart reads are answered.
    pub fn set_read(&self, read: CartResponse) {
        lock(&self.state).read = read;
    }

    /// Makes add and remove fail with the given status, or succeed again with `None`.
    pub fn fail_mutations(&self, failure: Option<(StatusCode, Option<String>)>) {
        lock(&self.state).mutation_failure = failure;
    }

    pub fn set_lines(&self, lines: Vec<ServerLine>) {
        lock(&self.state).lines = lines;
    }

    pub fn lines(&self) -> Vec<ServerLine> {
        lock(&self.state).lines.clone()
    }

    /// The number of requests to the given path.
    pub fn hits(&self, path: &str) -> usize {
        lock(&self.state).hits.get(path).copied().unwrap_or(0)
    }

    /// The number of cart reads.
    pub fn reads(&self) -> usize {
        self.hits("/api/carts/current")
    }

    /// The total number of requests.
    pub fn accesses(&self) -> usize {
        lock(&self.state).hits.values().sum()
    }

    pub fn all_hits(&self) -> Vec<(String, usize)> {
        lock(&self.state)
            .hits
            .iter()
            .map(|(path, hits)| (path.clone(), *hits))
            .collect()
    }

    /// The bearer tokens of all requests so far, in order.
    pub fn tokens(&self) -> Vec<Option<String>> {
        lock(&self.state).tokens.clone()
    }

    /// The base URL to configure clients with, ending in `/`.
    pub fn base_url(&self) -> Url {
        self.server.url("/")
    }
}

impl Default for CartServer {
    fn default() -> Self {
        Self::new()
    }
}

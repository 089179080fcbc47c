//! The remote cart service and its HTTP implementation.

use std::fmt;

use futures::future::{BoxFuture, FutureExt};
use reqwest::{Method, StatusCode, header};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::RemoteConfig;
use crate::session::Token;
use crate::types::{CartSnapshot, ProductId};

/// An error talking to the remote cart service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The server rejected the credential, or none was sent.
    #[error("not authorized")]
    Unauthorized,
    /// Any other non-success status.
    #[error("server responded with {status}")]
    Status {
        status: StatusCode,
        /// The `message` field of a JSON error body, if the server sent one.
        message: Option<String>,
    },
    /// The request never produced a response: connection failures and timeouts.
    #[error("request failed: {0}")]
    Transport(String),
    /// The response body was not a valid cart.
    #[error("malformed cart: {0}")]
    Malformed(String),
}

impl RemoteError {
    /// A short, stable name for use in metrics tags.
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteError::Unauthorized => "unauthorized",
            RemoteError::Status { .. } => "status",
            RemoteError::Transport(_) => "transport",
            RemoteError::Malformed(_) => "malformed",
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        RemoteError::Transport(err.to_string())
    }
}

/// The server holding the authoritative cart.
///
/// A `None` token sends the request without an `Authorization` header.
pub trait RemoteCartService: Send + Sync + 'static {
    /// Reads the current cart.
    ///
    /// Resolves to `Ok(None)` when the server answered successfully with an empty body.
    fn fetch_cart(
        &self,
        token: Option<Token>,
    ) -> BoxFuture<'_, Result<Option<CartSnapshot>, RemoteError>>;

    /// Adds `quantity` units of a product.
    fn add_item(
        &self,
        token: Option<Token>,
        product_id: ProductId,
        quantity: u32,
    ) -> BoxFuture<'_, Result<(), RemoteError>>;

    /// Removes a product from the cart entirely.
    fn remove_item(
        &self,
        token: Option<Token>,
        product_id: ProductId,
    ) -> BoxFuture<'_, Result<(), RemoteError>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AddItemRequest<'a> {
    product_id: &'a ProductId,
    quantity: u32,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// Talks to the cart endpoints of a shop backend over HTTP.
#[derive(Clone)]
pub struct HttpCartService {
    client: reqwest::Client,
    base_url: Url,
}

impl fmt::Debug for HttpCartService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpCartService")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl HttpCartService {
    pub fn new(config: &RemoteConfig) -> reqwest::Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .build()?;
        Ok(Self::with_client(client, config.base_url.clone()))
    }

    /// Uses an existing client, for example one shared with other services.
    pub fn with_client(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(path)
            .map_err(|err| RemoteError::Transport(format!("invalid url {path:?}: {err}")))
    }

    fn request(
        &self,
        method: Method,
        url: Url,
        token: Option<&Token>,
    ) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        match token {
            Some(token) => builder.bearer_auth(token.as_str()),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<String, RemoteError> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(RemoteError::Unauthorized);
        }
        if !status.is_success() {
            let message = serde_json::from_str::<ErrorBody>(&body)
                .ok()
                .and_then(|body| body.message)
                .filter(|message| !message.is_empty());
            return Err(RemoteError::Status { status, message });
        }
        Ok(body)
    }

    async fn do_fetch_cart(
        &self,
        token: Option<Token>,
    ) -> Result<Option<CartSnapshot>, RemoteError> {
        let url = self.endpoint("api/carts/current")?;
        let body = self
            .send(self.request(Method::GET, url, token.as_ref()))
            .await?;
        CartSnapshot::from_body(&body).map_err(|err| RemoteError::Malformed(err.to_string()))
    }

    async fn do_add_item(
        &self,
        token: Option<Token>,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<(), RemoteError> {
        let url = self.endpoint("api/carts/add")?;
        let body = AddItemRequest {
            product_id: &product_id,
            quantity,
        };
        let builder = self.request(Method::POST, url, token.as_ref()).json(&body);
        self.send(builder).await.map(drop)
    }

    async fn do_remove_item(
        &self,
        token: Option<Token>,
        product_id: ProductId,
    ) -> Result<(), RemoteError> {
        let mut url = self.endpoint("api/carts/remove/")?;
        url.path_segments_mut()
            .map_err(|_| RemoteError::Transport("base url cannot have a path".into()))?
            .pop_if_empty()
            .push(product_id.as_str());
        self.send(self.request(Method::DELETE, url, token.as_ref()))
            .await
            .map(drop)
    }
}

impl RemoteCartService for HttpCartService {
    fn fetch_cart(
        &self,
        token: Option<Token>,
    ) -> BoxFuture<'_, Result<Option<CartSnapshot>, RemoteError>> {
        self.do_fetch_cart(token).boxed()
    }

    fn add_item(
        &self,
        token: Option<Token>,
        product_id: ProductId,
        quantity: u32,
    ) -> BoxFuture<'_, Result<(), RemoteError>> {
        self.do_add_item(token, product_id, quantity).boxed()
    }

    fn remove_item(
        &self,
        token: Option<Token>,
        product_id: ProductId,
    ) -> BoxFuture<'_, Result<(), RemoteError>> {
        self.do_remove_item(token, product_id).boxed()
    }
}

impl<T: RemoteCartService> RemoteCartService for std::sync::Arc<T> {
    fn fetch_cart(
        &self,
        token: Option<Token>,
    ) -> BoxFuture<'_, Result<Option<CartSnapshot>, RemoteError>> {
        (**self).fetch_cart(token)
    }

    fn add_item(
        &self,
        token: Option<Token>,
        product_id: ProductId,
        quantity: u32,
    ) -> BoxFuture<'_, Result<(), RemoteError>> {
        (**self).add_item(token, product_id, quantity)
    }

    fn remove_item(
        &self,
        token: Option<Token>,
        product_id: ProductId,
    ) -> BoxFuture<'_, Result<(), RemoteError>> {
        (**self).remove_item(token, product_id)
    }
}

//! Cart mutations.
//!
//! Mutations never modify the cached snapshot. After the server accepted a change, the cache is
//! invalidated and re-reads the cart, so every widget ends up showing what the server holds.

use reqwest::StatusCode;

use crate::cache::CartCache;
use crate::remote::RemoteError;
use crate::types::ProductId;

/// Why a mutation did not go through.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
    /// There is no usable session, or the server rejected it.
    ///
    /// The caller is expected to send the user to a login page.
    #[error("not logged in")]
    Unauthenticated,
    /// The server refused the change.
    #[error("{message}")]
    ServerRejected { status: StatusCode, message: String },
    /// The request never produced a response.
    #[error("request failed: {0}")]
    Transport(String),
}

#[derive(Clone, Copy, Debug)]
enum Operation {
    Add,
    Remove,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Operation::Add => "add",
            Operation::Remove => "remove",
        }
    }

    fn failure_message(self, status: StatusCode) -> String {
        let status = status.as_u16();
        match self {
            Operation::Add => format!("Add to cart failed ({status})"),
            Operation::Remove => format!("Remove from cart failed ({status})"),
        }
    }

    fn map_error(self, error: RemoteError) -> MutationError {
        match error {
            RemoteError::Unauthorized => MutationError::Unauthenticated,
            RemoteError::Status { status, message } => MutationError::ServerRejected {
                status,
                message: message.unwrap_or_else(|| self.failure_message(status)),
            },
            RemoteError::Transport(details) | RemoteError::Malformed(details) => {
                MutationError::Transport(details)
            }
        }
    }
}

/// Adds and removes cart items on behalf of the current session.
#[derive(Clone, Debug)]
pub struct CartActions {
    cache: CartCache,
}

impl CartActions {
    pub fn new(cache: CartCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &CartCache {
        &self.cache
    }

    /// Adds `quantity` units of a product to the cart.
    pub async fn add(
        &self,
        product_id: impl Into<ProductId>,
        quantity: u32,
    ) -> Result<(), MutationError> {
        let product_id = product_id.into();
        let Some(token) = self.cache.session().token() else {
            return Err(MutationError::Unauthenticated);
        };

        tracing::debug!(%product_id, quantity, "Adding item to cart");
        let result = self
            .cache
            .remote()
            .add_item(Some(token), product_id, quantity)
            .await;
        self.finish(Operation::Add, result)
    }

    /// Removes a product from the cart.
    pub async fn remove(&self, product_id: impl Into<ProductId>) -> Result<(), MutationError> {
        let product_id = product_id.into();
        let Some(token) = self.cache.session().token() else {
            return Err(MutationError::Unauthenticated);
        };

        tracing::debug!(%product_id, "Removing item from cart");
        let result = self
            .cache
            .remote()
            .remove_item(Some(token), product_id)
            .await;
        self.finish(Operation::Remove, result)
    }

    fn finish(
        &self,
        operation: Operation,
        result: Result<(), RemoteError>,
    ) -> Result<(), MutationError> {
        let status = match &result {
            Ok(()) => "ok",
            Err(error) => error.kind(),
        };
        metric!(counter("cart.mutation") += 1, "op" => operation.as_str(), "status" => status);

        match result {
            Ok(()) => {
                self.cache.invalidate();
                Ok(())
            }
            Err(error) => {
                let error = operation.map_error(error);
                tracing::warn!(
                    op = operation.as_str(),
                    error = &error as &dyn std::error::Error,
                    "Cart mutation failed"
                );
                Err(error)
            }
        }
    }
}

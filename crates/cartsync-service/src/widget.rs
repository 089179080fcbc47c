//! Cart consumers: the attach/detach lifecycle of a widget and the model it renders.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::cache::CartCache;
use crate::subscribers::Subscription;
use crate::types::{Cart, Price, ProductId};

/// One line as displayed by a widget.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LineView {
    pub id: ProductId,
    pub name: String,
    pub price: Price,
    pub quantity: u32,
    pub line_total: Price,
    pub image: String,
}

/// What a cart widget displays for a given [`Cart`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CartView {
    pub items: Vec<LineView>,
    /// Total number of units, the mini-cart badge.
    pub count: u64,
    pub subtotal: Price,
}

impl CartView {
    /// Formats a price for display, e.g. `$19.98`.
    pub fn format_price(price: Price) -> String {
        format!("${price}")
    }

    pub fn formatted_subtotal(&self) -> String {
        Self::format_price(self.subtotal)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl From<&Cart> for CartView {
    fn from(cart: &Cart) -> Self {
        let items = cart
            .lines()
            .iter()
            .map(|line| LineView {
                id: line.product_id.clone(),
                name: line.name.clone(),
                price: line.unit_price,
                quantity: line.quantity,
                line_total: line.line_total(),
                image: line.image_ref.clone(),
            })
            .collect();

        CartView {
            items,
            count: cart.item_count(),
            subtotal: cart.subtotal(),
        }
    }
}

type Render = Arc<dyn Fn(&Cart) + Send + Sync>;

fn render_if_attached(attached: &AtomicBool, render: &Render, cart: &Cart) {
    if !attached.load(Ordering::Acquire) {
        return;
    }
    if catch_unwind(AssertUnwindSafe(|| render(cart))).is_err() {
        metric!(counter("cart.subscriber.failure") += 1);
        tracing::error!("Cart widget failed to render");
    }
}

/// A consumer of the cart, rendering every new value until it is detached.
#[derive(Debug)]
pub struct CartWidget {
    subscription: Subscription,
    attached: Arc<AtomicBool>,
    initial_load: JoinHandle<()>,
}

impl CartWidget {
    /// Subscribes `render` to the cache and renders the current cart once it is available.
    ///
    /// The initial read runs in the background. Notifications may render before the initial read
    /// settles, both values are authoritative. Must be called within a Tokio runtime.
    pub fn attach<F>(cache: &CartCache, render: F) -> Self
    where
        F: Fn(&Cart) + Send + Sync + 'static,
    {
        let render: Render = Arc::new(render);
        let attached = Arc::new(AtomicBool::new(true));

        let subscription = cache.subscribe({
            let render = Arc::clone(&render);
            let attached = Arc::clone(&attached);
            move |cart: &Cart| render_if_attached(&attached, &render, cart)
        });

        let initial_load = tokio::spawn({
            let cache = cache.clone();
            let attached = Arc::clone(&attached);
            async move {
                let cart = cache.get().await;
                render_if_attached(&attached, &render, &cart);
            }
        });

        Self {
            subscription,
            attached,
            initial_load,
        }
    }

    /// Stops rendering, including a pending initial read. Calling this again is a no-op.
    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
        self.subscription.unsubscribe();
        self.initial_load.abort();
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }
}

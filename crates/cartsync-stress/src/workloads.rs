use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cartsync_service::actions::CartActions;
use cartsync_service::cache::CartCache;
use cartsync_test::ServerLine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    /// Initial contents of the mock cart.
    #[serde(default)]
    pub cart: Vec<SeedLine>,
    /// Added latency of every cart read on the mock server.
    #[serde(default, with = "humantime_serde")]
    pub read_latency: Option<Duration>,
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SeedLine {
    pub product_id: String,
    pub price: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

impl From<&SeedLine> for ServerLine {
    fn from(line: &SeedLine) -> Self {
        ServerLine::new(&line.product_id, &line.price, line.quantity)
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    /// Widgets reading the cart, pausing after every read.
    Widgets {
        #[serde(default, with = "humantime_serde")]
        think_time: Option<Duration>,
    },
    /// Users adding a product and removing it again.
    Mutators { products: Vec<String> },
}

pub enum ParsedPayload {
    Widgets { think_time: Duration },
    Mutators {
        products: Vec<String>,
        next: AtomicUsize,
    },
}

pub fn prepare_payload(payload: Payload) -> ParsedPayload {
    match payload {
        Payload::Widgets { think_time } => ParsedPayload::Widgets {
            think_time: think_time.unwrap_or_default(),
        },
        Payload::Mutators { products } => ParsedPayload::Mutators {
            products,
            next: AtomicUsize::new(0),
        },
    }
}

pub async fn process_payload(cart: &(CartCache, CartActions), workload: &ParsedPayload) {
    let (cache, actions) = cart;
    match workload {
        ParsedPayload::Widgets { think_time } => {
            cache.get().await;
            if !think_time.is_zero() {
                tokio::time::sleep(*think_time).await;
            }
        }
        ParsedPayload::Mutators { products, next } => {
            if products.is_empty() {
                return;
            }
            let index = next.fetch_add(1, Ordering::Relaxed) % products.len();
            let product = products[index].as_str();

            // Rejections are logged by the actions, the harness only measures throughput.
            actions.add(product, 1).await.ok();
            actions.remove(product).await.ok();
        }
    }
}

//! Client-side cache and synchronization for a shared remote cart.
//!
//! Many independent widgets read the same cart. The [`CartCache`](cache::CartCache) keeps the last
//! snapshot the server reported, deduplicates concurrent reads into a single request, and fans
//! every new value out to all subscribed widgets. Mutations go through
//! [`CartActions`](actions::CartActions), which never touch the local snapshot but ask the cache
//! to re-read the cart after a short debounce.

#[macro_use]
pub mod metrics;

pub mod actions;
pub mod cache;
pub mod config;
pub mod logging;
pub mod remote;
pub mod scheduler;
pub mod session;
pub mod subscribers;
pub mod types;
pub mod utils;
pub mod widget;


pub use cache::{CacheStatus, CartCache};
pub use types::{Cart, CartLine, CartSnapshot, Price, ProductId};

pub mod client;
pub mod store;

pub use client::NatsClient;
pub use store::{NatsBlobStore, NatsSessionStore};

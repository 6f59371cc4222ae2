//! Catalog-driven synchronization of object-storage buckets.
//!
//! The engine keeps one durable catalog row per source object, merges fresh listings into it
//! ([`execution::reconciler`]), and drains entries that need copying through a bounded worker
//! pool ([`execution::scheduler`]). Transports live under [`ops`].

pub mod execution;
pub mod ops;
pub mod service;
pub mod settings;
pub mod utils;

mod prelude;

pub use service::{RunFailed, SyncService};

pub mod catalog;
pub mod catalog_setup;
pub mod import_feed;
pub mod reconciler;
pub mod scheduler;
pub mod stats;
pub mod status;

//! Shared building blocks for the PingMeMaybe services: configuration,
//! error taxonomy, data model and the notification record store.

pub mod config;
pub mod db;
pub mod error;
pub mod redis_pool;
pub mod store;
pub mod types;

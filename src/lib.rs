//! WireMQ client engine – delivery and transaction coordination for a
//! single broker connection.
//!
//! This crate exports
//!  * `core`   – address selection, delivery queues, flow control, transactions
//!  * `link`   – the broker transport boundary and connection establishment
//!  * `engine` – the session-facing delivery facade
//!  * `config` – TOML-driven runtime configuration
//!
//! The engine owns everything between the raw packet transport and the
//! application callback: it fans inbound packets out to per-consumer
//! queues, drives consumer callbacks from background reader threads,
//! keeps the broker's prefetch credit topped up, and runs the two-phase
//! transaction state machine across broker failover. The transport
//! itself (`link::BrokerLink`) and message-body decoding are consumed
//! behind narrow traits and never implemented here.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod config;
pub mod core;
pub mod engine;
pub mod link;
pub mod logging;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use config::{load_config, Config};
pub use core::error::WireError;
pub use engine::DeliveryEngine;

//! CDC audit consumer
//!
//! Reads Debezium change events from a Kafka consumer group and appends each
//! one to an immudb audit ledger, committing offsets only after the append.

pub mod config;
pub mod error;
pub mod services;

pub use config::Config;
pub use error::{AuditError, Result};

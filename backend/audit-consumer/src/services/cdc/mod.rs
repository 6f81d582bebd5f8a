//! Debezium change event decoding and mapping onto audit records.

pub mod models;
pub mod transformer;

pub use models::{AuditRecord, CdcOperation, CdcSource, ChangeEvent};
pub use transformer::{decode, to_audit_record, transform};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// CDC operation types from Debezium
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CdcOperation {
    /// Insert operation (c = create)
    #[serde(rename = "c")]
    Insert,
    /// Update operation (u = update)
    #[serde(rename = "u")]
    Update,
    /// Delete operation (d = delete)
    #[serde(rename = "d")]
    Delete,
    /// Read operation (r = read, initial snapshot)
    #[serde(rename = "r")]
    Snapshot,
}

impl CdcOperation {
    /// Short code as written to the ledger's `event_operation` column.
    pub fn code(&self) -> &'static str {
        match self {
            CdcOperation::Insert => "c",
            CdcOperation::Update => "u",
            CdcOperation::Delete => "d",
            CdcOperation::Snapshot => "r",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CdcSource {
    /// Debezium connector version
    #[serde(default)]
    pub version: Option<String>,

    /// Connector type (e.g., "postgresql")
    #[serde(default)]
    pub connector: String,

    /// Logical name of the database server
    #[serde(default)]
    pub name: Option<String>,

    /// Timestamp in milliseconds
    #[serde(default)]
    pub ts_ms: Option<i64>,

    /// Database name
    #[serde(default)]
    pub db: String,

    /// Schema name (absent for MySQL)
    #[serde(default)]
    pub schema: Option<String>,

    /// Table name
    #[serde(default)]
    pub table: String,

    #[serde(default)]
    pub sequence: Option<String>,

    #[serde(default, rename = "txId")]
    pub tx_id: Option<i64>,

    #[serde(default)]
    pub lsn: Option<i64>,
}

/// A decoded Debezium change envelope.
///
/// `before` and `after` are kept as the raw JSON text the producer sent.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub operation: CdcOperation,
    pub event_time_ms: i64,
    pub application: String,
    pub before: Option<Box<RawValue>>,
    pub after: Option<Box<RawValue>>,
    pub source: CdcSource,
}

/// Normalized row appended to the `audit_trail` relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub connector: String,
    pub application: String,
    pub database_name: String,
    pub schema_name: String,
    pub table_name: String,
    pub operation: CdcOperation,
    pub event_timestamp: DateTime<Utc>,
    /// `{"after":…,"before":…}` as JSON text
    pub payload: String,
}

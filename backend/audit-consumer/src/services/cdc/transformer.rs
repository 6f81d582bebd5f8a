use chrono::DateTime;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use super::models::{AuditRecord, CdcOperation, CdcSource, ChangeEvent};
use crate::error::{AuditError, Result};

/// Top-level keys that tell a schema-wrapped message from a bare envelope.
///
/// With `value.converter.schemas.enable = true` Debezium sends
/// `{"schema": …, "payload": {…}}`; otherwise the envelope itself.
#[derive(Deserialize)]
struct EnvelopeProbe {
    #[serde(default)]
    payload: Option<Box<RawValue>>,
    #[serde(default)]
    op: Option<IgnoredAny>,
}

#[derive(Deserialize)]
struct WireEnvelope {
    op: CdcOperation,
    #[serde(default)]
    ts_ms: Option<i64>,
    #[serde(default)]
    before: Option<Box<RawValue>>,
    #[serde(default)]
    after: Option<Box<RawValue>>,
    source: CdcSource,
    #[serde(default)]
    application: Option<String>,
}

#[derive(Serialize)]
struct PayloadBlob<'a> {
    after: Option<&'a RawValue>,
    before: Option<&'a RawValue>,
}

/// Decode raw message bytes into a [`ChangeEvent`].
///
/// Unknown fields are ignored. Only `op` and the source descriptor are
/// required; the event time falls back to `source.ts_ms` and then to the
/// Unix epoch.
pub fn decode(bytes: &[u8]) -> Result<ChangeEvent> {
    let probe: EnvelopeProbe = serde_json::from_slice(bytes)?;

    let envelope: WireEnvelope = match (probe.op, probe.payload) {
        (None, Some(inner)) => serde_json::from_str(inner.get())?,
        _ => serde_json::from_slice(bytes)?,
    };

    if envelope.before.is_some()
        && envelope.after.is_some()
        && envelope.op != CdcOperation::Update
    {
        return Err(AuditError::MalformedEvent(format!(
            "'{}' event carries both before and after images",
            envelope.op.code()
        )));
    }

    let event_time_ms = envelope.ts_ms.or(envelope.source.ts_ms).unwrap_or(0);

    Ok(ChangeEvent {
        operation: envelope.op,
        event_time_ms,
        application: envelope.application.unwrap_or_default(),
        before: envelope.before,
        after: envelope.after,
        source: envelope.source,
    })
}

/// Map a decoded event onto the ledger row shape.
pub fn to_audit_record(event: &ChangeEvent) -> Result<AuditRecord> {
    let event_timestamp = DateTime::from_timestamp_millis(event.event_time_ms).ok_or_else(|| {
        AuditError::MalformedEvent(format!(
            "ts_ms {} is outside the representable range",
            event.event_time_ms
        ))
    })?;

    let payload = serde_json::to_string(&PayloadBlob {
        after: event.after.as_deref(),
        before: event.before.as_deref(),
    })?;

    Ok(AuditRecord {
        connector: event.source.connector.clone(),
        application: event.application.clone(),
        database_name: event.source.db.clone(),
        schema_name: event.source.schema.clone().unwrap_or_default(),
        table_name: event.source.table.clone(),
        operation: event.operation,
        event_timestamp,
        payload,
    })
}

/// Decode and map in one step.
pub fn transform(bytes: &[u8]) -> Result<AuditRecord> {
    let event = decode(bytes)?;
    to_audit_record(&event)
}

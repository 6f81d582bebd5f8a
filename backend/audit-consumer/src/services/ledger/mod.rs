//! Append-only audit ledger.
//!
//! [`LedgerStore`] is the storage seam (immudb in production), [`LedgerWriter`]
//! wraps it with the write timeout and the failure policy.

pub mod immudb;

use async_trait::async_trait;
use resilience::{sleep_unless_shutdown, with_timeout, BackoffPolicy, TimeoutError};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{AuditError, Result};
use crate::services::cdc::AuditRecord;

pub use immudb::{ImmudbConnector, ImmudbLedger};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create the audit relation if it does not exist yet.
    async fn ensure_schema(&self) -> Result<()>;

    /// Append one record. There is no update or delete path.
    async fn append(&self, record: &AuditRecord) -> Result<()>;
}

/// Opens a [`LedgerStore`]; the supervisor calls this again after every
/// connection failure.
#[async_trait]
pub trait LedgerConnector: Send + Sync {
    type Store: LedgerStore + 'static;

    async fn connect(&self) -> Result<Self::Store>;
}

/// What to do when an append fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// Re-attempt the same append until it succeeds or shutdown is requested.
    #[default]
    Retry,
    /// Log and move on without committing the offset.
    Skip,
}

impl FromStr for WritePolicy {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry" => Ok(WritePolicy::Retry),
            "skip" => Ok(WritePolicy::Skip),
            other => Err(AuditError::Config(format!(
                "STORE_WRITE_POLICY must be 'retry' or 'skip', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug)]
pub enum WriteOutcome {
    Written { attempts: u32 },
    /// Given up under [`WritePolicy::Skip`] or by an exhausted backoff.
    Skipped(AuditError),
    /// Shutdown arrived while waiting to retry.
    Abandoned(AuditError),
}

pub struct LedgerWriter<S: ?Sized> {
    store: Arc<S>,
    timeout: Duration,
    policy: WritePolicy,
    backoff: Arc<dyn BackoffPolicy>,
}

impl<S: ?Sized> Clone for LedgerWriter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            timeout: self.timeout,
            policy: self.policy,
            backoff: Arc::clone(&self.backoff),
        }
    }
}

impl<S: LedgerStore + ?Sized> LedgerWriter<S> {
    pub fn new(
        store: Arc<S>,
        timeout: Duration,
        policy: WritePolicy,
        backoff: Arc<dyn BackoffPolicy>,
    ) -> Self {
        Self {
            store,
            timeout,
            policy,
            backoff,
        }
    }

    /// Append `record`, applying the write policy on failure.
    ///
    /// The first attempt always runs, even when shutdown is already requested;
    /// only the waits between retries observe `shutdown`.
    pub async fn write(
        &self,
        record: &AuditRecord,
        shutdown: &mut watch::Receiver<bool>,
    ) -> WriteOutcome {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.append_once(record).await {
                Ok(()) => return WriteOutcome::Written { attempts: attempt },
                Err(e) => e,
            };

            if self.policy == WritePolicy::Skip {
                return WriteOutcome::Skipped(err);
            }

            let Some(delay) = self.backoff.next_delay(attempt) else {
                return WriteOutcome::Skipped(err);
            };

            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                table = %record.table_name,
                error = %err,
                "Ledger append failed, retrying"
            );

            if !sleep_unless_shutdown(delay, shutdown).await {
                return WriteOutcome::Abandoned(err);
            }
        }
    }

    async fn append_once(&self, record: &AuditRecord) -> Result<()> {
        match with_timeout(self.timeout, self.store.append(record)).await {
            Ok(()) => {
                debug!(table = %record.table_name, op = record.operation.code(), "Ledger append ok");
                Ok(())
            }
            Err(TimeoutError::Elapsed(d)) => Err(AuditError::StoreWrite(format!(
                "append timed out after {:?}",
                d
            ))),
            Err(TimeoutError::Failed(AuditError::StoreWrite(msg))) => {
                Err(AuditError::StoreWrite(msg))
            }
            Err(TimeoutError::Failed(e)) => Err(AuditError::StoreWrite(e.to_string())),
        }
    }
}

use resilience::{sleep_unless_shutdown, with_retry_until_shutdown, BackoffPolicy, RetryError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::broker::{BrokerConnection, BrokerConnector, GroupConsumer};
use super::session::{ConsumerGroupSession, SessionExit};
use crate::error::{AuditError, Result};
use crate::services::ledger::{LedgerConnector, LedgerStore, LedgerWriter, WritePolicy};

/// How appends are bounded and retried.
#[derive(Clone)]
pub struct WriteSettings {
    pub timeout: Duration,
    pub policy: WritePolicy,
    pub backoff: Arc<dyn BackoffPolicy>,
}

/// Owns the broker and store connections and keeps sessions running until shutdown.
pub struct ConnectionSupervisor<B, L> {
    broker: B,
    ledger: L,
    retry: Arc<dyn BackoffPolicy>,
    write: WriteSettings,
    shutdown: watch::Receiver<bool>,
}

impl<B, L> ConnectionSupervisor<B, L>
where
    B: BrokerConnector,
    L: LedgerConnector,
{
    pub fn new(
        broker: B,
        ledger: L,
        retry: Arc<dyn BackoffPolicy>,
        write: WriteSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            broker,
            ledger,
            retry,
            write,
            shutdown,
        }
    }

    /// Run until shutdown. Connection and session failures are retried under
    /// the retry policy; an error is returned only if that policy gives up.
    pub async fn run(mut self) -> Result<()> {
        let Some(store) = self.connect_ledger().await? else {
            info!("Shutdown requested before the ledger was ready");
            return Ok(());
        };
        let writer = LedgerWriter::new(
            Arc::new(store),
            self.write.timeout,
            self.write.policy,
            Arc::clone(&self.write.backoff),
        );

        let mut failures = 0;
        loop {
            let Some(connection) = self.connect_broker().await? else {
                info!("Shutdown requested before the broker was ready");
                return Ok(());
            };
            let consumer = Arc::clone(&connection.consumer);

            let (exit, rebalances) = self.run_sessions(connection, &writer).await;
            consumer.close().await;
            if rebalances > 0 {
                failures = 0;
            }

            match exit {
                SessionExit::Shutdown | SessionExit::Rebalanced => {
                    info!("Consumer stopped");
                    return Ok(());
                }
                SessionExit::Failed(e) => {
                    failures += 1;
                    let Some(delay) = self.retry.next_delay(failures) else {
                        error!(failures, error = %e, "Giving up after repeated session failures");
                        return Err(e);
                    };
                    error!(
                        failures,
                        delay_secs = delay.as_secs_f64(),
                        error = %e,
                        "Consumer session failed, reconnecting"
                    );
                    if !sleep_unless_shutdown(delay, &mut self.shutdown).await {
                        info!("Consumer stopped");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Sessions follow each other on one connection until one does not end in
    /// a rebalance. Returns that exit and how many rebalances preceded it.
    async fn run_sessions<S>(
        &self,
        connection: BrokerConnection<B::Consumer>,
        writer: &LedgerWriter<S>,
    ) -> (SessionExit, u32)
    where
        S: LedgerStore + ?Sized + 'static,
    {
        let BrokerConnection {
            consumer,
            mut events,
        } = connection;

        let mut rebalances = 0;
        loop {
            let session = ConsumerGroupSession::new(
                Arc::clone(&consumer),
                writer.clone(),
                self.shutdown.clone(),
            );
            match session.run(&mut events).await {
                SessionExit::Rebalanced => {
                    rebalances += 1;
                    info!(rebalances, "Rebalance complete, rejoining");
                }
                other => return (other, rebalances),
            }
        }
    }

    async fn connect_ledger(&mut self) -> Result<Option<L::Store>> {
        let ledger = &self.ledger;
        let result = with_retry_until_shutdown(
            self.retry.as_ref(),
            &mut self.shutdown,
            |attempt| async move {
                let store = ledger.connect().await?;
                store.ensure_schema().await?;
                info!(attempt, "Audit ledger ready");
                Ok::<_, AuditError>(store)
            },
        )
        .await;

        settle(result)
    }

    async fn connect_broker(&mut self) -> Result<Option<BrokerConnection<B::Consumer>>> {
        let broker = &self.broker;
        let result = with_retry_until_shutdown(
            self.retry.as_ref(),
            &mut self.shutdown,
            |attempt| async move {
                let connection = broker.connect().await?;
                info!(attempt, "Broker connection established");
                Ok::<_, AuditError>(connection)
            },
        )
        .await;

        settle(result)
    }
}

fn settle<T>(result: std::result::Result<T, RetryError<AuditError>>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(RetryError::Cancelled { attempts }) => {
            warn!(attempts, "Connection attempts cancelled by shutdown");
            Ok(None)
        }
        Err(RetryError::Exhausted { attempts, last }) => {
            error!(attempts, error = %last, "Connection attempts exhausted");
            Err(last)
        }
    }
}

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::broker::{GroupConsumer, GroupEvent, GroupEvents, PartitionClaim};
use super::processor::{ClaimSummary, PartitionClaimProcessor};
use crate::error::{AuditError, Result};
use crate::services::ledger::{LedgerStore, LedgerWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Joining,
    Assigned,
    Draining,
    Closed,
}

#[derive(Debug)]
pub enum SessionExit {
    /// The assignment was revoked or replaced; a new session can start on the
    /// same connection.
    Rebalanced,
    Shutdown,
    Failed(AuditError),
}

/// Lifecycle callbacks driven by group membership changes.
#[async_trait]
pub trait SessionHandler: Send {
    /// A generation has been assigned, before any claim is handed over.
    async fn on_session_start(&mut self, generation: u64) -> Result<()>;

    /// Take ownership of one partition claim for the current generation.
    fn on_partition_claim(&mut self, claim: PartitionClaim);

    /// Stop all claims and wait for them to finish.
    async fn on_session_end(&mut self) -> Vec<ClaimSummary>;
}

/// One generation of group membership, from join to all processors stopped.
pub struct ConsumerGroupSession<C: ?Sized, S: ?Sized> {
    consumer: Arc<C>,
    writer: LedgerWriter<S>,
    shutdown: watch::Receiver<bool>,
    state: SessionState,
    generation: Option<u64>,
    drain_tx: watch::Sender<bool>,
    processors: JoinSet<ClaimSummary>,
}

impl<C, S> ConsumerGroupSession<C, S>
where
    C: GroupConsumer + ?Sized + 'static,
    S: LedgerStore + ?Sized + 'static,
{
    pub fn new(consumer: Arc<C>, writer: LedgerWriter<S>, shutdown: watch::Receiver<bool>) -> Self {
        let (drain_tx, _) = watch::channel(false);
        Self {
            consumer,
            writer,
            shutdown,
            state: SessionState::Joining,
            generation: None,
            drain_tx,
            processors: JoinSet::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    /// Drive the session until it is revoked, shut down, or fails.
    pub async fn run(mut self, events: &mut GroupEvents) -> SessionExit {
        let (exit, drained) = loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.wait_for(|stop| *stop) => break (SessionExit::Shutdown, None),
                event = events.next() => event,
            };

            match event {
                None => {
                    break (
                        SessionExit::Failed(AuditError::Connection(
                            "group event stream closed".to_string(),
                        )),
                        None,
                    )
                }
                Some(GroupEvent::Failed(e)) => break (SessionExit::Failed(e), None),
                Some(GroupEvent::Revoked {
                    generation,
                    drained,
                }) => {
                    if self.generation == Some(generation) {
                        info!(generation, "Assignment revoked");
                        break (SessionExit::Rebalanced, drained);
                    }
                    debug!(generation, current = ?self.generation, "Ignoring stale revoke");
                    if let Some(ack) = drained {
                        ack.complete(Vec::new());
                    }
                }
                Some(GroupEvent::Assigned(assignment)) => {
                    if self.state == SessionState::Assigned {
                        // Replaced without a revoke; the next session takes it.
                        events.push_back(GroupEvent::Assigned(assignment));
                        break (SessionExit::Rebalanced, None);
                    }

                    if let Err(e) = self.on_session_start(assignment.generation).await {
                        break (SessionExit::Failed(e), None);
                    }
                    for claim in assignment.claims {
                        self.on_partition_claim(claim);
                    }
                }
            }
        };

        let summaries = self.on_session_end().await;
        info!(
            generation = ?self.generation,
            claims = summaries.len(),
            written = summaries.iter().map(|s| s.written).sum::<u64>(),
            exit = ?exit,
            "Session closed"
        );
        if let Some(ack) = drained {
            ack.complete(summaries);
        }
        exit
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, generation = ?self.generation, "Session state");
        self.state = next;
    }
}

#[async_trait]
impl<C, S> SessionHandler for ConsumerGroupSession<C, S>
where
    C: GroupConsumer + ?Sized + 'static,
    S: LedgerStore + ?Sized + 'static,
{
    async fn on_session_start(&mut self, generation: u64) -> Result<()> {
        if self.state != SessionState::Joining {
            return Err(AuditError::Connection(format!(
                "generation {} assigned while session is {:?}",
                generation, self.state
            )));
        }
        self.generation = Some(generation);
        self.transition(SessionState::Assigned);
        info!(generation, "Session assigned");
        Ok(())
    }

    fn on_partition_claim(&mut self, claim: PartitionClaim) {
        if self.generation != Some(claim.generation) {
            warn!(
                partition = claim.partition,
                claim_generation = claim.generation,
                current = ?self.generation,
                "Discarding claim from another generation"
            );
            return;
        }

        let processor = PartitionClaimProcessor::new(
            Arc::clone(&self.consumer),
            self.writer.clone(),
            claim,
            self.drain_tx.subscribe(),
        );
        self.processors.spawn(processor.run());
    }

    async fn on_session_end(&mut self) -> Vec<ClaimSummary> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }

        self.transition(SessionState::Draining);
        self.drain_tx.send_replace(true);

        let mut summaries = Vec::new();
        while let Some(joined) = self.processors.join_next().await {
            match joined {
                Ok(summary) => summaries.push(summary),
                Err(e) => error!(error = %e, "Partition processor panicked"),
            }
        }
        summaries.sort_by_key(|s| s.partition);

        self.transition(SessionState::Closed);
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ledger::{MockLedgerStore, WritePolicy};
    use resilience::FixedBackoff;
    use std::time::Duration;

    struct NoopConsumer;

    #[async_trait]
    impl GroupConsumer for NoopConsumer {
        fn commit(&self, _topic: &str, _partition: i32, _next_offset: i64) -> Result<()> {
            Ok(())
        }

        async fn close(&self) {}
    }

    fn session() -> (
        ConsumerGroupSession<NoopConsumer, MockLedgerStore>,
        watch::Sender<bool>,
    ) {
        let (tx, rx) = watch::channel(false);
        let writer = LedgerWriter::new(
            Arc::new(MockLedgerStore::new()),
            Duration::from_secs(1),
            WritePolicy::Retry,
            Arc::new(FixedBackoff::new(Duration::from_millis(1))),
        );
        (ConsumerGroupSession::new(Arc::new(NoopConsumer), writer, rx), tx)
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let (mut session, _tx) = session();
        assert_eq!(session.state(), SessionState::Joining);

        session.on_session_start(4).await.unwrap();
        assert_eq!(session.state(), SessionState::Assigned);
        assert_eq!(session.generation(), Some(4));

        let (_claim_tx, claim) = PartitionClaim::channel("t", 0, 4, 1);
        session.on_partition_claim(claim);

        let summaries = session.on_session_end().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].written, 0);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (mut session, _tx) = session();
        session.on_session_start(1).await.unwrap();

        assert!(session.on_session_start(2).await.is_err());
        assert_eq!(session.generation(), Some(1));
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let (mut session, _tx) = session();
        session.on_session_end().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.on_session_end().await.is_empty());
    }
}

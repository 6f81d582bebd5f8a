use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::broker::{GroupConsumer, InboundMessage, PartitionClaim};
use super::cursor::PartitionCursor;
use crate::services::cdc;
use crate::services::ledger::{LedgerStore, LedgerWriter, WriteOutcome};

/// Per-claim counters, logged when the claim ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimSummary {
    pub topic: String,
    pub partition: i32,
    pub written: u64,
    pub malformed: u64,
    pub skipped: u64,
    pub tombstones: u64,
    /// Delivered under another generation
    pub discarded: u64,
    /// Already behind the cursor
    pub duplicates: u64,
    pub last_committed: Option<i64>,
}

enum Step {
    Continue,
    Stop,
}

/// Drains one partition claim: transform, append, commit, in arrival order.
pub struct PartitionClaimProcessor<C: ?Sized, S: ?Sized> {
    consumer: Arc<C>,
    writer: LedgerWriter<S>,
    claim: PartitionClaim,
    cursor: PartitionCursor,
    stop: watch::Receiver<bool>,
    summary: ClaimSummary,
}

impl<C, S> PartitionClaimProcessor<C, S>
where
    C: GroupConsumer + ?Sized,
    S: LedgerStore + ?Sized,
{
    pub fn new(
        consumer: Arc<C>,
        writer: LedgerWriter<S>,
        claim: PartitionClaim,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let summary = ClaimSummary {
            topic: claim.topic.clone(),
            partition: claim.partition,
            ..Default::default()
        };
        Self {
            consumer,
            writer,
            claim,
            cursor: PartitionCursor::new(summary.partition),
            stop,
            summary,
        }
    }

    /// Run until the claim closes or `stop` flips. A message already taken off
    /// the claim is always carried through write and commit.
    pub async fn run(mut self) -> ClaimSummary {
        debug!(
            topic = %self.claim.topic,
            partition = self.claim.partition,
            generation = self.claim.generation,
            "Partition claim started"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = self.stop.wait_for(|stop| *stop) => None,
                message = self.claim.next() => message,
            };

            let Some(message) = next else {
                break;
            };

            if let Step::Stop = self.handle(message).await {
                break;
            }
        }

        self.summary.last_committed = self.cursor.next_offset();
        info!(
            topic = %self.claim.topic,
            partition = self.summary.partition,
            written = self.summary.written,
            malformed = self.summary.malformed,
            skipped = self.summary.skipped,
            tombstones = self.summary.tombstones,
            last_committed = ?self.summary.last_committed,
            "Partition claim finished"
        );
        self.summary
    }

    async fn handle(&mut self, message: InboundMessage) -> Step {
        if message.generation != self.claim.generation {
            self.summary.discarded += 1;
            debug!(
                partition = message.partition,
                offset = message.offset,
                message_generation = message.generation,
                claim_generation = self.claim.generation,
                "Discarding message from another generation"
            );
            return Step::Continue;
        }

        if !self.cursor.is_pending(message.offset) {
            self.summary.duplicates += 1;
            debug!(
                partition = message.partition,
                offset = message.offset,
                "Offset already committed, skipping redelivery"
            );
            return Step::Continue;
        }

        let Some(payload) = message.payload.as_deref() else {
            self.summary.tombstones += 1;
            debug!(partition = message.partition, offset = message.offset, "Tombstone");
            self.commit(message.offset);
            return Step::Continue;
        };

        let record = match cdc::transform(payload) {
            Ok(record) => record,
            Err(e) => {
                self.summary.malformed += 1;
                warn!(
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Skipping malformed change event"
                );
                self.commit(message.offset);
                return Step::Continue;
            }
        };

        match self.writer.write(&record, &mut self.stop).await {
            WriteOutcome::Written { attempts } => {
                self.summary.written += 1;
                debug!(
                    partition = message.partition,
                    offset = message.offset,
                    table = %record.table_name,
                    op = record.operation.code(),
                    attempts,
                    "Audit record appended"
                );
                self.commit(message.offset);
                Step::Continue
            }
            WriteOutcome::Skipped(e) => {
                self.summary.skipped += 1;
                error!(
                    partition = message.partition,
                    offset = message.offset,
                    table = %record.table_name,
                    error = %e,
                    "Audit record not written, offset left uncommitted"
                );
                Step::Continue
            }
            WriteOutcome::Abandoned(e) => {
                warn!(
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Stopping before the audit record was written"
                );
                Step::Stop
            }
        }
    }

    fn commit(&mut self, offset: i64) {
        let Some(next_offset) = self.cursor.advance(offset) else {
            return;
        };

        if let Err(e) = self
            .consumer
            .commit(&self.claim.topic, self.claim.partition, next_offset)
        {
            warn!(
                partition = self.claim.partition,
                next_offset,
                error = %e,
                "Offset commit failed"
            );
        }
    }
}

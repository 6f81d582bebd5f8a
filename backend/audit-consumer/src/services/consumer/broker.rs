//! Consumer group seam between the session machinery and a concrete broker client.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::processor::ClaimSummary;
use crate::error::{AuditError, Result};

/// A message detached from the broker client's buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Assignment epoch the message was delivered under
    pub generation: u64,
    /// `None` for tombstones
    pub payload: Option<Vec<u8>>,
}

pub type ClaimSender = mpsc::Sender<InboundMessage>;

/// One partition's message stream for one generation.
///
/// The stream ends when the broker side drops its [`ClaimSender`], which is
/// how a revoked partition is closed.
#[derive(Debug)]
pub struct PartitionClaim {
    pub topic: String,
    pub partition: i32,
    pub generation: u64,
    messages: mpsc::Receiver<InboundMessage>,
}

impl PartitionClaim {
    pub fn channel(
        topic: impl Into<String>,
        partition: i32,
        generation: u64,
        buffer: usize,
    ) -> (ClaimSender, PartitionClaim) {
        let (tx, rx) = mpsc::channel(buffer);
        let claim = PartitionClaim {
            topic: topic.into(),
            partition,
            generation,
            messages: rx,
        };
        (tx, claim)
    }

    /// Next message in arrival order; `None` once the claim is closed.
    pub async fn next(&mut self) -> Option<InboundMessage> {
        self.messages.recv().await
    }
}

#[derive(Debug)]
pub struct Assignment {
    pub generation: u64,
    pub claims: Vec<PartitionClaim>,
}

/// Completed by the session once every claim of a revoked generation has
/// stopped. The broker holds the partitions until then.
#[derive(Debug)]
pub struct RevokeAck(oneshot::Sender<Vec<ClaimSummary>>);

impl RevokeAck {
    pub fn channel() -> (RevokeAck, oneshot::Receiver<Vec<ClaimSummary>>) {
        let (tx, rx) = oneshot::channel();
        (RevokeAck(tx), rx)
    }

    /// Hand back the final claim summaries. A broker that stopped waiting is ignored.
    pub fn complete(self, summaries: Vec<ClaimSummary>) {
        let _ = self.0.send(summaries);
    }
}

#[derive(Debug)]
pub enum GroupEvent {
    Assigned(Assignment),
    Revoked {
        generation: u64,
        drained: Option<RevokeAck>,
    },
    /// The group membership is broken; the connection should be rebuilt.
    Failed(AuditError),
}

/// Membership notifications for one broker connection.
///
/// An event can be pushed back so the next session sees it first.
pub struct GroupEvents {
    rx: mpsc::UnboundedReceiver<GroupEvent>,
    pending: VecDeque<GroupEvent>,
}

impl GroupEvents {
    pub fn new(rx: mpsc::UnboundedReceiver<GroupEvent>) -> Self {
        Self {
            rx,
            pending: VecDeque::new(),
        }
    }

    pub async fn next(&mut self) -> Option<GroupEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        self.rx.recv().await
    }

    pub fn push_back(&mut self, event: GroupEvent) {
        self.pending.push_front(event);
    }
}

#[async_trait]
pub trait GroupConsumer: Send + Sync {
    /// Commit `next_offset` (the offset of the next message to read) for a partition.
    fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()>;

    /// Leave the group and release the connection.
    async fn close(&self);
}

pub struct BrokerConnection<C> {
    pub consumer: Arc<C>,
    pub events: GroupEvents,
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    type Consumer: GroupConsumer + 'static;

    async fn connect(&self) -> Result<BrokerConnection<Self::Consumer>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(offset: i64) -> InboundMessage {
        InboundMessage {
            topic: "event.public.payments".to_string(),
            partition: 0,
            offset,
            generation: 1,
            payload: Some(b"{}".to_vec()),
        }
    }

    #[tokio::test]
    async fn test_claim_closes_when_sender_dropped() {
        let (tx, mut claim) = PartitionClaim::channel("event.public.payments", 0, 1, 4);
        tx.send(message(10)).await.unwrap();
        drop(tx);

        assert_eq!(claim.next().await.map(|m| m.offset), Some(10));
        assert!(claim.next().await.is_none());
    }

    #[tokio::test]
    async fn test_pushed_back_event_is_returned_first() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut events = GroupEvents::new(rx);
        tx.send(GroupEvent::Revoked {
            generation: 2,
            drained: None,
        })
        .unwrap();
        events.push_back(GroupEvent::Revoked {
            generation: 1,
            drained: None,
        });

        assert!(matches!(
            events.next().await,
            Some(GroupEvent::Revoked { generation: 1, .. })
        ));
        assert!(matches!(
            events.next().await,
            Some(GroupEvent::Revoked { generation: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_dropped_ack_releases_waiter() {
        let (ack, drained) = RevokeAck::channel();
        drop(ack);
        assert!(drained.await.is_err());
    }
}

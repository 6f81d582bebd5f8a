//! Kafka consumer group backed by rdkafka.
//!
//! A single dispatcher task drives the `StreamConsumer`. Rebalance callbacks
//! run inside its `recv()` and update the shared [`ClaimRouter`] directly, so
//! group events reach the session before any message of the new assignment.
//! librdkafka does not expose the group generation id, so each assignment is
//! numbered with a local epoch.
//!
//! A revoke holds the callback until the session has drained every claim,
//! then commits the final cursors synchronously. Partitions are only released
//! to the group after that.

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use resilience::{sleep_unless_shutdown, with_timeout, BackoffPolicy, ExponentialBackoff};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::{
    Assignment, BrokerConnection, BrokerConnector, ClaimSender, GroupConsumer, GroupEvent,
    GroupEvents, InboundMessage, PartitionClaim, RevokeAck,
};
use super::processor::ClaimSummary;
use crate::config::KafkaConfig;
use crate::error::{AuditError, Result};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive receive errors tolerated before the membership is reported broken.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Claim bookkeeping shared by the rebalance callbacks and the dispatcher.
struct ClaimRouter {
    events: mpsc::UnboundedSender<GroupEvent>,
    claim_buffer: usize,
    generation: u64,
    claims: HashMap<(String, i32), ClaimSender>,
}

impl ClaimRouter {
    fn new(events: mpsc::UnboundedSender<GroupEvent>, claim_buffer: usize) -> Self {
        Self {
            events,
            claim_buffer,
            generation: 0,
            claims: HashMap::new(),
        }
    }

    /// Start a new generation with one fresh claim per partition.
    fn assign(&mut self, partitions: Vec<(String, i32)>) {
        self.generation += 1;
        self.claims.clear();

        let mut claims = Vec::with_capacity(partitions.len());
        for (topic, partition) in partitions {
            let (tx, claim) = PartitionClaim::channel(
                topic.clone(),
                partition,
                self.generation,
                self.claim_buffer,
            );
            self.claims.insert((topic, partition), tx);
            claims.push(claim);
        }

        let _ = self.events.send(GroupEvent::Assigned(Assignment {
            generation: self.generation,
            claims,
        }));
    }

    /// Close every claim and tell the session. `None` when no session is
    /// listening, so there is nothing to wait for.
    fn revoke(&mut self) -> Option<oneshot::Receiver<Vec<ClaimSummary>>> {
        self.claims.clear();

        let (ack, drained) = RevokeAck::channel();
        self.events
            .send(GroupEvent::Revoked {
                generation: self.generation,
                drained: Some(ack),
            })
            .ok()
            .map(|_| drained)
    }

    fn fail(&self, reason: String) {
        let _ = self
            .events
            .send(GroupEvent::Failed(AuditError::Connection(reason)));
    }

    /// Stamp `message` with the current generation and pick its claim.
    fn route(&self, mut message: InboundMessage) -> Option<(ClaimSender, InboundMessage)> {
        let key = (message.topic.clone(), message.partition);
        let Some(tx) = self.claims.get(&key) else {
            warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Message for a partition without a claim"
            );
            return None;
        };

        message.generation = self.generation;
        Some((tx.clone(), message))
    }

    /// Drop a claim whose receiver is gone, unless it was already replaced.
    fn release(&mut self, topic: &str, partition: i32, generation: u64) {
        if generation == self.generation {
            self.claims.remove(&(topic.to_string(), partition));
        }
    }

    fn clear(&mut self) {
        self.claims.clear();
    }
}

pub struct AuditConsumerContext {
    router: Arc<Mutex<ClaimRouter>>,
    drain_timeout: Duration,
}

impl ClientContext for AuditConsumerContext {}

impl ConsumerContext for AuditConsumerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        let Rebalance::Revoke(tpl) = rebalance else {
            return;
        };
        info!(partitions = tpl.count(), "Partitions revoked, draining claims");

        let Some(drained) = self.router.lock().revoke() else {
            return;
        };
        if let Some(summaries) = wait_for_drain(drained, self.drain_timeout) {
            commit_final_cursors(base_consumer, &summaries);
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let partitions = tpl
                    .elements()
                    .iter()
                    .map(|e| (e.topic().to_string(), e.partition()))
                    .collect::<Vec<_>>();
                info!(partitions = partitions.len(), "Partitions assigned");
                self.router.lock().assign(partitions);
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => {
                error!(error = %e, "Rebalance failed");
                self.router.lock().fail(e.to_string());
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(partitions = offsets.count(), "Offsets committed"),
            Err(e) => warn!(error = %e, "Offset commit rejected by broker"),
        }
    }
}

/// Block the rebalance callback until the session acknowledges the revoke.
///
/// The callback runs on a runtime worker inside `recv()`, so the wait moves
/// the worker's other tasks off it first.
fn wait_for_drain(
    drained: oneshot::Receiver<Vec<ClaimSummary>>,
    limit: Duration,
) -> Option<Vec<ClaimSummary>> {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("No runtime to wait on, releasing partitions without a drain");
        return None;
    };

    let outcome = tokio::task::block_in_place(|| runtime.block_on(with_timeout(limit, drained)));
    match outcome {
        Ok(summaries) => Some(summaries),
        Err(e) => {
            warn!(error = %e, "Revoke released before claims drained");
            None
        }
    }
}

/// Final cursors of a drained generation, in one offset list.
fn final_cursors(summaries: &[ClaimSummary]) -> KafkaResult<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    for summary in summaries {
        if let Some(next_offset) = summary.last_committed {
            tpl.add_partition_offset(
                &summary.topic,
                summary.partition,
                Offset::Offset(next_offset),
            )?;
        }
    }
    Ok(tpl)
}

fn commit_final_cursors(
    consumer: &BaseConsumer<AuditConsumerContext>,
    summaries: &[ClaimSummary],
) {
    let result = final_cursors(summaries).and_then(|tpl| {
        if tpl.count() == 0 {
            return Ok(0);
        }
        consumer.commit(&tpl, CommitMode::Sync).map(|_| tpl.count())
    });
    match result {
        Ok(partitions) => debug!(partitions, "Final cursors committed before release"),
        Err(e) => warn!(error = %e, "Final cursor commit failed"),
    }
}

type AuditStreamConsumer = StreamConsumer<AuditConsumerContext>;

pub struct KafkaConnector {
    config: KafkaConfig,
}

impl KafkaConnector {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }

    fn client_config(&self) -> ClientConfig {
        let mut client = ClientConfig::new();
        client
            .set("group.id", &self.config.group_id)
            .set("bootstrap.servers", &self.config.brokers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", self.config.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .set("enable.partition.eof", "false");
        client
    }
}

#[async_trait]
impl BrokerConnector for KafkaConnector {
    type Consumer = KafkaGroupConsumer;

    async fn connect(&self) -> Result<BrokerConnection<KafkaGroupConsumer>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let router = Arc::new(Mutex::new(ClaimRouter::new(
            events_tx,
            self.config.claim_buffer,
        )));

        let context = AuditConsumerContext {
            router: Arc::clone(&router),
            drain_timeout: self.config.drain_timeout,
        };
        let consumer: AuditStreamConsumer = self
            .client_config()
            .create_with_context(context)
            .map_err(|e| {
                AuditError::Connection(format!("Failed to create Kafka consumer: {}", e))
            })?;
        let consumer = Arc::new(consumer);

        // Client creation never touches the network; metadata proves the brokers answer.
        let probe = Arc::clone(&consumer);
        let brokers = tokio::task::spawn_blocking(move || {
            probe
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| AuditError::Connection(format!("metadata probe aborted: {}", e)))?
        .map_err(|e| {
            AuditError::Connection(format!(
                "Kafka brokers {} unreachable: {}",
                self.config.brokers, e
            ))
        })?;
        debug!(brokers, "Kafka metadata fetched");

        let topics: Vec<&str> = self.config.topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;
        info!(
            topics = ?self.config.topics,
            group_id = %self.config.group_id,
            "Subscribed to Kafka topics"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let dispatcher = Dispatcher {
            consumer: Arc::clone(&consumer),
            router,
        };
        let handle = tokio::spawn(dispatcher.run(stop_rx));

        Ok(BrokerConnection {
            consumer: Arc::new(KafkaGroupConsumer {
                consumer,
                stop: stop_tx,
                dispatcher: tokio::sync::Mutex::new(Some(handle)),
            }),
            events: GroupEvents::new(events_rx),
        })
    }
}

pub struct KafkaGroupConsumer {
    consumer: Arc<AuditStreamConsumer>,
    stop: watch::Sender<bool>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl GroupConsumer for KafkaGroupConsumer {
    fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(next_offset))
            .map_err(|e| AuditError::Commit(e.to_string()))?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| AuditError::Commit(e.to_string()))
    }

    async fn close(&self) {
        self.stop.send_replace(true);
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Kafka dispatcher task failed");
            }
        }
        self.consumer.unsubscribe();
        info!("Kafka consumer closed");
    }
}

/// Tracks consecutive receive errors and how long to back off after each.
struct ConsumerErrorState {
    consecutive: u32,
    backoff: ExponentialBackoff,
}

impl ConsumerErrorState {
    fn new() -> Self {
        Self {
            consecutive: 0,
            backoff: ExponentialBackoff {
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(30),
                multiplier: 2.0,
                jitter: true,
                max_attempts: Some(MAX_CONSECUTIVE_ERRORS),
            },
        }
    }

    fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// `None` once the error budget is spent.
    fn record_error(&mut self) -> Option<Duration> {
        self.consecutive += 1;
        self.backoff.next_delay(self.consecutive)
    }
}

struct Dispatcher {
    consumer: Arc<AuditStreamConsumer>,
    router: Arc<Mutex<ClaimRouter>>,
}

impl Dispatcher {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut errors = ConsumerErrorState::new();

        loop {
            let received = tokio::select! {
                biased;
                _ = stop.wait_for(|stop| *stop) => break,
                received = self.consumer.recv() => received.map(|m| InboundMessage {
                    topic: m.topic().to_string(),
                    partition: m.partition(),
                    offset: m.offset(),
                    generation: 0,
                    payload: m.payload().map(<[u8]>::to_vec),
                }),
            };

            match received {
                Ok(message) => {
                    errors.record_success();
                    self.forward(message).await;
                }
                Err(e) => match errors.record_error() {
                    Some(delay) => {
                        warn!(
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "Kafka receive error"
                        );
                        if !sleep_unless_shutdown(delay, &mut stop).await {
                            break;
                        }
                    }
                    None => {
                        error!(error = %e, "Too many consecutive Kafka errors");
                        self.router.lock().fail(e.to_string());
                        break;
                    }
                },
            }
        }

        self.router.lock().clear();
        debug!("Kafka dispatcher stopped");
    }

    /// Send a message to its claim, waiting while the claim's buffer is full.
    async fn forward(&self, message: InboundMessage) {
        let routed = self.router.lock().route(message);
        let Some((tx, message)) = routed else {
            return;
        };

        let (topic, partition, generation) =
            (message.topic.clone(), message.partition, message.generation);
        if tx.send(message).await.is_err() {
            debug!(partition, "Claim closed, dropping its sender");
            self.router.lock().release(&topic, partition, generation);
        }
    }
}

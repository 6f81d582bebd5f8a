//! In-memory broker and ledger used by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use audit_consumer::error::{AuditError, Result};
use audit_consumer::services::cdc::AuditRecord;
use audit_consumer::services::consumer::{
    BrokerConnection, BrokerConnector, GroupConsumer, GroupEvent, GroupEvents, InboundMessage,
};
use audit_consumer::services::ledger::{LedgerConnector, LedgerStore, LedgerWriter, WritePolicy};
use resilience::FixedBackoff;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const TOPIC: &str = "event.public.payments";

/// Debezium insert envelope for a payments row.
pub fn change_event(id: i64) -> Vec<u8> {
    format!(
        r#"{{"op":"c","after":{{"id":{}}},"source":{{"connector":"postgresql","db":"payments","schema":"public","table":"payments"}},"ts_ms":1700000000000}}"#,
        id
    )
    .into_bytes()
}

pub fn message(
    partition: i32,
    offset: i64,
    generation: u64,
    payload: Option<Vec<u8>>,
) -> InboundMessage {
    InboundMessage {
        topic: TOPIC.to_string(),
        partition,
        offset,
        generation,
        payload,
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ==================== Broker ====================

#[derive(Default)]
pub struct FakeGroupConsumer {
    commits: Mutex<Vec<(String, i32, i64)>>,
    closed: AtomicBool,
}

impl FakeGroupConsumer {
    pub fn commits(&self) -> Vec<(String, i32, i64)> {
        self.commits.lock().unwrap().clone()
    }

    /// Committed next-offsets for one partition, in commit order.
    pub fn committed(&self, partition: i32) -> Vec<i64> {
        self.commits()
            .into_iter()
            .filter(|(_, p, _)| *p == partition)
            .map(|(_, _, offset)| offset)
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GroupConsumer for FakeGroupConsumer {
    fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()> {
        self.commits
            .lock()
            .unwrap()
            .push((topic.to_string(), partition, next_offset));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct BrokerState {
    fail_first: u32,
    attempts: AtomicU32,
    connections: Mutex<VecDeque<(Arc<FakeGroupConsumer>, GroupEvents)>>,
}

/// Hands out scripted connections after `fail_first` refused attempts.
#[derive(Clone)]
pub struct FakeBroker {
    state: Arc<BrokerState>,
}

impl FakeBroker {
    pub fn new(fail_first: u32) -> Self {
        Self {
            state: Arc::new(BrokerState {
                fail_first,
                attempts: AtomicU32::new(0),
                connections: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Queue the connection returned by the next successful connect.
    pub fn add_connection(&self) -> (Arc<FakeGroupConsumer>, mpsc::UnboundedSender<GroupEvent>) {
        let consumer = Arc::new(FakeGroupConsumer::default());
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .connections
            .lock()
            .unwrap()
            .push_back((Arc::clone(&consumer), GroupEvents::new(rx)));
        (consumer, tx)
    }

    pub fn attempts(&self) -> u32 {
        self.state.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnector for FakeBroker {
    type Consumer = FakeGroupConsumer;

    async fn connect(&self) -> Result<BrokerConnection<FakeGroupConsumer>> {
        let attempt = self.state.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.state.fail_first {
            return Err(AuditError::Connection("broker refused connection".into()));
        }

        let next = self.state.connections.lock().unwrap().pop_front();
        match next {
            Some((consumer, events)) => Ok(BrokerConnection { consumer, events }),
            None => Err(AuditError::Connection("no broker available".into())),
        }
    }
}

// ==================== Ledger ====================

#[derive(Default)]
struct LedgerState {
    records: Mutex<Vec<AuditRecord>>,
    failing_appends: AtomicU32,
    appends_started: AtomicU32,
    append_delay: Mutex<Duration>,
    failing_connects: AtomicU32,
    connects: AtomicU32,
    schema_checks: AtomicU32,
}

/// Ledger that keeps appended records in memory. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    state: Arc<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_appends(&self, n: u32) {
        self.state.failing_appends.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.state.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn set_append_delay(&self, delay: Duration) {
        *self.state.append_delay.lock().unwrap() = delay;
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.state.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.state.records.lock().unwrap().len()
    }

    pub fn appends_started(&self) -> u32 {
        self.state.appends_started.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn schema_checks(&self) -> u32 {
        self.state.schema_checks.load(Ordering::SeqCst)
    }

    /// Ids from the `after` image of every record, in append order.
    pub fn ids(&self) -> Vec<i64> {
        self.records()
            .iter()
            .map(|r| {
                let payload: serde_json::Value = serde_json::from_str(&r.payload).unwrap();
                payload["after"]["id"].as_i64().unwrap()
            })
            .collect()
    }

    pub fn writer(&self, policy: WritePolicy) -> LedgerWriter<MemoryLedger> {
        LedgerWriter::new(
            Arc::new(self.clone()),
            Duration::from_secs(1),
            policy,
            Arc::new(FixedBackoff::new(Duration::from_millis(5))),
        )
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn ensure_schema(&self) -> Result<()> {
        self.state.schema_checks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn append(&self, record: &AuditRecord) -> Result<()> {
        self.state.appends_started.fetch_add(1, Ordering::SeqCst);

        let delay = *self.state.append_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if take_one(&self.state.failing_appends) {
            return Err(AuditError::StoreWrite("ledger temporarily unavailable".into()));
        }

        self.state.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl LedgerConnector for MemoryLedger {
    type Store = MemoryLedger;

    async fn connect(&self) -> Result<MemoryLedger> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.state.failing_connects) {
            return Err(AuditError::Connection("ledger refused connection".into()));
        }
        Ok(self.clone())
    }
}

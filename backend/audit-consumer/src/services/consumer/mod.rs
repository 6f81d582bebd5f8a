//! Consumer group pipeline: supervisor, sessions and per-partition processors.

pub mod broker;
pub mod cursor;
pub mod kafka;
pub mod processor;
pub mod session;
pub mod supervisor;

pub use broker::{
    Assignment, BrokerConnection, BrokerConnector, ClaimSender, GroupConsumer, GroupEvent,
    GroupEvents, InboundMessage, PartitionClaim, RevokeAck,
};
pub use cursor::PartitionCursor;
pub use kafka::{KafkaConnector, KafkaGroupConsumer};
pub use processor::{ClaimSummary, PartitionClaimProcessor};
pub use session::{ConsumerGroupSession, SessionExit, SessionHandler, SessionState};
pub use supervisor::{ConnectionSupervisor, WriteSettings};

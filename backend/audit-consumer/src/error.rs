use thiserror::Error;

pub type Result<T> = std::result::Result<T, AuditError>;

#[derive(Debug, Error)]
pub enum AuditError {
    /// Broker or store unreachable. Retried by the supervisor, never fatal.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Message bytes could not be decoded into a change event.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Store write error: {0}")]
    StoreWrite(String),

    #[error("Offset commit error: {0}")]
    Commit(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        AuditError::MalformedEvent(err.to_string())
    }
}

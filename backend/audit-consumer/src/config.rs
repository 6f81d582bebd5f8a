use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AuditError, Result};
use crate::services::ledger::WritePolicy;

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub topics: Vec<String>,
    pub group_id: String,
    pub session_timeout_ms: u32,
    /// Messages buffered per partition claim before the dispatcher waits.
    pub claim_buffer: usize,
    /// How long a revoke waits for in-flight writes before partitions are released.
    pub drain_timeout: Duration,
}

#[derive(Clone)]
pub struct LedgerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    /// Database the admin connection opens to create `database`.
    pub system_database: String,
    pub max_connections: u32,
}

impl fmt::Debug for LedgerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .field("system_database", &self.system_database)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(AuditError::Config(format!(
                "LOG_FORMAT must be 'text' or 'json', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub kafka: KafkaConfig,
    pub ledger: LedgerConfig,
    pub write_timeout: Duration,
    pub write_policy: WritePolicy,
    /// Fixed delay between connection attempts and after a failed session.
    pub retry_delay: Duration,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup, so tests need not
    /// touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| -> String {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let topics = parse_list(&get("KAFKA_TOPIC", "event.public.payments"));
        if topics.is_empty() {
            return Err(AuditError::Config(
                "KAFKA_TOPIC must name at least one topic".into(),
            ));
        }

        let claim_buffer: usize =
            parse_number("KAFKA_CLAIM_BUFFER", &get("KAFKA_CLAIM_BUFFER", "1000"))?;
        if claim_buffer == 0 {
            return Err(AuditError::Config(
                "KAFKA_CLAIM_BUFFER must be greater than zero".into(),
            ));
        }

        let drain_timeout_secs: u64 = parse_number(
            "KAFKA_REBALANCE_DRAIN_TIMEOUT_SECS",
            &get("KAFKA_REBALANCE_DRAIN_TIMEOUT_SECS", "60"),
        )?;

        let kafka = KafkaConfig {
            brokers: get("KAFKA_BROKERS", "localhost:9092"),
            topics,
            group_id: get("KAFKA_CONSUMER_GROUP", "audit-consumer-group"),
            session_timeout_ms: parse_number(
                "KAFKA_SESSION_TIMEOUT_MS",
                &get("KAFKA_SESSION_TIMEOUT_MS", "30000"),
            )?,
            claim_buffer,
            drain_timeout: Duration::from_secs(drain_timeout_secs),
        };

        let ledger = LedgerConfig {
            host: get("IMMUD_HOST", "localhost"),
            port: parse_number("IMMUD_PORT", &get("IMMUD_PORT", "5432"))?,
            username: get("IMMUD_USER", "immudb"),
            password: get("IMMUD_PASSWORD", "immudb"),
            database: get("IMMUD_DB", "audit_db"),
            system_database: get("IMMUD_SYSTEM_DB", "defaultdb"),
            max_connections: parse_number(
                "IMMUD_MAX_CONNECTIONS",
                &get("IMMUD_MAX_CONNECTIONS", "10"),
            )?,
        };
        validate_identifier("IMMUD_DB", &ledger.database)?;

        let write_timeout_secs: u64 = parse_number(
            "STORE_WRITE_TIMEOUT_SECS",
            &get("STORE_WRITE_TIMEOUT_SECS", "10"),
        )?;
        let retry_delay_secs: u64 = parse_number(
            "SUPERVISOR_RETRY_DELAY_SECS",
            &get("SUPERVISOR_RETRY_DELAY_SECS", "5"),
        )?;

        Ok(Self {
            kafka,
            ledger,
            write_timeout: Duration::from_secs(write_timeout_secs),
            write_policy: get("STORE_WRITE_POLICY", "retry").parse()?,
            retry_delay: Duration::from_secs(retry_delay_secs),
            log_format: get("LOG_FORMAT", "text").parse()?,
        })
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn parse_number<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| AuditError::Config(format!("{} has invalid value '{}': {}", key, value, e)))
}

/// The namespace name is spliced into `CREATE DATABASE`, which cannot take a bind parameter.
fn validate_identifier(key: &str, value: &str) -> Result<()> {
    let valid = value
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AuditError::Config(format!(
            "{} must be a plain identifier, got '{}'",
            key, value
        )))
    }
}

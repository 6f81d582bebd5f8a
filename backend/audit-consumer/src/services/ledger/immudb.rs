use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

use super::{LedgerConnector, LedgerStore};
use crate::config::LedgerConfig;
use crate::error::{AuditError, Result};
use crate::services::cdc::AuditRecord;

const CREATE_AUDIT_TRAIL: &str = "CREATE TABLE IF NOT EXISTS audit_trail (\
    id INTEGER AUTO_INCREMENT, \
    connector VARCHAR, \
    application VARCHAR, \
    db_name VARCHAR, \
    db_schema VARCHAR, \
    db_table VARCHAR, \
    event_operation VARCHAR, \
    event_date TIMESTAMP, \
    event JSON, \
    PRIMARY KEY (id))";

const INSERT_AUDIT_RECORD: &str = "INSERT INTO audit_trail \
    (connector, application, db_name, db_schema, db_table, event_operation, event_date, event) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)";

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects to immudb through its PostgreSQL wire endpoint.
///
/// Connecting first creates the namespace from the system database, then opens
/// the pool against the namespace itself.
pub struct ImmudbConnector {
    config: LedgerConfig,
}

impl ImmudbConnector {
    pub fn new(config: LedgerConfig) -> Self {
        Self { config }
    }

    fn connect_options(&self, database: &str) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .username(&self.config.username)
            .password(&self.config.password)
            .database(database)
    }

    async fn create_namespace(&self) -> Result<()> {
        let admin = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(self.connect_options(&self.config.system_database))
            .await
            .map_err(|e| {
                AuditError::Connection(format!(
                    "immudb {}:{} unreachable: {}",
                    self.config.host, self.config.port, e
                ))
            })?;

        // Database name is validated as a plain identifier when config loads.
        let statement = format!("CREATE DATABASE IF NOT EXISTS {}", self.config.database);
        let created = sqlx::query(&statement)
            .execute(&admin)
            .await
            .map_err(|e| AuditError::Connection(format!("create database failed: {}", e)));

        admin.close().await;
        created.map(|_| ())
    }
}

#[async_trait]
impl LedgerConnector for ImmudbConnector {
    type Store = ImmudbLedger;

    async fn connect(&self) -> Result<ImmudbLedger> {
        self.create_namespace().await?;

        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(self.connect_options(&self.config.database))
            .await
            .map_err(|e| {
                AuditError::Connection(format!(
                    "immudb database {} unavailable: {}",
                    self.config.database, e
                ))
            })?;

        info!(
            host = %self.config.host,
            port = self.config.port,
            database = %self.config.database,
            "Connected to immudb"
        );

        Ok(ImmudbLedger { pool })
    }
}

pub struct ImmudbLedger {
    pool: PgPool,
}

#[async_trait]
impl LedgerStore for ImmudbLedger {
    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_AUDIT_TRAIL)
            .execute(&self.pool)
            .await
            .map_err(|e| AuditError::Connection(format!("create audit_trail failed: {}", e)))?;
        Ok(())
    }

    async fn append(&self, record: &AuditRecord) -> Result<()> {
        sqlx::query(INSERT_AUDIT_RECORD)
            .bind(record.connector.as_str())
            .bind(record.application.as_str())
            .bind(record.database_name.as_str())
            .bind(record.schema_name.as_str())
            .bind(record.table_name.as_str())
            .bind(record.operation.code())
            .bind(record.event_timestamp.naive_utc())
            .bind(record.payload.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| AuditError::StoreWrite(e.to_string()))?;
        Ok(())
    }
}

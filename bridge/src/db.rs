use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{Device, Measurement, MeasurementKind, ReadingFilter, SensorReading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Storage the bridge depends on. Readings are append-only.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn insert_readings(&self, batch: &[SensorReading]) -> Result<()>;

    async fn find_device(&self, device_id: &str) -> Result<Option<Device>>;

    async fn list_readings(&self, filter: &ReadingFilter) -> Result<Vec<SensorReading>>;

    /// Number of readings matching `filter`, ignoring limit and offset.
    async fn count_readings(&self, filter: &ReadingFilter) -> Result<u64>;
}

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_readings_inner(&self, batch: &[SensorReading]) -> Result<()> {
        let ids: Vec<Uuid> = batch.iter().map(|r| r.id).collect();
        let device_ids: Vec<&str> = batch.iter().map(|r| r.device_id.as_str()).collect();
        let timestamps: Vec<DateTime<Utc>> = batch.iter().map(|r| r.timestamp).collect();
        let sensors = batch
            .iter()
            .map(|r| serde_json::to_value(&r.sensors))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let query = r#"
            INSERT INTO sensor_readings (id, device_id, ts, sensors)
            SELECT * FROM UNNEST($1::uuid[], $2::text[], $3::timestamptz[], $4::jsonb[])
            ON CONFLICT (device_id, ts) DO NOTHING
            "#;

        sqlx::query(query)
            .bind(&ids)
            .bind(&device_ids)
            .bind(&timestamps)
            .bind(&sensors)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn insert_readings(&self, batch: &[SensorReading]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut attempts = 0;
        let max_attempts = 5;

        loop {
            attempts += 1;
            match self.insert_readings_inner(batch).await {
                Ok(()) => return Ok(()),
                Err(Error::Database(db_err))
                    if attempts < max_attempts && is_transient_error(&db_err) =>
                {
                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Database insert failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, max_attempts, wait_ms, db_err
                    );
                    DB_FAILURES_TOTAL.inc();
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                Err(e) => {
                    error!(
                        "Database insert failed permanently after {} attempts: {}",
                        attempts, e
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn find_device(&self, device_id: &str) -> Result<Option<Device>> {
        let device = sqlx::query_as::<_, Device>(
            "SELECT id, user_id, name, location, created_at, updated_at
             FROM devices
             WHERE id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(device)
    }

    async fn list_readings(&self, filter: &ReadingFilter) -> Result<Vec<SensorReading>> {
        let query = format!(
            "SELECT id, device_id, ts, sensors
             FROM sensor_readings
             {}
             ORDER BY ts DESC
             LIMIT {} OFFSET {}",
            where_clause(filter),
            filter.limit,
            filter.offset
        );

        let mut query_builder = sqlx::query_as::<_, ReadingRow>(&query).bind(&filter.user_id);
        if let Some(device_id) = &filter.device_id {
            query_builder = query_builder.bind(device_id);
        }
        if let Some(start) = &filter.start {
            query_builder = query_builder.bind(start);
        }
        if let Some(end) = &filter.end {
            query_builder = query_builder.bind(end);
        }

        let rows = query_builder.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(SensorReading::from).collect())
    }

    async fn count_readings(&self, filter: &ReadingFilter) -> Result<u64> {
        let query = format!("SELECT COUNT(*) FROM sensor_readings {}", where_clause(filter));

        let mut query_builder = sqlx::query_scalar::<_, i64>(&query).bind(&filter.user_id);
        if let Some(device_id) = &filter.device_id {
            query_builder = query_builder.bind(device_id);
        }
        if let Some(start) = &filter.start {
            query_builder = query_builder.bind(start);
        }
        if let Some(end) = &filter.end {
            query_builder = query_builder.bind(end);
        }

        let total = query_builder.fetch_one(&self.pool).await?;
        Ok(total.max(0) as u64)
    }
}

/// Builds the WHERE clause for `filter`. Parameters are numbered in bind
/// order: user, then device, start and end when present.
fn where_clause(filter: &ReadingFilter) -> String {
    let mut conditions =
        vec!["device_id IN (SELECT id FROM devices WHERE user_id = $1)".to_string()];
    let mut next_param = 2;

    if filter.device_id.is_some() {
        conditions.push(format!("device_id = ${}", next_param));
        next_param += 1;
    }
    if filter.start.is_some() {
        conditions.push(format!("ts >= ${}", next_param));
        next_param += 1;
    }
    if filter.end.is_some() {
        conditions.push(format!("ts <= ${}", next_param));
    }

    format!("WHERE {}", conditions.join(" AND "))
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    id: Uuid,
    device_id: String,
    ts: DateTime<Utc>,
    sensors: Json<BTreeMap<MeasurementKind, Measurement>>,
}

impl From<ReadingRow> for SensorReading {
    fn from(row: ReadingRow) -> Self {
        Self {
            id: row.id,
            device_id: row.device_id,
            timestamp: row.ts,
            sensors: row.sensors.0,
        }
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}

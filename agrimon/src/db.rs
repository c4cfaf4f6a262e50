use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{SensorReading, SensorStatus};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{error, info, warn};

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Archives a batch of readings. Inserts are idempotent on
/// `(sensor_id, ts)`, so retrying a partially applied batch is safe.
pub async fn insert_batch(pool: &PgPool, batch: &[SensorReading]) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }

    let mut attempts = 0;
    let max_attempts = 5;

    loop {
        attempts += 1;
        match insert_batch_inner(pool, batch).await {
            Ok(()) => return Ok(()),
            Err(Error::Database(db_err)) => {
                if attempts >= max_attempts || !is_transient_error(&db_err) {
                    error!(
                        "Archive insert failed permanently after {} attempts: {}",
                        attempts, db_err
                    );
                    return Err(Error::Database(db_err));
                }

                let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                warn!(
                    "Archive insert failed (attempt {}/{}), retrying in {}ms: {}",
                    attempts, max_attempts, wait_ms, db_err
                );
                DB_FAILURES_TOTAL.inc();
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }
            Err(e) => {
                error!("Archive insert failed with non-database error: {}", e);
                return Err(e);
            }
        }
    }
}

fn status_str(status: SensorStatus) -> &'static str {
    match status {
        SensorStatus::Active => "active",
        SensorStatus::Inactive => "inactive",
        SensorStatus::Maintenance => "maintenance",
    }
}

async fn insert_batch_inner(pool: &PgPool, batch: &[SensorReading]) -> Result<()> {
    let sensor_ids: Vec<&str> = batch.iter().map(|r| r.sensor_id.as_str()).collect();
    let timestamps: Vec<chrono::DateTime<chrono::Utc>> = batch.iter().map(|r| r.timestamp).collect();
    let types: Vec<&str> = batch.iter().map(|r| r.sensor_type.as_str()).collect();
    let values: Vec<f64> = batch.iter().map(|r| r.value).collect();
    let units: Vec<&str> = batch.iter().map(|r| r.unit.as_str()).collect();
    let statuses: Vec<&str> = batch.iter().map(|r| status_str(r.status)).collect();
    let batteries: Vec<f64> = batch.iter().map(|r| r.battery_level).collect();
    let received: Vec<chrono::DateTime<chrono::Utc>> = batch.iter().map(|r| r.received_at).collect();

    let query = r#"
        INSERT INTO sensor_readings
            (sensor_id, ts, sensor_type, value, unit, status, battery_level, received_at)
        SELECT * FROM UNNEST(
            $1::text[], $2::timestamptz[], $3::text[], $4::float8[],
            $5::text[], $6::text[], $7::float8[], $8::timestamptz[]
        )
        ON CONFLICT (sensor_id, ts) DO NOTHING
        "#;

    sqlx::query(query)
        .bind(&sensor_ids)
        .bind(&timestamps)
        .bind(&types)
        .bind(&values)
        .bind(&units)
        .bind(&statuses)
        .bind(&batteries)
        .bind(&received)
        .execute(pool)
        .await?;

    Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(is_transient_error(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient_error(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_status_names_match_api() {
        for status in [SensorStatus::Active, SensorStatus::Inactive, SensorStatus::Maintenance] {
            let api = serde_json::to_value(status).unwrap();
            assert_eq!(api, status_str(status));
        }
    }
}

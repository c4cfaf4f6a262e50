use crate::db::insert_batch;
use crate::metrics::{ARCHIVE_LATENCY_SECONDS, BATCH_SIZE};
use crate::model::SensorReading;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info};

/// Drains accepted readings into the archive, flushing by size or timeout.
pub async fn run_batcher(
    mut rx: mpsc::Receiver<SensorReading>,
    pool: PgPool,
    max_batch: usize,
    max_wait_ms: u64,
) {
    info!(
        "Starting archive batcher with max_batch={}, max_wait_ms={}",
        max_batch, max_wait_ms
    );

    let mut buffer: Vec<SensorReading> = Vec::with_capacity(max_batch);
    let mut ticker = interval(Duration::from_millis(max_wait_ms));

    loop {
        tokio::select! {
            reading = rx.recv() => {
                match reading {
                    Some(r) => {
                        buffer.push(r);
                        if buffer.len() >= max_batch {
                            flush_batch(&pool, &mut buffer).await;
                        }
                    }
                    None => {
                        info!("Archive channel closed, flushing remaining batch");
                        flush_batch(&pool, &mut buffer).await;
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_batch(&pool, &mut buffer).await;
                }
            }
        }
    }

    info!("Archive batcher stopped");
}

async fn flush_batch(pool: &PgPool, buffer: &mut Vec<SensorReading>) {
    let batch_len = buffer.len();
    if batch_len == 0 {
        return;
    }

    debug!("Archiving batch of {} readings", batch_len);
    BATCH_SIZE.set(batch_len as f64);
    let start = Instant::now();

    // insert_batch already retries transient failures; a batch that still
    // fails is dropped so the in-memory log keeps serving.
    match insert_batch(pool, buffer).await {
        Ok(()) => {
            let elapsed = start.elapsed().as_secs_f64();
            ARCHIVE_LATENCY_SECONDS.observe(elapsed);
            debug!("Batch archived in {:.3}s", elapsed);
        }
        Err(e) => {
            error!(
                "Failed to archive batch: {}. {} readings stay in memory only",
                e, batch_len
            );
        }
    }
    buffer.clear();
    BATCH_SIZE.set(0.0);
}

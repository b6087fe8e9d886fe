use crate::db::Repository;
use crate::metrics::{BATCH_SIZE, INGEST_LATENCY_SECONDS, READINGS_DROPPED_TOTAL};
use crate::model::SensorReading;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info};

pub async fn run_batcher(
    mut rx: mpsc::Receiver<SensorReading>,
    repo: Arc<dyn Repository>,
    max_batch: usize,
    max_wait_ms: u64,
) {
    info!(
        "Starting batcher with max_batch={}, max_wait_ms={}",
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
                            flush_batch(repo.as_ref(), &mut buffer).await;
                        }
                    }
                    None => {
                        info!("Channel closed, flushing remaining batch");
                        flush_batch(repo.as_ref(), &mut buffer).await;
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_batch(repo.as_ref(), &mut buffer).await;
                }
            }
        }
    }

    info!("Batcher stopped");
}

/// Writes the buffered readings and empties the buffer either way.
///
/// Transient database errors are retried inside the repository, so a failure
/// here is final and the batch is dropped.
async fn flush_batch(repo: &dyn Repository, buffer: &mut Vec<SensorReading>) {
    if buffer.is_empty() {
        return;
    }

    let batch_len = buffer.len();
    BATCH_SIZE.set(batch_len as f64);
    let start = Instant::now();

    match repo.insert_readings(buffer).await {
        Ok(()) => {
            let elapsed = start.elapsed().as_secs_f64();
            INGEST_LATENCY_SECONDS.observe(elapsed);
            debug!(readings = batch_len, "Batch stored in {:.3}s", elapsed);
        }
        Err(e) => {
            READINGS_DROPPED_TOTAL.inc_by(batch_len as f64);
            error!(readings = batch_len, "Dropping batch after storage failure: {}", e);
        }
    }

    buffer.clear();
    BATCH_SIZE.set(0.0);
}

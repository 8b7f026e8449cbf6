use crate::backend::{BackendError, TelemetryStore};
use crate::config::Config;
use sindri_console_core::telemetry::MetricRecord;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct MetricBufferConfig {
    pub flush_interval: Duration,
    pub batch_size: usize,
    pub queue_capacity: usize,
}

impl From<&Config> for MetricBufferConfig {
    fn from(config: &Config) -> Self {
        Self {
            flush_interval: config.metrics_flush_interval,
            batch_size: config.metrics_batch_size,
            queue_capacity: config.metrics_queue_capacity,
        }
    }
}

/// Producer side of the metric write buffer. Enqueueing never waits on storage.
#[derive(Clone)]
pub struct MetricBuffer {
    sender: mpsc::Sender<MetricRecord>,
}

impl MetricBuffer {
    pub fn enqueue(&self, record: MetricRecord) -> Result<(), BackendError> {
        self.sender.try_send(record).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => BackendError::BufferFull,
            mpsc::error::TrySendError::Closed(_) => BackendError::BufferClosed,
        })
    }
}

/// Starts the flusher. It writes whenever a full batch is pending, on every tick, and once more
/// with whatever is queued when shutdown is signalled.
pub fn spawn_metric_buffer(
    store: Arc<dyn TelemetryStore>,
    config: MetricBufferConfig,
    mut shutdown: watch::Receiver<bool>,
) -> (MetricBuffer, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(config.queue_capacity.max(1));
    let batch_size = config.batch_size.max(1);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut pending: Vec<MetricRecord> = Vec::with_capacity(batch_size);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    flush(store.as_ref(), &mut pending, batch_size).await;
                }
                maybe = rx.recv() => match maybe {
                    Some(record) => {
                        pending.push(record);
                        if pending.len() >= batch_size {
                            flush(store.as_ref(), &mut pending, batch_size).await;
                        }
                    }
                    None => {
                        flush(store.as_ref(), &mut pending, batch_size).await;
                        return;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        rx.close();
                        while let Some(record) = rx.recv().await {
                            pending.push(record);
                        }
                        flush(store.as_ref(), &mut pending, batch_size).await;
                        info!(event = "metric_buffer_stopped");
                        return;
                    }
                }
            }
        }
    });
    (MetricBuffer { sender: tx }, handle)
}

async fn flush(store: &dyn TelemetryStore, pending: &mut Vec<MetricRecord>, batch_size: usize) {
    if pending.is_empty() {
        return;
    }
    let drained: Vec<MetricRecord> = std::mem::take(pending);
    let mut drained = drained.into_iter().peekable();
    while drained.peek().is_some() {
        let batch: Vec<MetricRecord> = drained.by_ref().take(batch_size).collect();
        let size = batch.len();
        match store.insert_metrics(batch).await {
            Ok(written) => debug!(event = "metrics_flushed", count = written),
            Err(err) => warn!(event = "metrics_flush_failed", count = size, error = %err),
        }
    }
}

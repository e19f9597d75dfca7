//! Delivery of anomaly records to downstream consumers.
//!
//! The engine hands records to an [`Emitter`], which feeds one bounded queue
//! per sink. Each queue is drained by its own worker that retries a failing
//! delivery until it succeeds. A slow sink therefore only applies
//! backpressure to emission; baseline maintenance never waits on it.

pub mod jsonl;
pub mod memory;

use std::future::IntoFuture;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::SinkConfig;
use crate::detect::{AnomalyRecord, DetectError};

pub use self::jsonl::JsonLinesSink;
pub use self::memory::MemorySink;

#[async_trait]
pub trait AnomalySink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn deliver(&self, record: &AnomalyRecord) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

/// Producer half of one or more sink queues.
#[derive(Clone, Debug)]
pub struct Emitter {
    senders: Vec<mpsc::Sender<AnomalyRecord>>,
}

pub fn channel(capacity: usize) -> (Emitter, mpsc::Receiver<AnomalyRecord>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Emitter { senders: vec![tx] }, rx)
}

impl Emitter {
    /// Combine two emitters so every record goes to both sets of queues.
    pub fn join(mut self, other: Emitter) -> Emitter {
        self.senders.extend(other.senders);
        self
    }

    /// Queue `record` on every attached sink, waiting for space if needed.
    ///
    /// Fails only when a delivery worker has gone away; the record still
    /// reaches every queue that is alive.
    pub async fn emit(&self, record: AnomalyRecord) -> Result<(), DetectError> {
        let mut closed = false;
        for tx in &self.senders {
            if tx.send(record.clone()).await.is_err() {
                closed = true;
            }
        }
        if closed {
            return Err(DetectError::SinkClosed {
                anomaly_id: record.anomaly_id().to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Delivery worker
// ---------------------------------------------------------------------------

/// Capped exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(30),
        }
    }
}

impl From<&SinkConfig> for RetryPolicy {
    fn from(config: &SinkConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.retry_initial_ms),
            max: Duration::from_millis(config.retry_max_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based). Never exceeds `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self
            .initial
            .saturating_mul(2u32.saturating_pow(attempt.min(20)))
            .min(self.max);
        let jitter_ms = (base.as_millis() as u64) / 4;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (base + jitter).min(self.max)
    }
}

/// A running delivery worker.
///
/// Awaiting it waits for the queue to drain after every [`Emitter`] is
/// dropped. [`DeliveryWorker::shutdown`] bounds that wait.
pub struct DeliveryWorker {
    sink_name: String,
    handle: JoinHandle<()>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<AnomalyRecord>>>,
    in_flight: Arc<Mutex<Option<AnomalyRecord>>>,
}

impl DeliveryWorker {
    pub fn sink_name(&self) -> &str {
        &self.sink_name
    }

    /// Give the worker `grace` to finish the queue. If it is still retrying
    /// after that, stop it and log every undelivered record in full. The
    /// undelivered records are returned oldest first.
    pub async fn shutdown(mut self, grace: Duration) -> Vec<AnomalyRecord> {
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(())) => return Vec::new(),
            Ok(Err(e)) => warn!(sink = %self.sink_name, error = %e, "delivery worker failed"),
            Err(_) => {
                self.handle.abort();
                // Cancellation releases the queue lock.
                let _ = (&mut self.handle).await;
            }
        }

        let mut undelivered: Vec<AnomalyRecord> = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .into_iter()
            .collect();
        let mut rx = self.queue.lock().await;
        rx.close();
        while let Ok(record) = rx.try_recv() {
            undelivered.push(record);
        }

        for record in &undelivered {
            let payload = serde_json::to_string(record).unwrap_or_default();
            error!(
                sink = %self.sink_name,
                anomaly_id = %record.anomaly_id(),
                record = %payload,
                "anomaly not delivered before shutdown"
            );
        }
        undelivered
    }
}

impl IntoFuture for DeliveryWorker {
    type Output = Result<(), JoinError>;
    type IntoFuture = JoinHandle<()>;

    fn into_future(self) -> Self::IntoFuture {
        self.handle
    }
}

/// Drain `rx` into `sink` in order, retrying each record until delivered.
/// The worker exits once every [`Emitter`] feeding it is dropped.
pub fn spawn_delivery_worker(
    rx: mpsc::Receiver<AnomalyRecord>,
    sink: Arc<dyn AnomalySink>,
    policy: RetryPolicy,
) -> DeliveryWorker {
    let queue = Arc::new(tokio::sync::Mutex::new(rx));
    let in_flight = Arc::new(Mutex::new(None));
    let sink_name = sink.name().to_string();
    let handle = tokio::spawn(deliver_queue(
        Arc::clone(&queue),
        Arc::clone(&in_flight),
        sink,
        policy,
    ));
    DeliveryWorker {
        sink_name,
        handle,
        queue,
        in_flight,
    }
}

async fn deliver_queue(
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<AnomalyRecord>>>,
    in_flight: Arc<Mutex<Option<AnomalyRecord>>>,
    sink: Arc<dyn AnomalySink>,
    policy: RetryPolicy,
) {
    let mut rx = queue.lock().await;
    let mut delivered: u64 = 0;
    while let Some(record) = rx.recv().await {
        *in_flight.lock().unwrap_or_else(PoisonError::into_inner) = Some(record.clone());
        let mut attempt: u32 = 0;
        loop {
            match sink.deliver(&record).await {
                Ok(()) => break,
                Err(e) => {
                    let delay = policy.delay(attempt);
                    warn!(
                        sink = sink.name(),
                        anomaly_id = %record.anomaly_id(),
                        attempt = attempt + 1,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "anomaly delivery failed"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
        in_flight.lock().unwrap_or_else(PoisonError::into_inner).take();
        delivered += 1;
        debug!(sink = sink.name(), anomaly_id = %record.anomaly_id(), "anomaly delivered");
    }
    info!(sink = sink.name(), delivered, "delivery worker stopped");
}

/// Attach `sink` behind a fresh queue and return its emitter and worker.
pub fn attach(
    sink: Arc<dyn AnomalySink>,
    capacity: usize,
    policy: RetryPolicy,
) -> (Emitter, DeliveryWorker) {
    let (emitter, rx) = channel(capacity);
    let worker = spawn_delivery_worker(rx, sink, policy);
    (emitter, worker)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

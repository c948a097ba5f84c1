//! Client-side batching uploader.
//!
//! `publish` never blocks the caller: a record is either sampled out, dropped
//! because the bounded queue is full, or enqueued. A background worker drains
//! the queue on a fixed delay and uploads batches with bounded retries. A
//! batch that exhausts its retries is dropped and counted, never requeued.

use crate::config::UploaderConfig;
use crate::errors::UploadError;
use crate::metrics_defs::{
    UPLOADER_ATTEMPTS, UPLOADER_DROPPED, UPLOADER_FAILED, UPLOADER_FLUSH_DURATION,
    UPLOADER_QUEUE_SIZE, UPLOADER_SAMPLED_OUT, UPLOADER_SENT,
};
use crate::record::{CallRecord, UploadBatch, UploadItem};
use crate::{API_KEY_HEADER, BATCH_PATH, endpoint_url};
use async_trait::async_trait;
use serde::Serialize;
use shared::{counter, gauge, histogram};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use url::Url;

#[async_trait]
pub trait UploadClient: Send + Sync {
    async fn upload(&self, batch: &UploadBatch) -> Result<(), UploadError>;
}

/// Posts batches to the ingestion server's batch endpoint.
pub struct HttpUploadClient {
    client: reqwest::Client,
    url: Url,
    api_key: String,
}

impl HttpUploadClient {
    pub fn new(config: &UploaderConfig) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .build()?;

        Ok(HttpUploadClient {
            client,
            url: endpoint_url(&config.endpoint, BATCH_PATH)?,
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl UploadClient for HttpUploadClient {
    async fn upload(&self, batch: &UploadBatch) -> Result<(), UploadError> {
        let response = self
            .client
            .post(self.url.clone())
            .header(API_KEY_HEADER, &self.api_key)
            .json(batch)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(UploadError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Enqueued,
    SampledOut,
    Dropped,
}

/// Result of one flush pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    pub batches: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Point-in-time view of the uploader counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploaderStats {
    pub queue_size: usize,
    pub sampled_out_count: u64,
    pub dropped_count: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub upload_attempts: u64,
}

#[derive(Debug)]
enum Command {
    Flush(oneshot::Sender<FlushReport>),
    Shutdown(oneshot::Sender<FlushReport>),
}

#[derive(Default)]
struct Counters {
    sampled_out: AtomicU64,
    dropped: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    attempts: AtomicU64,
}

struct UploaderInner {
    config: UploaderConfig,
    sample_rate: f64,
    client: Arc<dyn UploadClient>,
    counters: Counters,
    queue_tx: mpsc::Sender<UploadItem>,
}

#[derive(Clone)]
pub struct AsyncUploader {
    inner: Arc<UploaderInner>,
    cmd_tx: mpsc::Sender<Command>,
}

impl AsyncUploader {
    /// Starts the flush worker on the current tokio runtime.
    pub fn start(config: UploaderConfig, client: Arc<dyn UploadClient>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (cmd_tx, cmd_rx) = mpsc::channel(8);

        let inner = Arc::new(UploaderInner {
            sample_rate: config.effective_sample_rate(),
            config,
            client,
            counters: Counters::default(),
            queue_tx,
        });

        let worker = FlushWorker {
            inner: inner.clone(),
            queue_rx,
        };
        tokio::spawn(worker.run(cmd_rx));

        AsyncUploader { inner, cmd_tx }
    }

    pub fn publish(&self, record: &CallRecord) -> PublishOutcome {
        let counters = &self.inner.counters;

        let draw: f64 = rand::random();
        if draw >= self.inner.sample_rate {
            counters.sampled_out.fetch_add(1, Ordering::Relaxed);
            counter!(UPLOADER_SAMPLED_OUT).increment(1);
            return PublishOutcome::SampledOut;
        }

        let item = UploadItem::project(record, self.inner.config.upload_content);
        match self.inner.queue_tx.try_send(item) {
            Ok(()) => PublishOutcome::Enqueued,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                counter!(UPLOADER_DROPPED).increment(1);
                PublishOutcome::Dropped
            }
        }
    }

    pub fn stats(&self) -> UploaderStats {
        let counters = &self.inner.counters;
        UploaderStats {
            queue_size: self.inner.queue_size(),
            sampled_out_count: counters.sampled_out.load(Ordering::Relaxed),
            dropped_count: counters.dropped.load(Ordering::Relaxed),
            success_count: counters.success.load(Ordering::Relaxed),
            failed_count: counters.failed.load(Ordering::Relaxed),
            upload_attempts: counters.attempts.load(Ordering::Relaxed),
        }
    }

    /// Runs a flush pass now instead of waiting for the next tick.
    pub async fn flush(&self) -> Result<FlushReport, UploadError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Flush(tx))
            .await
            .map_err(|_| UploadError::Closed)?;
        rx.await.map_err(|_| UploadError::Closed)
    }

    /// Flushes once more and stops the worker. Whatever is still queued
    /// afterwards is discarded.
    pub async fn shutdown(&self) -> Result<FlushReport, UploadError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown(tx))
            .await
            .map_err(|_| UploadError::Closed)?;
        rx.await.map_err(|_| UploadError::Closed)
    }
}

impl UploaderInner {
    fn queue_size(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    /// Returns true if any attempt succeeded.
    async fn upload_with_retry(&self, items: Vec<UploadItem>) -> bool {
        let size = items.len() as u64;
        let batch = UploadBatch {
            contract_version: self.config.contract_version.clone(),
            tenant_id: Some(self.config.tenant_id.clone()),
            app_id: Some(self.config.app_id.clone()),
            items,
        };

        let max_retry = self.config.max_retry;
        for attempt in 0..=max_retry {
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);
            counter!(UPLOADER_ATTEMPTS).increment(1);

            match self.client.upload(&batch).await {
                Ok(()) => {
                    self.counters.success.fetch_add(size, Ordering::Relaxed);
                    counter!(UPLOADER_SENT).increment(size);
                    return true;
                }
                Err(e) => {
                    tracing::warn!(attempt, max_retry, batch_size = size, error = %e, "Batch upload failed");
                    if attempt < max_retry {
                        let backoff = self.config.retry_backoff_ms
                            * 2_u64.saturating_pow(attempt.min(16));
                        sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }

        tracing::error!(batch_size = size, "Dropping batch after exhausting retries");
        self.counters.failed.fetch_add(size, Ordering::Relaxed);
        counter!(UPLOADER_FAILED).increment(size);
        false
    }
}

struct FlushWorker {
    inner: Arc<UploaderInner>,
    queue_rx: mpsc::Receiver<UploadItem>,
}

impl FlushWorker {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let interval = self.inner.config.flush_interval();

        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    self.flush().await;
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Flush(reply)) => {
                        let report = self.flush().await;
                        let _ = reply.send(report);
                    }
                    Some(Command::Shutdown(reply)) => {
                        let report = self.flush().await;
                        let _ = reply.send(report);
                        break;
                    }
                    None => {
                        self.flush().await;
                        break;
                    }
                }
            }
        }

        tracing::info!(
            remaining = self.queue_rx.len(),
            "Uploader stopped"
        );
    }

    async fn flush(&mut self) -> FlushReport {
        let started = Instant::now();
        let batch_size = self.inner.config.batch_size.max(1);
        let mut report = FlushReport::default();

        for _ in 0..self.inner.config.max_batches_per_flush.max(1) {
            let mut batch = Vec::with_capacity(batch_size);
            while batch.len() < batch_size {
                match self.queue_rx.try_recv() {
                    Ok(item) => batch.push(item),
                    Err(_) => break,
                }
            }

            if batch.is_empty() {
                break;
            }

            let size = batch.len();
            report.batches += 1;
            if self.inner.upload_with_retry(batch).await {
                report.sent += size;
            } else {
                report.failed += size;
            }
        }

        histogram!(UPLOADER_FLUSH_DURATION).record(started.elapsed().as_secs_f64());
        gauge!(UPLOADER_QUEUE_SIZE).set(self.queue_rx.len() as f64);
        report
    }
}

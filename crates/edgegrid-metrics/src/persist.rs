//! Batched sample persistence.
//!
//! A fixed pool of drain workers shares one bounded channel. A worker
//! waits for the first sample, then takes whatever else is already queued
//! up to `batch_size` and writes the batch in one transaction. Producers
//! block once the buffer is full; nothing is dropped here.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use edgegrid_state::{RawResourceData, RawResponseTime, SampleSink, StateError};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("persister is closed")]
    Closed,

    #[error(transparent)]
    State(#[from] StateError),

    #[error("persist task failed: {0}")]
    Task(String),
}

/// A row headed for the sample store.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Response(RawResponseTime),
    Resource(RawResourceData),
}

#[derive(Debug, Clone, Copy)]
pub struct PersistConfig {
    pub batch_size: usize,
    pub workers: usize,
    pub buffer: usize,
}

impl PersistConfig {
    pub fn from_config(config: &edgegrid_core::config::MetricsConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            workers: config.drain_workers,
            buffer: config.buffer,
        }
    }
}

/// Producer side of the persister.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::Sender<Sample>,
}

impl PersistHandle {
    /// Queue one sample, waiting for buffer space.
    pub async fn send(&self, sample: Sample) -> Result<(), PersistError> {
        self.tx.send(sample).await.map_err(|_| PersistError::Closed)
    }
}

/// The drain worker pool.
pub struct Persister {
    workers: Vec<JoinHandle<()>>,
    written: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl Persister {
    /// Start `config.workers` drain workers writing into `sink`.
    pub fn spawn(sink: Arc<dyn SampleSink>, config: PersistConfig) -> (PersistHandle, Self) {
        let (tx, rx) = mpsc::channel(config.buffer.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let written = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let batch_size = config.batch_size.max(1);

        let workers = (0..config.workers.max(1))
            .map(|id| {
                tokio::spawn(drain(
                    id,
                    rx.clone(),
                    sink.clone(),
                    batch_size,
                    written.clone(),
                    failed.clone(),
                ))
            })
            .collect::<Vec<_>>();
        info!(
            workers = workers.len(),
            batch_size,
            buffer = config.buffer,
            "sample persister started"
        );

        (
            PersistHandle { tx },
            Self {
                workers,
                written,
                failed,
            },
        )
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Wait for every worker to finish. Workers exit once all handles are
    /// dropped and the channel is drained. Returns the rows written.
    pub async fn join(self) -> u64 {
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "drain worker panicked");
            }
        }
        let written = self.written.load(Ordering::Relaxed);
        info!(written, failed = self.failed.load(Ordering::Relaxed), "sample persister stopped");
        written
    }
}

async fn drain(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Sample>>>,
    sink: Arc<dyn SampleSink>,
    batch_size: usize,
    written: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
) {
    loop {
        let mut batch = Vec::with_capacity(batch_size);
        {
            let mut rx = rx.lock().await;
            match rx.recv().await {
                Some(sample) => batch.push(sample),
                None => break,
            }
            while batch.len() < batch_size {
                match rx.try_recv() {
                    Ok(sample) => batch.push(sample),
                    Err(_) => break,
                }
            }
        }

        let size = batch.len() as u64;
        match flush(sink.clone(), batch).await {
            Ok(n) => {
                written.fetch_add(n as u64, Ordering::Relaxed);
                debug!(worker = id, rows = n, "sample batch persisted");
            }
            Err(e) => {
                failed.fetch_add(size, Ordering::Relaxed);
                warn!(worker = id, rows = size, error = %e, "sample batch failed");
            }
        }
    }
    debug!(worker = id, "drain worker exiting");
}

async fn flush(sink: Arc<dyn SampleSink>, batch: Vec<Sample>) -> Result<usize, PersistError> {
    tokio::task::spawn_blocking(move || {
        let mut responses = Vec::new();
        let mut resources = Vec::new();
        for sample in batch {
            match sample {
                Sample::Response(r) => responses.push(r),
                Sample::Resource(r) => resources.push(r),
            }
        }
        let n = sink.write_response_times(&responses)? + sink.write_resource_data(&resources)?;
        Ok::<_, PersistError>(n)
    })
    .await
    .map_err(|e| PersistError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgegrid_state::StateResult;
    use std::sync::Mutex as StdMutex;

    /// Records batch sizes instead of storing rows.
    #[derive(Default)]
    struct RecordingSink {
        batches: StdMutex<Vec<usize>>,
        fail: bool,
    }

    impl SampleSink for RecordingSink {
        fn write_response_times(&self, samples: &[RawResponseTime]) -> StateResult<usize> {
            if self.fail {
                return Err(StateError::Write("disk full".to_string()));
            }
            if !samples.is_empty() {
                self.batches.lock().unwrap().push(samples.len());
            }
            Ok(samples.len())
        }

        fn write_resource_data(&self, samples: &[RawResourceData]) -> StateResult<usize> {
            Ok(samples.len())
        }
    }

    fn response(i: u64) -> Sample {
        Sample::Response(RawResponseTime {
            timestamp_ms: i,
            source: "a".to_string(),
            destination: "b".to_string(),
            function: "f".to_string(),
            namespace: "ns".to_string(),
            community: "c".to_string(),
            gpu: false,
            latency_ms: 1.0,
            status: 200,
            description: String::new(),
        })
    }

    fn config(batch_size: usize, workers: usize) -> PersistConfig {
        PersistConfig {
            batch_size,
            workers,
            buffer: 512,
        }
    }

    #[tokio::test]
    async fn every_sample_is_written_in_bounded_batches() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, persister) = Persister::spawn(sink.clone(), config(100, 3));
        for i in 0..250 {
            handle.send(response(i)).await.unwrap();
        }
        drop(handle);

        assert_eq!(persister.join().await, 250);
        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.iter().sum::<usize>(), 250);
        assert!(batches.iter().all(|&n| n <= 100));
    }

    #[tokio::test]
    async fn resource_rows_reach_the_store() {
        let store = edgegrid_state::StateStore::open_in_memory().unwrap();
        let (handle, persister) = Persister::spawn(Arc::new(store.clone()), config(10, 1));
        handle
            .send(Sample::Resource(RawResourceData {
                timestamp_ms: 1,
                node: "a".to_string(),
                function: "f".to_string(),
                namespace: "ns".to_string(),
                community: "c".to_string(),
                cores: 0.5,
            }))
            .await
            .unwrap();
        handle.send(response(2)).await.unwrap();
        drop(handle);

        assert_eq!(persister.join().await, 2);
        assert_eq!(store.list_resource_data_since(0).unwrap().len(), 1);
        assert_eq!(store.list_response_times_since(0).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_batches_are_counted_not_retried() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let (handle, persister) = Persister::spawn(sink, config(5, 1));
        for i in 0..5 {
            handle.send(response(i)).await.unwrap();
        }
        drop(handle);

        let failed = persister.failed.clone();
        assert_eq!(persister.join().await, 0);
        assert_eq!(failed.load(Ordering::Relaxed), 5);
    }
}

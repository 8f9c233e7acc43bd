//! StateStore: redb-backed persistence for raw metric samples.
//!
//! Samples are append-only. Each batch is written in a single write
//! transaction; reads scan forward from a timestamp lower bound.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::{RawResourceData, RawResponseTime};

macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Destination for raw samples produced by the data plane.
pub trait SampleSink: Send + Sync {
    /// Persist a batch of response times. Returns the number written.
    fn write_response_times(&self, samples: &[RawResponseTime]) -> StateResult<usize>;

    /// Persist a batch of resource observations. Returns the number written.
    fn write_resource_data(&self, samples: &[RawResourceData]) -> StateResult<usize>;
}

/// Thread-safe sample store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    seq: Arc<AtomicU64>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "sample store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory sample store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(RESPONSE_TIMES).map_err(map_err!(Table))?;
        txn.open_table(RESOURCE_DATA).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        self.restore_seq()
    }

    /// Continue the sequence after the highest key already on disk.
    fn restore_seq(&self) -> StateResult<()> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let mut next = 0;
        for table in [RESPONSE_TIMES, RESOURCE_DATA] {
            let t = txn.open_table(table).map_err(map_err!(Table))?;
            for entry in t.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                if let Some(seq) = key
                    .value()
                    .rsplit_once(':')
                    .and_then(|(_, seq)| seq.parse::<u64>().ok())
                {
                    next = next.max(seq + 1);
                }
            }
        }
        self.seq.store(next, Ordering::Relaxed);
        Ok(())
    }

    fn append<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        samples: &[T],
        timestamp: impl Fn(&T) -> u64,
    ) -> StateResult<usize> {
        if samples.is_empty() {
            return Ok(0);
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            for sample in samples {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                let key = sample_key(timestamp(sample), seq);
                let value = serde_json::to_vec(sample).map_err(map_err!(Serialize))?;
                t.insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(samples.len())
    }

    fn scan_since<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        since_ms: u64,
    ) -> StateResult<Vec<T>> {
        let lower = sample_key(since_ms, 0);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.range(lower.as_str()..).map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let sample: T =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(sample);
        }
        Ok(results)
    }

    /// Response-time samples with `timestamp_ms >= since_ms`, oldest first.
    pub fn list_response_times_since(&self, since_ms: u64) -> StateResult<Vec<RawResponseTime>> {
        self.scan_since(RESPONSE_TIMES, since_ms)
    }

    /// Resource samples with `timestamp_ms >= since_ms`, oldest first.
    pub fn list_resource_data_since(&self, since_ms: u64) -> StateResult<Vec<RawResourceData>> {
        self.scan_since(RESOURCE_DATA, since_ms)
    }

    /// Requests per `(source node, function key)` since `since_ms`.
    ///
    /// The function key is `{namespace}/{function}`, matching how
    /// schedules name functions.
    pub fn count_requests_since(&self, since_ms: u64) -> StateResult<HashMap<(String, String), u64>> {
        let mut counts = HashMap::new();
        for sample in self.list_response_times_since(since_ms)? {
            let function = format!("{}/{}", sample.namespace, sample.function);
            *counts.entry((sample.source, function)).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Drop samples older than `before_ms` from both tables.
    pub fn prune_before(&self, before_ms: u64) -> StateResult<usize> {
        let upper = sample_key(before_ms, 0);
        let mut removed = 0;
        for table in [RESPONSE_TIMES, RESOURCE_DATA] {
            let keys: Vec<String> = {
                let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
                let t = txn.open_table(table).map_err(map_err!(Table))?;
                let mut keys = Vec::new();
                for entry in t.range(..upper.as_str()).map_err(map_err!(Read))? {
                    let (key, _) = entry.map_err(map_err!(Read))?;
                    keys.push(key.value().to_string());
                }
                keys
            };
            if keys.is_empty() {
                continue;
            }
            let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
            {
                let mut t = txn.open_table(table).map_err(map_err!(Table))?;
                for key in &keys {
                    t.remove(key.as_str()).map_err(map_err!(Write))?;
                }
            }
            txn.commit().map_err(map_err!(Transaction))?;
            removed += keys.len();
        }
        debug!(before_ms, removed, "pruned samples");
        Ok(removed)
    }
}

impl SampleSink for StateStore {
    fn write_response_times(&self, samples: &[RawResponseTime]) -> StateResult<usize> {
        self.append(RESPONSE_TIMES, samples, |s| s.timestamp_ms)
    }

    fn write_resource_data(&self, samples: &[RawResourceData]) -> StateResult<usize> {
        self.append(RESOURCE_DATA, samples, |s| s.timestamp_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(ts: u64, source: &str, function: &str) -> RawResponseTime {
        RawResponseTime {
            timestamp_ms: ts,
            source: source.to_string(),
            destination: "node-b".to_string(),
            function: function.to_string(),
            namespace: "openfaas-fn".to_string(),
            community: "c-0".to_string(),
            gpu: false,
            latency_ms: 12.5,
            status: 200,
            description: String::new(),
        }
    }

    fn resource(ts: u64) -> RawResourceData {
        RawResourceData {
            timestamp_ms: ts,
            node: "node-a".to_string(),
            function: "resize".to_string(),
            namespace: "openfaas-fn".to_string(),
            community: "c-0".to_string(),
            cores: 0.25,
        }
    }

    #[test]
    fn write_and_scan_response_times() {
        let store = StateStore::open_in_memory().unwrap();
        let written = store
            .write_response_times(&[response(100, "a", "f"), response(200, "a", "f")])
            .unwrap();
        assert_eq!(written, 2);

        let all = store.list_response_times_since(0).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].timestamp_ms, 100);

        let recent = store.list_response_times_since(150).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].timestamp_ms, 200);
    }

    #[test]
    fn same_timestamp_samples_are_all_kept() {
        let store = StateStore::open_in_memory().unwrap();
        let batch: Vec<_> = (0..5).map(|_| response(42, "a", "f")).collect();
        store.write_response_times(&batch).unwrap();
        assert_eq!(store.list_response_times_since(0).unwrap().len(), 5);
    }

    #[test]
    fn empty_batch_writes_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.write_response_times(&[]).unwrap(), 0);
        assert_eq!(store.write_resource_data(&[]).unwrap(), 0);
    }

    #[test]
    fn resource_data_round_trip() {
        let store = StateStore::open_in_memory().unwrap();
        store.write_resource_data(&[resource(10), resource(20)]).unwrap();
        let data = store.list_resource_data_since(0).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[1].cores, 0.25);
    }

    #[test]
    fn request_counts_group_by_source_and_function() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .write_response_times(&[
                response(1, "a", "f"),
                response(2, "a", "f"),
                response(3, "b", "f"),
                response(4, "a", "g"),
            ])
            .unwrap();
        let counts = store.count_requests_since(0).unwrap();
        assert_eq!(counts[&("a".to_string(), "openfaas-fn/f".to_string())], 2);
        assert_eq!(counts[&("b".to_string(), "openfaas-fn/f".to_string())], 1);
        assert_eq!(counts[&("a".to_string(), "openfaas-fn/g".to_string())], 1);
    }

    #[test]
    fn prune_removes_old_samples() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .write_response_times(&[response(1, "a", "f"), response(100, "a", "f")])
            .unwrap();
        store.write_resource_data(&[resource(1)]).unwrap();
        assert_eq!(store.prune_before(50).unwrap(), 2);
        assert_eq!(store.list_response_times_since(0).unwrap().len(), 1);
        assert!(store.list_resource_data_since(0).unwrap().is_empty());
    }

    #[test]
    fn persistent_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.write_response_times(&[response(5, "a", "f")]).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        store.write_response_times(&[response(5, "a", "f")]).unwrap();
        assert_eq!(store.list_response_times_since(0).unwrap().len(), 2);
    }
}

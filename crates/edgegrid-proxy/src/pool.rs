//! Backend pool: the weighted set of instances serving one function.
//!
//! Entries are keyed by URL and replaced whole under a single mutex, so a
//! reader never sees a backend paired with another backend's weight.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use edgegrid_core::config::BalancePolicy;
use http::Uri;

use crate::error::{ProxyError, ProxyResult};

/// One network-addressable function instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub url: String,
    pub uri: Uri,
    /// Node hosting the instance.
    pub node: String,
    pub community: String,
    pub gpu: bool,
}

impl Backend {
    pub fn new(url: &str, node: &str, community: &str, gpu: bool) -> ProxyResult<Self> {
        let invalid = |reason: &str| ProxyError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };
        let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
        if uri.scheme().is_none() {
            return Err(invalid("missing scheme"));
        }
        if uri.authority().is_none() {
            return Err(invalid("missing host"));
        }
        Ok(Self {
            url: url.to_string(),
            uri,
            node: node.to_string(),
            community: community.to_string(),
            gpu,
        })
    }

    /// `host:port` of the instance, defaulting the port from the scheme.
    pub fn socket_addr(&self) -> String {
        let host = self.uri.host().unwrap_or_default();
        let port = self.uri.port_u16().unwrap_or(match self.uri.scheme_str() {
            Some("https") => 443,
            _ => 80,
        });
        format!("{host}:{port}")
    }
}

#[derive(Debug, Clone)]
struct Entry {
    backend: Arc<Backend>,
    weight: f64,
    /// Smooth weighted round-robin state.
    current: f64,
    alive: bool,
}

/// Weighted set of backends with a pluggable selection policy.
pub struct BackendPool {
    policy: BalancePolicy,
    entries: Mutex<BTreeMap<String, Entry>>,
    counter: AtomicUsize,
}

impl BackendPool {
    pub fn new(policy: BalancePolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(BTreeMap::new()),
            counter: AtomicUsize::new(0),
        }
    }

    /// Insert or replace the backend with this URL.
    pub fn set_backend(&self, backend: Arc<Backend>, weight: f64) {
        let mut entries = self.entries.lock().expect("pool lock");
        let alive = entries.get(&backend.url).is_none_or(|e| e.alive);
        entries.insert(
            backend.url.clone(),
            Entry {
                backend,
                weight: weight.max(0.0),
                current: 0.0,
                alive,
            },
        );
    }

    /// Change the weight of an existing backend. Returns false if absent.
    pub fn set_weight(&self, url: &str, weight: f64) -> bool {
        let mut entries = self.entries.lock().expect("pool lock");
        match entries.get_mut(url) {
            Some(entry) => {
                entry.weight = weight.max(0.0);
                entry.current = 0.0;
                true
            }
            None => false,
        }
    }

    /// Remove a backend. No-op if absent.
    pub fn remove_backend(&self, url: &str) {
        self.entries.lock().expect("pool lock").remove(url);
    }

    pub fn get_backend(&self, url: &str) -> Option<Arc<Backend>> {
        let entries = self.entries.lock().expect("pool lock");
        entries.get(url).map(|e| e.backend.clone())
    }

    pub fn weight(&self, url: &str) -> Option<f64> {
        let entries = self.entries.lock().expect("pool lock");
        entries.get(url).map(|e| e.weight)
    }

    /// Mark a backend reachable or not. Returns the previous state.
    pub fn set_alive(&self, url: &str, alive: bool) -> Option<bool> {
        let mut entries = self.entries.lock().expect("pool lock");
        entries
            .get_mut(url)
            .map(|e| std::mem::replace(&mut e.alive, alive))
    }

    pub fn backends(&self) -> Vec<Arc<Backend>> {
        let entries = self.entries.lock().expect("pool lock");
        entries.values().map(|e| e.backend.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("pool lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// URLs in the pool that are not in `desired`.
    pub fn backend_diff<S: AsRef<str>>(&self, desired: &[S]) -> Vec<String> {
        let entries = self.entries.lock().expect("pool lock");
        entries
            .keys()
            .filter(|url| !desired.iter().any(|d| d.as_ref() == url.as_str()))
            .cloned()
            .collect()
    }

    /// Pick the next live backend according to the policy.
    pub fn next_backend(&self) -> Option<Arc<Backend>> {
        let mut entries = self.entries.lock().expect("pool lock");
        let mut live: Vec<&mut Entry> = entries.values_mut().filter(|e| e.alive).collect();
        if live.is_empty() {
            return None;
        }

        let total: f64 = live.iter().map(|e| e.weight).sum();
        if self.policy == BalancePolicy::RoundRobin || total <= 0.0 {
            let idx = self.counter.fetch_add(1, Ordering::Relaxed) % live.len();
            return Some(live[idx].backend.clone());
        }

        let mut best = 0;
        for i in 0..live.len() {
            live[i].current += live[i].weight;
            if live[i].current > live[best].current {
                best = i;
            }
        }
        live[best].current -= total;
        Some(live[best].backend.clone())
    }
}

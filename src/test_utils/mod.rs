//! Test utilities for lookout.
//!
//! In-memory stand-ins for the backend clients, implementing the same
//! blocking-query contract real clients do: writes bump a global index
//! and wake every blocked query, long-polls time out into spurious
//! wakes. They let the full resolve loop (templates, watcher, views,
//! store) run in-process with no network.
//!
//! Available to unit tests, and to integration tests through the
//! `test-utils` feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::clients::{ClientSet, ConsulBackend, QueryMeta, VaultBackend};
use crate::dep::{
    Dependency, HealthService, Lease, Node, QueryOptions, ResponseMetadata, Value,
};
use crate::error::Error;

/// An in-memory Consul-style backend.
///
/// All endpoints share one index: any mutation wakes every blocked
/// query, exactly like a busy cluster producing unrelated churn.
pub struct FakeConsul {
    state: Mutex<ConsulState>,
    notify: Notify,
    health_fetches: AtomicU64,
    initial_health_fetches: AtomicU64,
}

#[derive(Default)]
struct ConsulState {
    index: u64,
    services: Vec<HealthService>,
    nodes: Vec<Node>,
    kv: HashMap<String, String>,
}

impl FakeConsul {
    /// Create an empty backend at index 1.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ConsulState {
                index: 1,
                ..Default::default()
            }),
            notify: Notify::new(),
            health_fetches: AtomicU64::new(0),
            initial_health_fetches: AtomicU64::new(0),
        })
    }

    /// Replace the registered service instances.
    pub fn set_services(&self, services: Vec<HealthService>) {
        self.state.lock().services = services;
        self.bump();
    }

    /// Replace the catalog nodes.
    pub fn set_nodes(&self, nodes: Vec<Node>) {
        self.state.lock().nodes = nodes;
        self.bump();
    }

    /// Write a KV entry.
    pub fn put_kv(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state.lock().kv.insert(key.into(), value.into());
        self.bump();
    }

    /// Delete a KV entry.
    pub fn delete_kv(&self, key: &str) {
        self.state.lock().kv.remove(key);
        self.bump();
    }

    /// Total health-service fetches served.
    pub fn health_fetches(&self) -> u64 {
        self.health_fetches.load(Ordering::Relaxed)
    }

    /// Health-service fetches served with no wait index, i.e. initial
    /// (non-long-poll) fetches.
    pub fn initial_health_fetches(&self) -> u64 {
        self.initial_health_fetches.load(Ordering::Relaxed)
    }

    fn bump(&self) {
        self.state.lock().index += 1;
        self.notify.notify_waiters();
    }

    async fn block(&self, wait_index: u64, wait_time: Duration) -> u64 {
        loop {
            let notified = self.notify.notified();
            let index = self.state.lock().index;
            if wait_index == 0 || index > wait_index {
                return index;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(wait_time) => return index,
            }
        }
    }
}

#[async_trait]
impl ConsulBackend for FakeConsul {
    async fn health_service(
        &self,
        name: &str,
        tag: Option<&str>,
        passing_only: bool,
        opts: &QueryOptions,
    ) -> Result<(Vec<HealthService>, QueryMeta), Error> {
        self.health_fetches.fetch_add(1, Ordering::Relaxed);
        if opts.wait_index == 0 {
            self.initial_health_fetches.fetch_add(1, Ordering::Relaxed);
        }

        let index = self.block(opts.wait_index, opts.wait_time).await;
        let entries = self
            .state
            .lock()
            .services
            .iter()
            .filter(|s| s.name == name)
            .filter(|s| tag.is_none_or(|t| s.tags.iter().any(|st| st == t)))
            .filter(|s| !passing_only || s.status == "passing")
            .cloned()
            .collect();

        Ok((entries, QueryMeta {
            last_index: index,
            last_contact: Duration::ZERO,
        }))
    }

    async fn catalog_nodes(
        &self,
        opts: &QueryOptions,
    ) -> Result<(Vec<Node>, QueryMeta), Error> {
        let index = self.block(opts.wait_index, opts.wait_time).await;
        let nodes = self.state.lock().nodes.clone();
        Ok((nodes, QueryMeta {
            last_index: index,
            last_contact: Duration::ZERO,
        }))
    }

    async fn kv_get(
        &self,
        key: &str,
        opts: &QueryOptions,
    ) -> Result<(Option<String>, QueryMeta), Error> {
        let index = self.block(opts.wait_index, opts.wait_time).await;
        let pair = self.state.lock().kv.get(key).cloned();
        Ok((pair, QueryMeta {
            last_index: index,
            last_contact: Duration::ZERO,
        }))
    }
}

/// An in-memory Vault-style backend.
pub struct FakeVault {
    state: Mutex<VaultState>,
}

struct VaultState {
    secrets: HashMap<String, Vec<String>>,
    lease: Lease,
}

impl FakeVault {
    /// Create an empty backend with a short renewable lease.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(VaultState {
                secrets: HashMap::new(),
                lease: Lease {
                    duration: Duration::from_secs(60),
                    renewable: true,
                    data: Default::default(),
                },
            }),
        })
    }

    /// Replace the key names listed under `path`.
    pub fn set_keys(&self, path: impl Into<String>, keys: Vec<String>) {
        self.state.lock().secrets.insert(path.into(), keys);
    }

    /// Replace the lease attached to every listing.
    pub fn set_lease(&self, lease: Lease) {
        self.state.lock().lease = lease;
    }
}

#[async_trait]
impl VaultBackend for FakeVault {
    async fn list(&self, path: &str) -> Result<(Vec<String>, Lease), Error> {
        let state = self.state.lock();
        let keys = state.secrets.get(path).cloned().unwrap_or_default();
        Ok((keys, state.lease.clone()))
    }
}

/// A client set wired to fake backends.
pub fn fake_clients(consul: &Arc<FakeConsul>) -> ClientSet {
    ClientSet::new().with_consul(Arc::clone(consul) as Arc<dyn ConsulBackend>)
}

/// A hand-driven dependency for exercising watcher and view mechanics
/// without any backend.
pub struct TestDependency {
    name: String,
    value: Mutex<Value>,
    index: AtomicU64,
    error: Mutex<Option<Error>>,
    shareable: bool,
    notify: Notify,
    opts: Mutex<QueryOptions>,
    stop: CancellationToken,
}

impl TestDependency {
    /// Create a shareable dependency identified as `test.dep(<name>)`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: Mutex::new(Value::KvPair(Some(name.to_string()))),
            index: AtomicU64::new(1),
            error: Mutex::new(None),
            shareable: true,
            notify: Notify::new(),
            opts: Mutex::new(QueryOptions::default()),
            stop: CancellationToken::new(),
        }
    }

    /// Mark the dependency unshareable, forcing per-template views.
    pub fn unshareable(mut self) -> Self {
        self.shareable = false;
        self
    }

    /// Wrap into the trait object the watcher consumes.
    pub fn shared(self) -> Arc<dyn Dependency> {
        Arc::new(self)
    }

    /// Publish a new value, advancing the index and waking any blocked
    /// fetch.
    pub fn set_value(&self, value: Value) {
        *self.value.lock() = value;
        self.index.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Make the next fetch fail with `err`, waking any blocked fetch.
    pub fn fail_with(&self, err: Error) {
        *self.error.lock() = Some(err);
        self.notify.notify_waiters();
    }

    /// Whether `stop` has been called.
    pub fn stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

#[async_trait]
impl Dependency for TestDependency {
    async fn fetch(&self, _clients: &ClientSet) -> Result<(Value, ResponseMetadata), Error> {
        let wait_index = self.opts.lock().wait_index;
        loop {
            if self.stop.is_cancelled() {
                return Err(Error::Stopped);
            }
            if let Some(err) = self.error.lock().take() {
                return Err(err);
            }

            let notified = self.notify.notified();
            let index = self.index.load(Ordering::SeqCst);
            if wait_index == 0 || index > wait_index {
                return Ok((
                    self.value.lock().clone(),
                    ResponseMetadata {
                        last_index: index,
                        block: true,
                        ..Default::default()
                    },
                ));
            }

            tokio::select! {
                _ = self.stop.cancelled() => return Err(Error::Stopped),
                _ = notified => {}
            }
        }
    }

    fn stop(&self) {
        self.stop.cancel();
    }

    fn can_share(&self) -> bool {
        self.shareable
    }

    fn set_options(&self, opts: QueryOptions) {
        *self.opts.lock() = opts;
    }
}

impl std::fmt::Display for TestDependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "test.dep({})", self.name)
    }
}

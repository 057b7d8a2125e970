//! Backend client bundle handed to dependencies at fetch time.
//!
//! The core never talks to a backend directly: a [`Dependency`] receives a
//! [`ClientSet`] and picks the client it needs. The clients themselves are
//! trait objects so callers can plug in real HTTP clients, and tests can
//! plug in the in-memory fakes from [`crate::test_utils`].
//!
//! The two traits below define the *blocking query* contract the core
//! relies on: an implementation of a blocking endpoint must not return
//! until the server-side index advances past `opts.wait_index`, or
//! `opts.wait_time` elapses (returning the current index unchanged, which
//! views treat as a spurious wake).
//!
//! [`Dependency`]: crate::dep::Dependency

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::dep::{HealthService, Node, QueryOptions};
use crate::error::Error;

/// Metadata returned alongside every backend response.
#[derive(Debug, Clone, Default)]
pub struct QueryMeta {
    /// The server's version token for this endpoint. Monotone per
    /// endpoint except across server restarts.
    pub last_index: u64,
    /// How long the server took to respond.
    pub last_contact: Duration,
}

/// Client surface for a Consul-style catalog, health, and KV backend.
#[async_trait]
pub trait ConsulBackend: Send + Sync {
    /// Health entries for a named service, optionally restricted to a tag.
    ///
    /// `passing_only` is a server-side hint; callers still apply their own
    /// status filtering to the returned entries.
    async fn health_service(
        &self,
        name: &str,
        tag: Option<&str>,
        passing_only: bool,
        opts: &QueryOptions,
    ) -> Result<(Vec<HealthService>, QueryMeta), Error>;

    /// All nodes in the catalog.
    async fn catalog_nodes(&self, opts: &QueryOptions) -> Result<(Vec<Node>, QueryMeta), Error>;

    /// The value stored under a KV key, or `None` when absent.
    async fn kv_get(
        &self,
        key: &str,
        opts: &QueryOptions,
    ) -> Result<(Option<String>, QueryMeta), Error>;
}

/// Client surface for a Vault-style secret store.
#[async_trait]
pub trait VaultBackend: Send + Sync {
    /// Secret key names under a path, plus the lease governing how long
    /// the listing may be cached. Listing is not a blocking query.
    async fn list(&self, path: &str) -> Result<(Vec<String>, crate::dep::Lease), Error>;
}

/// An opaque bundle of backend clients.
///
/// Cheap to clone; the contained clients are shared.
#[derive(Clone, Default)]
pub struct ClientSet {
    consul: Option<Arc<dyn ConsulBackend>>,
    vault: Option<Arc<dyn VaultBackend>>,
}

impl ClientSet {
    /// Create an empty client set. Dependencies that need a missing
    /// backend fail their fetch with [`Error::NoClient`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a Consul-style backend.
    pub fn with_consul(mut self, client: Arc<dyn ConsulBackend>) -> Self {
        self.consul = Some(client);
        self
    }

    /// Attach a Vault-style backend.
    pub fn with_vault(mut self, client: Arc<dyn VaultBackend>) -> Self {
        self.vault = Some(client);
        self
    }

    /// The configured Consul backend.
    pub fn consul(&self) -> Result<&Arc<dyn ConsulBackend>, Error> {
        self.consul.as_ref().ok_or_else(|| Error::NoClient {
            backend: "consul".to_string(),
        })
    }

    /// The configured Vault backend.
    pub fn vault(&self) -> Result<&Arc<dyn VaultBackend>, Error> {
        self.vault.as_ref().ok_or_else(|| Error::NoClient {
            backend: "vault".to_string(),
        })
    }
}

impl std::fmt::Debug for ClientSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSet")
            .field("consul", &self.consul.is_some())
            .field("vault", &self.vault.is_some())
            .finish()
    }
}

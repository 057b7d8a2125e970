//! The dependency abstraction: addressable, pollable pieces of remote state.
//!
//! A [`Dependency`] is one external value a template can reference: a set
//! of healthy service instances, the nodes in a catalog, a KV entry, a
//! secret listing. Every dependency has a stable human-readable identity
//! (its `Display` form, e.g. `health.service(web|passing)`) that doubles
//! as its cache key and its deduplication key inside a watcher.
//!
//! # Contract
//!
//! - [`Dependency::fetch`] performs one (possibly long-polling) query and
//!   returns an opaque [`Value`] plus [`ResponseMetadata`]. It must check
//!   the stop signal before issuing I/O and abort promptly when stopped
//!   mid-poll, returning [`Error::Stopped`].
//! - [`Dependency::stop`] is idempotent and never blocks.
//! - [`Dependency::set_options`] carries the last-seen index and wait time
//!   into the next fetch; the owning view calls it before every poll.
//! - [`Dependency::can_share`] reports whether one running view may serve
//!   multiple templates; per-caller state (auth tokens) must not be shared.
//!
//! Concrete query kinds live in the submodules; each parses its query
//! string with a small regex grammar and rejects malformed input at
//! construction with [`Error::InvalidQuery`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clients::ClientSet;
use crate::error::Error;

pub mod catalog_nodes;
pub mod health_service;
pub mod kv;
mod lease;
pub mod vault_list;

pub use catalog_nodes::CatalogNodesQuery;
pub use health_service::HealthServiceQuery;
pub use kv::{KvExistsQuery, KvGetQuery};
pub use vault_list::VaultListQuery;

pub(crate) use lease::lease_check_wait;

/// One healthy (or filtered) instance of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthService {
    /// Name of the node hosting the instance.
    pub node: String,
    /// Address of the hosting node.
    pub node_address: String,
    /// Service address, falling back to the node address when unset.
    pub address: String,
    /// Unique service instance ID.
    pub id: String,
    /// Service name.
    pub name: String,
    /// Tags attached to the instance, sorted.
    pub tags: Vec<String>,
    /// Aggregated health status (`passing`, `warning`, ...).
    pub status: String,
    /// Service port.
    pub port: u16,
}

/// One node in the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node name.
    pub node: String,
    /// Node address.
    pub address: String,
}

/// The value a dependency produced, tagged by kind.
///
/// The core treats values as opaque: it caches and republishes them
/// without inspection. Templates convert them into engine values, and
/// [`Notifier`] strategies discriminate on the variant to decide which
/// changes should retrigger evaluation.
///
/// [`Notifier`]: crate::template::Notifier
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    /// Instances returned by a health-service query.
    HealthServices(Vec<HealthService>),
    /// Nodes returned by a catalog query.
    Nodes(Vec<Node>),
    /// A KV read; `None` when the key is absent.
    KvPair(Option<String>),
    /// Whether a KV key exists.
    KvExists(bool),
    /// Secret key names returned by a listing.
    SecretKeys(Vec<String>),
}

impl Value {
    /// A short tag naming the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::HealthServices(_) => "health-services",
            Value::Nodes(_) => "nodes",
            Value::KvPair(_) => "kv-pair",
            Value::KvExists(_) => "kv-exists",
            Value::SecretKeys(_) => "secret-keys",
        }
    }
}

/// Options a view sets on its dependency before each fetch.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Datacenter to query, when the dependency specifies one.
    pub datacenter: Option<String>,
    /// Sort results by round-trip time from this node.
    pub near: Option<String>,
    /// Index token from the previous response; a blocking query does not
    /// return until the server moves past it.
    pub wait_index: u64,
    /// Upper bound on how long a blocking query may hold the connection.
    pub wait_time: Duration,
    /// Fallback lease duration for backends that report none.
    pub default_lease: Duration,
}

impl QueryOptions {
    /// Fill in per-dependency routing fields parsed from the query string.
    pub(crate) fn for_query(mut self, datacenter: Option<&str>, near: Option<&str>) -> Self {
        if datacenter.is_some() {
            self.datacenter = datacenter.map(str::to_string);
        }
        if near.is_some() {
            self.near = near.map(str::to_string);
        }
        self
    }
}

/// Lease information attached to secret responses.
#[derive(Debug, Clone, Default)]
pub struct Lease {
    /// How long the secret may be cached.
    pub duration: Duration,
    /// Whether the lease can be renewed in place.
    pub renewable: bool,
    /// Raw secret data; drives the re-read schedule for rotating
    /// credentials and certificates.
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// Metadata returned with every fetch.
#[derive(Debug, Clone, Default)]
pub struct ResponseMetadata {
    /// The server's version token for the fetched data.
    pub last_index: u64,
    /// How long the server took to respond.
    pub last_contact: Duration,
    /// Whether the next fetch will long-poll. Non-blocking dependencies
    /// are re-polled on a lease-derived schedule instead.
    pub block: bool,
    /// Lease governing the value, when the backend issued one.
    pub lease: Option<Lease>,
}

/// A pollable, stoppable, shareable handle to one piece of external state.
#[async_trait]
pub trait Dependency: Send + Sync + fmt::Display {
    /// Stable identity used as the cache key and dedup key.
    fn id(&self) -> String {
        self.to_string()
    }

    /// Query the backend once and return the value with its metadata.
    ///
    /// Implementations must return [`Error::Stopped`] promptly once
    /// [`stop`](Dependency::stop) has been called, including while blocked
    /// in a long-poll.
    async fn fetch(&self, clients: &ClientSet) -> Result<(Value, ResponseMetadata), Error>;

    /// Signal the dependency to abort in-flight and future fetches.
    /// Idempotent.
    fn stop(&self);

    /// Whether one running view of this dependency may serve many
    /// templates.
    fn can_share(&self) -> bool {
        true
    }

    /// Install the options the next fetch should use.
    fn set_options(&self, opts: QueryOptions);
}

//! Catalog-node queries: every node registered in the catalog.
//!
//! Query grammar: empty, or `[@dc][~near]` to target another datacenter
//! and sort by round-trip time from a node. Without `near`, results are
//! ordered by `(node, address)`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::clients::ClientSet;
use crate::dep::{Dependency, Node, QueryOptions, ResponseMetadata, Value};
use crate::error::Error;

static QUERY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\A(?:@(?P<dc>[\w.\-_]+))?(?:~(?P<near>[\w.\-_]+))?\z")
        .expect("catalog nodes query regex")
});

/// A query for all nodes in a datacenter.
pub struct CatalogNodesQuery {
    dc: Option<String>,
    near: Option<String>,
    opts: Mutex<QueryOptions>,
    stop: CancellationToken,
}

impl CatalogNodesQuery {
    /// Parse an empty or `[@dc][~near]` query string.
    pub fn new(query: &str) -> Result<Self, Error> {
        let caps = QUERY_RE.captures(query).ok_or_else(|| Error::InvalidQuery {
            query: query.to_string(),
            reason: "invalid catalog nodes format".to_string(),
        })?;

        Ok(Self {
            dc: caps.name("dc").map(|m| m.as_str().to_string()),
            near: caps.name("near").map(|m| m.as_str().to_string()),
            opts: Mutex::new(QueryOptions::default()),
            stop: CancellationToken::new(),
        })
    }

    /// Convenience constructor returning a shared trait object.
    pub fn shared(query: &str) -> Result<Arc<dyn Dependency>, Error> {
        Ok(Arc::new(Self::new(query)?))
    }
}

#[async_trait]
impl Dependency for CatalogNodesQuery {
    async fn fetch(&self, clients: &ClientSet) -> Result<(Value, ResponseMetadata), Error> {
        if self.stop.is_cancelled() {
            return Err(Error::Stopped);
        }

        let opts = self
            .opts
            .lock()
            .clone()
            .for_query(self.dc.as_deref(), self.near.as_deref());

        let consul = clients.consul()?;
        let (mut nodes, meta) = tokio::select! {
            _ = self.stop.cancelled() => return Err(Error::Stopped),
            res = consul.catalog_nodes(&opts) => res?,
        };

        if self.near.is_none() {
            nodes.sort_by(|a, b| a.node.cmp(&b.node).then_with(|| a.address.cmp(&b.address)));
        }

        tracing::trace!(query = %self, results = nodes.len(), index = meta.last_index, "fetched catalog nodes");

        Ok((
            Value::Nodes(nodes),
            ResponseMetadata {
                last_index: meta.last_index,
                last_contact: meta.last_contact,
                block: true,
                lease: None,
            },
        ))
    }

    fn stop(&self) {
        self.stop.cancel();
    }

    fn set_options(&self, opts: QueryOptions) {
        *self.opts.lock() = opts;
    }
}

impl fmt::Display for CatalogNodesQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut suffix = String::new();
        if let Some(dc) = &self.dc {
            suffix.push_str(&format!("@{dc}"));
        }
        if let Some(near) = &self.near {
            suffix.push_str(&format!("~{near}"));
        }
        if suffix.is_empty() {
            write!(f, "catalog.nodes")
        } else {
            write!(f, "catalog.nodes({suffix})")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        let q = CatalogNodesQuery::new("").unwrap();
        assert_eq!(q.dc, None);
        assert_eq!(q.near, None);
        assert_eq!(q.id(), "catalog.nodes");
    }

    #[test]
    fn test_parse_datacenter() {
        let q = CatalogNodesQuery::new("@dc2").unwrap();
        assert_eq!(q.dc.as_deref(), Some("dc2"));
        assert_eq!(q.id(), "catalog.nodes(@dc2)");
    }

    #[test]
    fn test_parse_near() {
        let q = CatalogNodesQuery::new("~agent").unwrap();
        assert_eq!(q.dc, None);
        assert_eq!(q.near.as_deref(), Some("agent"));
        assert_eq!(q.id(), "catalog.nodes(~agent)");

        let q = CatalogNodesQuery::new("@dc2~agent").unwrap();
        assert_eq!(q.dc.as_deref(), Some("dc2"));
        assert_eq!(q.near.as_deref(), Some("agent"));
        assert_eq!(q.id(), "catalog.nodes(@dc2~agent)");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(CatalogNodesQuery::new("nodes").is_err());
        assert!(CatalogNodesQuery::new("@").is_err());
        assert!(CatalogNodesQuery::new("~agent@dc2").is_err());
    }

    use crate::test_utils::{fake_clients, FakeConsul};

    fn node(name: &str, address: &str) -> Node {
        Node {
            node: name.to_string(),
            address: address.to_string(),
        }
    }

    #[tokio::test]
    async fn test_fetch_sorts_by_node_then_address() {
        let consul = FakeConsul::new();
        consul.set_nodes(vec![
            node("node-b", "10.0.0.2"),
            node("node-a", "10.0.0.9"),
            node("node-a", "10.0.0.1"),
        ]);

        let query = CatalogNodesQuery::new("").unwrap();
        let (value, meta) = query.fetch(&fake_clients(&consul)).await.unwrap();
        let Value::Nodes(list) = value else {
            panic!("unexpected value kind");
        };
        let order: Vec<(&str, &str)> = list
            .iter()
            .map(|n| (n.node.as_str(), n.address.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("node-a", "10.0.0.1"),
                ("node-a", "10.0.0.9"),
                ("node-b", "10.0.0.2"),
            ]
        );
        assert!(meta.block);
    }

    #[tokio::test]
    async fn test_fetch_near_preserves_server_order() {
        let consul = FakeConsul::new();
        consul.set_nodes(vec![
            node("node-b", "10.0.0.2"),
            node("node-a", "10.0.0.9"),
        ]);

        let query = CatalogNodesQuery::new("~agent").unwrap();
        let (value, _) = query.fetch(&fake_clients(&consul)).await.unwrap();
        let Value::Nodes(list) = value else {
            panic!("unexpected value kind");
        };
        let order: Vec<&str> = list.iter().map(|n| n.node.as_str()).collect();
        assert_eq!(order, vec!["node-b", "node-a"]);
    }
}

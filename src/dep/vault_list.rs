//! Secret-listing queries: key names under a secret path.
//!
//! The path is slash-delimited; leading and trailing slashes are
//! normalized away and an empty path is rejected. Listing is not a
//! blocking query: the owning view re-reads on a lease-derived schedule.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::clients::ClientSet;
use crate::dep::{Dependency, QueryOptions, ResponseMetadata, Value};
use crate::error::Error;

/// A query listing the secret keys under a path.
pub struct VaultListQuery {
    path: String,
    opts: Mutex<QueryOptions>,
    stop: CancellationToken,
}

impl VaultListQuery {
    /// Parse a slash-delimited secret path.
    pub fn new(query: &str) -> Result<Self, Error> {
        let path = query.trim_matches('/').to_string();
        if path.is_empty() {
            return Err(Error::InvalidQuery {
                query: query.to_string(),
                reason: "missing secret path".to_string(),
            });
        }

        Ok(Self {
            path,
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
impl Dependency for VaultListQuery {
    async fn fetch(&self, clients: &ClientSet) -> Result<(Value, ResponseMetadata), Error> {
        if self.stop.is_cancelled() {
            return Err(Error::Stopped);
        }

        let opts = self.opts.lock().clone();

        let vault = clients.vault()?;
        let (keys, mut lease) = tokio::select! {
            _ = self.stop.cancelled() => return Err(Error::Stopped),
            res = vault.list(&self.path) => res?,
        };

        if lease.duration.is_zero() {
            lease.duration = opts.default_lease;
        }

        tracing::trace!(query = %self, results = keys.len(), lease = ?lease.duration, "listed secrets");

        // Listings have no server index; synthesize a fresh one so every
        // re-read publishes.
        Ok((
            Value::SecretKeys(keys),
            ResponseMetadata {
                last_index: opts.wait_index.saturating_add(1),
                last_contact: Duration::ZERO,
                block: false,
                lease: Some(lease),
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

impl fmt::Display for VaultListQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vault.list({})", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_path() {
        let q = VaultListQuery::new("secret/data").unwrap();
        assert_eq!(q.path, "secret/data");
        assert_eq!(q.id(), "vault.list(secret/data)");
    }

    #[test]
    fn test_parse_normalizes_slashes() {
        let leading = VaultListQuery::new("/leading/slash").unwrap();
        assert_eq!(leading.path, "leading/slash");

        let trailing = VaultListQuery::new("trailing/slash/").unwrap();
        assert_eq!(trailing.path, "trailing/slash");

        assert_eq!(
            VaultListQuery::new("/a/b/").unwrap().id(),
            VaultListQuery::new("a/b").unwrap().id()
        );
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(matches!(
            VaultListQuery::new(""),
            Err(Error::InvalidQuery { .. })
        ));
        assert!(VaultListQuery::new("///").is_err());
    }

    #[tokio::test]
    async fn test_fetch_defaults_missing_lease_duration() {
        use crate::clients::ClientSet;
        use crate::dep::Lease;
        use crate::test_utils::FakeVault;

        let vault = FakeVault::new();
        vault.set_keys("secret", vec!["foo/".to_string()]);
        vault.set_lease(Lease::default());
        let clients = ClientSet::new().with_vault(vault);

        let query = VaultListQuery::new("secret").unwrap();
        query.set_options(QueryOptions {
            default_lease: Duration::from_secs(300),
            ..Default::default()
        });

        let (value, meta) = query.fetch(&clients).await.unwrap();
        assert_eq!(value, Value::SecretKeys(vec!["foo/".to_string()]));
        assert!(!meta.block);
        let lease = meta.lease.expect("listing carries a lease");
        assert_eq!(lease.duration, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_fetch_index_advances_each_read() {
        use crate::clients::ClientSet;
        use crate::test_utils::FakeVault;

        let vault = FakeVault::new();
        let clients = ClientSet::new().with_vault(vault);
        let query = VaultListQuery::new("secret").unwrap();

        let (_, first) = query.fetch(&clients).await.unwrap();
        query.set_options(QueryOptions {
            wait_index: first.last_index,
            ..Default::default()
        });
        let (_, second) = query.fetch(&clients).await.unwrap();
        assert!(second.last_index > first.last_index);
    }
}

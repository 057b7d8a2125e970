//! KV queries: the value stored under a key, and key existence.
//!
//! Query grammar: a slash-delimited key path with an optional `@dc`
//! suffix. An empty key is rejected.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::clients::ClientSet;
use crate::dep::{Dependency, QueryOptions, ResponseMetadata, Value};
use crate::error::Error;

static QUERY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\A(?P<key>[^@]+)(?:@(?P<dc>[\w.\-_]+))?\z").expect("kv query regex")
});

fn parse_key(query: &str) -> Result<(String, Option<String>), Error> {
    let caps = QUERY_RE.captures(query).ok_or_else(|| Error::InvalidQuery {
        query: query.to_string(),
        reason: "invalid key format".to_string(),
    })?;

    let key = caps["key"].trim_matches('/').to_string();
    if key.is_empty() {
        return Err(Error::InvalidQuery {
            query: query.to_string(),
            reason: "missing key".to_string(),
        });
    }
    Ok((key, caps.name("dc").map(|m| m.as_str().to_string())))
}

/// A query for the value stored under a KV key.
pub struct KvGetQuery {
    key: String,
    dc: Option<String>,
    opts: Mutex<QueryOptions>,
    stop: CancellationToken,
}

impl KvGetQuery {
    /// Parse a `key[@dc]` query string.
    pub fn new(query: &str) -> Result<Self, Error> {
        let (key, dc) = parse_key(query)?;
        Ok(Self {
            key,
            dc,
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
impl Dependency for KvGetQuery {
    async fn fetch(&self, clients: &ClientSet) -> Result<(Value, ResponseMetadata), Error> {
        if self.stop.is_cancelled() {
            return Err(Error::Stopped);
        }

        let opts = self.opts.lock().clone().for_query(self.dc.as_deref(), None);

        let consul = clients.consul()?;
        let (pair, meta) = tokio::select! {
            _ = self.stop.cancelled() => return Err(Error::Stopped),
            res = consul.kv_get(&self.key, &opts) => res?,
        };

        tracing::trace!(query = %self, found = pair.is_some(), index = meta.last_index, "fetched kv pair");

        Ok((
            Value::KvPair(pair),
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

impl fmt::Display for KvGetQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dc {
            Some(dc) => write!(f, "kv.get({}@{dc})", self.key),
            None => write!(f, "kv.get({})", self.key),
        }
    }
}

/// A query for whether a KV key exists.
pub struct KvExistsQuery {
    inner: KvGetQuery,
}

impl KvExistsQuery {
    /// Parse a `key[@dc]` query string.
    pub fn new(query: &str) -> Result<Self, Error> {
        Ok(Self {
            inner: KvGetQuery::new(query)?,
        })
    }

    /// Convenience constructor returning a shared trait object.
    pub fn shared(query: &str) -> Result<Arc<dyn Dependency>, Error> {
        Ok(Arc::new(Self::new(query)?))
    }
}

#[async_trait]
impl Dependency for KvExistsQuery {
    async fn fetch(&self, clients: &ClientSet) -> Result<(Value, ResponseMetadata), Error> {
        let (value, meta) = self.inner.fetch(clients).await?;
        let exists = matches!(value, Value::KvPair(Some(_)));
        Ok((Value::KvExists(exists), meta))
    }

    fn stop(&self) {
        self.inner.stop();
    }

    fn set_options(&self, opts: QueryOptions) {
        self.inner.set_options(opts);
    }
}

impl fmt::Display for KvExistsQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.dc {
            Some(dc) => write!(f, "kv.exists({}@{dc})", self.inner.key),
            None => write!(f, "kv.exists({})", self.inner.key),
        }
    }
}

//! Health-service queries: the set of instances backing a named service.
//!
//! Query grammar (case-sensitive): `[tag.]name[@dc][~near][|filter,...]`
//! where each filter is one of `any`, `passing`, `warning`, `critical`,
//! `maintenance`. With no filter the query returns passing instances only.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::clients::ClientSet;
use crate::dep::{Dependency, HealthService, QueryOptions, ResponseMetadata, Value};
use crate::error::Error;

/// Accept instances regardless of status.
pub const HEALTH_ANY: &str = "any";
/// Accept passing instances.
pub const HEALTH_PASSING: &str = "passing";
/// Accept warning instances.
pub const HEALTH_WARNING: &str = "warning";
/// Accept critical instances.
pub const HEALTH_CRITICAL: &str = "critical";
/// Accept instances under maintenance.
pub const HEALTH_MAINT: &str = "maintenance";

static QUERY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\A(?:(?P<tag>[\w\-.]+)\.)?(?P<name>[\w\-/_]+)(?:@(?P<dc>[\w.\-_]+))?(?:~(?P<near>[\w.\-_]+))?(?:\|(?P<filter>[\w,\s]+))?\z",
    )
    .expect("health service query regex")
});

/// A query for the health entries of one service.
#[derive(Debug)]
pub struct HealthServiceQuery {
    name: String,
    tag: Option<String>,
    dc: Option<String>,
    near: Option<String>,
    filters: Vec<String>,
    opts: Mutex<QueryOptions>,
    stop: CancellationToken,
}

impl HealthServiceQuery {
    /// Parse a `[tag.]name[@dc][~near][|filter,...]` query string.
    pub fn new(query: &str) -> Result<Self, Error> {
        let caps = QUERY_RE.captures(query).ok_or_else(|| Error::InvalidQuery {
            query: query.to_string(),
            reason: "invalid health service format".to_string(),
        })?;

        let filters = match caps.name("filter") {
            Some(m) => parse_filters(query, m.as_str())?,
            None => vec![HEALTH_PASSING.to_string()],
        };

        Ok(Self {
            name: caps["name"].to_string(),
            tag: caps.name("tag").map(|m| m.as_str().to_string()),
            dc: caps.name("dc").map(|m| m.as_str().to_string()),
            near: caps.name("near").map(|m| m.as_str().to_string()),
            filters,
            opts: Mutex::new(QueryOptions::default()),
            stop: CancellationToken::new(),
        })
    }

    /// Convenience constructor returning a shared trait object.
    pub fn shared(query: &str) -> Result<Arc<dyn Dependency>, Error> {
        Ok(Arc::new(Self::new(query)?))
    }
}

fn parse_filters(query: &str, raw: &str) -> Result<Vec<String>, Error> {
    let mut filters = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        match part {
            HEALTH_ANY | HEALTH_PASSING | HEALTH_WARNING | HEALTH_CRITICAL | HEALTH_MAINT => {
                filters.push(part.to_string());
            }
            "" => {}
            other => {
                return Err(Error::InvalidQuery {
                    query: query.to_string(),
                    reason: format!("invalid filter {other:?}"),
                });
            }
        }
    }
    filters.sort();
    filters.dedup();
    Ok(filters)
}

fn accept_status(filters: &[String], status: &str) -> bool {
    filters.iter().any(|f| f == status || f == HEALTH_ANY)
}

#[async_trait]
impl Dependency for HealthServiceQuery {
    async fn fetch(&self, clients: &ClientSet) -> Result<(Value, ResponseMetadata), Error> {
        if self.stop.is_cancelled() {
            return Err(Error::Stopped);
        }

        let opts = self
            .opts
            .lock()
            .clone()
            .for_query(self.dc.as_deref(), self.near.as_deref());

        // The server only understands "passing only"; anything else is
        // fetched broadly and filtered client-side below.
        let passing_only = self.filters.len() == 1 && self.filters[0] == HEALTH_PASSING;

        let consul = clients.consul()?;
        let (entries, meta) = tokio::select! {
            _ = self.stop.cancelled() => return Err(Error::Stopped),
            res = consul.health_service(&self.name, self.tag.as_deref(), passing_only, &opts) => res?,
        };

        let mut list: Vec<HealthService> = entries
            .into_iter()
            .filter(|entry| accept_status(&self.filters, &entry.status))
            .collect();

        if self.near.is_none() {
            list.sort_by(|a, b| a.node.cmp(&b.node).then_with(|| a.id.cmp(&b.id)));
        }

        tracing::trace!(query = %self, results = list.len(), index = meta.last_index, "fetched health services");

        Ok((
            Value::HealthServices(list),
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

impl fmt::Display for HealthServiceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut name = self.name.clone();
        if let Some(tag) = &self.tag {
            name = format!("{tag}.{name}");
        }
        if let Some(dc) = &self.dc {
            name = format!("{name}@{dc}");
        }
        if let Some(near) = &self.near {
            name = format!("{name}~{near}");
        }
        if !self.filters.is_empty() {
            name = format!("{name}|{}", self.filters.join(","));
        }
        write!(f, "health.service({name})")
    }
}

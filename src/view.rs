//! The view: a serial fetch loop for one dependency.
//!
//! A view is spawned lazily by the watcher the first time a template
//! tracks its dependency, and runs on its own task until retired. The
//! loop is strictly serial: fetch, publish when the index advanced,
//! repeat. Blocking dependencies spend most of their life suspended
//! inside a long-poll; non-blocking ones sleep on a lease-derived
//! schedule between reads.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::constants::{DEFAULT_QUERY_WAIT, RETRY_BASE_DELAY, RETRY_MAX_DELAY};
use crate::dep::{lease_check_wait, Dependency, Lease, QueryOptions};
use crate::error::Error;
use crate::watcher::Shared;

/// Key under which a view is registered inside a watcher.
///
/// Shareable dependencies are keyed by identity alone so one view serves
/// every template; unshareable ones carry the owning template's id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ViewKey {
    pub(crate) dep_id: String,
    pub(crate) owner: Option<u64>,
}

impl ViewKey {
    pub(crate) fn new(dep: &dyn Dependency, tmpl_id: u64) -> Self {
        Self {
            dep_id: dep.id(),
            owner: if dep.can_share() { None } else { Some(tmpl_id) },
        }
    }
}

pub(crate) struct View {
    pub(crate) key: ViewKey,
    pub(crate) dep: Arc<dyn Dependency>,
    pub(crate) shared: Arc<Shared>,
    pub(crate) stop: CancellationToken,
}

impl View {
    /// Run the fetch loop until stopped, retired, or hit by a fatal
    /// error. Spawned as its own task by the watcher.
    pub(crate) async fn poll(self) {
        let mut attempt: u32 = 0;
        let mut last_index: u64 = 0;
        let mut first = true;

        tracing::debug!(dep = %self.dep, "view started");

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            self.dep.set_options(QueryOptions {
                wait_index: last_index,
                wait_time: DEFAULT_QUERY_WAIT,
                default_lease: self.shared.default_lease,
                ..Default::default()
            });

            let fetched = tokio::select! {
                _ = self.stop.cancelled() => break,
                res = self.dep.fetch(&self.shared.clients) => res,
            };

            match fetched {
                Ok((value, meta)) => {
                    attempt = 0;

                    if !first && meta.last_index == last_index {
                        tracing::trace!(dep = %self.dep, index = last_index, "spurious wake, index unchanged");
                        continue;
                    }
                    if !first && meta.last_index < last_index {
                        // A lower index means the server restarted; adopt
                        // its view rather than waiting it out.
                        tracing::debug!(
                            dep = %self.dep,
                            old_index = last_index,
                            new_index = meta.last_index,
                            "index went backward, accepting new data"
                        );
                    }

                    last_index = meta.last_index;
                    first = false;
                    self.shared.publish(&self.key, value);

                    if self.shared.once {
                        tracing::debug!(dep = %self.dep, "first value received, parking view");
                        break;
                    }

                    if !meta.block {
                        let lease = meta.lease.unwrap_or_else(|| Lease {
                            duration: self.shared.default_lease,
                            ..Default::default()
                        });
                        let wait = lease_check_wait(&lease);
                        tracing::trace!(dep = %self.dep, wait = ?wait, "sleeping until next read");
                        tokio::select! {
                            _ = self.stop.cancelled() => break,
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
                Err(Error::Stopped) => break,
                Err(err) if err.is_retryable() => {
                    attempt = attempt.saturating_add(1);
                    let delay = (self.shared.retry)(attempt);
                    tracing::warn!(
                        dep = %self.dep,
                        attempt,
                        delay = ?delay,
                        error = %err,
                        "fetch failed, backing off"
                    );
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    tracing::error!(dep = %self.dep, error = %err, "fatal fetch error, retiring view");
                    self.shared.retire_with_error(&self.key, err);
                    break;
                }
            }
        }

        tracing::debug!(dep = %self.dep, "view stopped");
    }
}

/// Default retry schedule: exponential from 250ms capped at one minute,
/// with a uniform jitter spanning a quarter of the interval.
pub(crate) fn default_retry(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(16).saturating_sub(1);
    let base = RETRY_BASE_DELAY.saturating_mul(factor as u32).min(RETRY_MAX_DELAY);
    base.mul_f64(rand::thread_rng().gen_range(0.75..=1.0))
}

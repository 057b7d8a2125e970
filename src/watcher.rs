//! The watcher: owner of all live views and broker of template
//! subscriptions.
//!
//! One watcher manages the full set of dependencies referenced by the
//! templates registered on it. Views are deduplicated by dependency
//! identity, so any number of templates watching the same service share
//! one long-poll. The watcher exposes a single synchronous barrier,
//! [`Watcher::wait`], that suspends until any view publishes new data.
//!
//! # Lifecycle
//!
//! Views start lazily: the first template evaluation that looks up a
//! dependency spawns its view. Before each resolve pass the resolver
//! calls [`Watcher::mark`]; lookups re-track their dependencies; after
//! the pass [`Watcher::sweep`] retires every view the template no longer
//! references. A view is stopped once no template references it, or when
//! the whole watcher is stopped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clients::ClientSet;
use crate::constants::DEFAULT_VAULT_LEASE;
use crate::dep::{Dependency, Value};
use crate::error::Error;
use crate::store::Store;
use crate::template::{Recaller, Template};
use crate::view::{default_retry, View, ViewKey};

/// Pluggable retry schedule: maps a 1-based attempt count to the delay
/// before the next fetch.
pub type RetryFunc = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Construction parameters for [`Watcher`].
pub struct WatcherInput {
    /// Backend clients handed to dependencies at fetch time.
    pub clients: ClientSet,
    /// Cache receiving every published value.
    pub cache: Arc<Store>,
    /// Fetch each dependency once and park its view instead of
    /// long-polling forever.
    pub once: bool,
    /// Override the default exponential backoff between failed fetches.
    pub retry: Option<RetryFunc>,
    /// Fallback lease duration for secret backends that report none.
    pub vault_default_lease: Option<Duration>,
}

impl Default for WatcherInput {
    fn default() -> Self {
        Self {
            clients: ClientSet::new(),
            cache: Arc::new(Store::new()),
            once: false,
            retry: None,
            vault_default_lease: None,
        }
    }
}

struct ViewHandle {
    dep: Arc<dyn Dependency>,
    stop: CancellationToken,
    refs: HashSet<u64>,
}

#[derive(Default)]
struct TemplateState {
    template: Option<Template>,
    tracked: HashSet<ViewKey>,
    marked: HashSet<ViewKey>,
    changed: bool,
    err: Option<Error>,
}

/// State shared between the watcher handle and its view tasks.
pub(crate) struct Shared {
    pub(crate) clients: ClientSet,
    pub(crate) store: Arc<Store>,
    pub(crate) once: bool,
    pub(crate) retry: RetryFunc,
    pub(crate) default_lease: Duration,
    pub(crate) stop: CancellationToken,
    views: Mutex<HashMap<ViewKey, ViewHandle>>,
    templates: Mutex<HashMap<u64, TemplateState>>,
    signal_tx: mpsc::Sender<()>,
}

impl Shared {
    /// Subscribe `tmpl_id` to `dep`, spawning the view if absent.
    /// Idempotent.
    pub(crate) fn track(self: &Arc<Self>, tmpl_id: u64, dep: Arc<dyn Dependency>) {
        if self.stop.is_cancelled() {
            return;
        }

        let key = ViewKey::new(dep.as_ref(), tmpl_id);
        {
            let mut views = self.views.lock();
            let handle = views.entry(key.clone()).or_insert_with(|| {
                let stop = self.stop.child_token();
                let view = View {
                    key: key.clone(),
                    dep: Arc::clone(&dep),
                    shared: Arc::clone(self),
                    stop: stop.clone(),
                };
                tracing::debug!(dep = %dep, shared = dep.can_share(), "spawning view");
                tokio::spawn(view.poll());
                ViewHandle {
                    dep,
                    stop,
                    refs: HashSet::new(),
                }
            });
            handle.refs.insert(tmpl_id);
        }

        let mut templates = self.templates.lock();
        if let Some(state) = templates.get_mut(&tmpl_id) {
            state.tracked.insert(key.clone());
            state.marked.remove(&key);
        }
    }

    /// Record a freshly fetched value: save it, run each subscribed
    /// template's notifier, and pulse the change signal.
    pub(crate) fn publish(&self, key: &ViewKey, value: Value) {
        self.store.save(key.dep_id.as_str(), value.clone());

        {
            let mut templates = self.templates.lock();
            for state in templates.values_mut() {
                if !state.tracked.contains(key) && !state.marked.contains(key) {
                    continue;
                }
                if let Some(template) = &state.template {
                    if template.notify(&value) {
                        state.changed = true;
                    }
                }
            }
        }

        tracing::trace!(dep = %key.dep_id, kind = value.kind(), "published");

        // Size-1 channel; a full buffer means a wake is already pending.
        let _ = self.signal_tx.try_send(());
    }

    /// Hand a fatal fetch error to every subscribed template and drop the
    /// view.
    pub(crate) fn retire_with_error(&self, key: &ViewKey, err: Error) {
        {
            let mut templates = self.templates.lock();
            for state in templates.values_mut() {
                if state.tracked.contains(key) || state.marked.contains(key) {
                    state.err.get_or_insert_with(|| err.clone());
                    state.changed = true;
                }
            }
        }
        if let Some(handle) = self.views.lock().remove(key) {
            self.retire(handle);
        }
        let _ = self.signal_tx.try_send(());
    }

    fn retire(&self, handle: ViewHandle) {
        handle.stop.cancel();
        handle.dep.stop();
    }
}

/// Manager of concurrent, deduplicated views over remote dependencies.
pub struct Watcher {
    shared: Arc<Shared>,
    signal_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl Watcher {
    /// Create a watcher from its input bundle.
    pub fn new(input: WatcherInput) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(1);
        Self {
            shared: Arc::new(Shared {
                clients: input.clients,
                store: input.cache,
                once: input.once,
                retry: input.retry.unwrap_or_else(|| Arc::new(default_retry)),
                default_lease: input.vault_default_lease.unwrap_or(DEFAULT_VAULT_LEASE),
                stop: CancellationToken::new(),
                views: Mutex::new(HashMap::new()),
                templates: Mutex::new(HashMap::new()),
                signal_tx,
            }),
            signal_rx: tokio::sync::Mutex::new(signal_rx),
        }
    }

    /// Record a template subscription. Views start lazily on the first
    /// resolve pass that looks up their dependency; registering never
    /// spawns anything.
    pub fn register(&self, tmpl: &Template) {
        let mut templates = self.shared.templates.lock();
        let state = templates.entry(tmpl.id()).or_insert_with(|| TemplateState {
            changed: true,
            ..Default::default()
        });
        state.template.get_or_insert_with(|| tmpl.clone());
    }

    /// Whether any view touched by `tmpl` has published since the last
    /// `changed` read. Consuming: the flag resets to `false`.
    ///
    /// A template that was never registered or never resolved reports
    /// `true` so its first pass always executes.
    pub fn changed(&self, tmpl: &Template) -> bool {
        let mut templates = self.shared.templates.lock();
        match templates.get_mut(&tmpl.id()) {
            Some(state) => std::mem::take(&mut state.changed),
            None => true,
        }
    }

    /// Snapshot the template's tracked set ahead of a resolve pass;
    /// [`sweep`](Watcher::sweep) retires whatever the pass did not
    /// re-track.
    pub fn mark(&self, tmpl: &Template) {
        let mut templates = self.shared.templates.lock();
        if let Some(state) = templates.get_mut(&tmpl.id()) {
            state.marked = state.tracked.clone();
        }
    }

    /// Retire every view the last resolve pass stopped referencing.
    pub fn sweep(&self, tmpl: &Template) {
        let unused: Vec<ViewKey> = {
            let mut templates = self.shared.templates.lock();
            match templates.get_mut(&tmpl.id()) {
                Some(state) => {
                    let unused = std::mem::take(&mut state.marked);
                    for key in &unused {
                        state.tracked.remove(key);
                    }
                    unused.into_iter().collect()
                }
                None => return,
            }
        };

        let mut views = self.shared.views.lock();
        for key in unused {
            let retired = match views.get_mut(&key) {
                Some(handle) => {
                    handle.refs.remove(&tmpl.id());
                    handle.refs.is_empty()
                }
                None => false,
            };
            if retired {
                if let Some(handle) = views.remove(&key) {
                    tracing::debug!(dep = %key.dep_id, "retiring unreferenced view");
                    self.shared.retire(handle);
                }
            }
        }
    }

    /// Suspend until any view publishes a change.
    ///
    /// Returns `Ok(())` on the first change notification and
    /// [`Error::WatcherStopped`] once [`stop`](Watcher::stop) has been
    /// called. Callers cancel a pending wait the usual way, by dropping
    /// or racing the future.
    pub async fn wait(&self) -> Result<(), Error> {
        if self.shared.stop.is_cancelled() {
            return Err(Error::WatcherStopped);
        }
        let mut rx = self.signal_rx.lock().await;
        tokio::select! {
            _ = self.shared.stop.cancelled() => Err(Error::WatcherStopped),
            received = rx.recv() => match received {
                Some(()) => Ok(()),
                None => Err(Error::WatcherStopped),
            },
        }
    }

    /// Retire all views and release their dependencies. Idempotent; any
    /// blocked [`wait`](Watcher::wait) returns [`Error::WatcherStopped`].
    pub fn stop(&self) {
        if self.shared.stop.is_cancelled() {
            return;
        }
        self.shared.stop.cancel();

        let handles: Vec<ViewHandle> = {
            let mut views = self.shared.views.lock();
            views.drain().map(|(_, handle)| handle).collect()
        };
        let count = handles.len();
        for handle in handles {
            self.shared.retire(handle);
        }
        self.shared.templates.lock().clear();

        tracing::debug!(views = count, "watcher stopped");
    }

    /// Number of live views.
    pub fn size(&self) -> usize {
        self.shared.views.lock().len()
    }

    /// The cache receiving published values.
    pub fn cache(&self) -> &Arc<Store> {
        &self.shared.store
    }

    /// A recaller that tracks `tmpl`'s lookups against this watcher and
    /// serves them from the cache. Registers the template if needed.
    pub fn recaller(&self, tmpl: &Template) -> Arc<dyn Recaller> {
        self.register(tmpl);
        Arc::new(WatcherRecaller {
            shared: Arc::clone(&self.shared),
            tmpl_id: tmpl.id(),
        })
    }

    /// Take the pending fatal error for `tmpl`, if a view it references
    /// retired itself since the last resolve pass.
    pub(crate) fn take_error(&self, tmpl: &Template) -> Option<Error> {
        let mut templates = self.shared.templates.lock();
        templates.get_mut(&tmpl.id()).and_then(|s| s.err.take())
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WatcherRecaller {
    shared: Arc<Shared>,
    tmpl_id: u64,
}

impl Recaller for WatcherRecaller {
    fn recall(&self, dep: Arc<dyn Dependency>) -> Option<Value> {
        let id = dep.id();
        self.shared.track(self.tmpl_id, dep);
        self.shared.store.recall(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateInput;
    use crate::test_utils::TestDependency;

    fn watcher() -> Watcher {
        Watcher::new(WatcherInput::default())
    }

    fn template() -> Template {
        Template::new(TemplateInput::default())
    }

    #[tokio::test]
    async fn test_track_dedups_shareable_views() {
        let w = watcher();
        let t1 = template();
        let t2 = template();
        w.register(&t1);
        w.register(&t2);

        let dep = TestDependency::new("db").shared();
        w.shared.track(t1.id(), Arc::clone(&dep));
        w.shared.track(t2.id(), Arc::clone(&dep));
        w.shared.track(t1.id(), dep);

        assert_eq!(w.size(), 1);
    }

    #[tokio::test]
    async fn test_track_splits_unshareable_views() {
        let w = watcher();
        let t1 = template();
        let t2 = template();
        w.register(&t1);
        w.register(&t2);

        let dep = Arc::new(TestDependency::new("token").unshareable());
        w.shared.track(t1.id(), dep.clone() as Arc<dyn Dependency>);
        w.shared.track(t2.id(), dep as Arc<dyn Dependency>);

        assert_eq!(w.size(), 2);
    }

    #[tokio::test]
    async fn test_mark_sweep_retires_untracked() {
        let w = watcher();
        let t = template();
        w.register(&t);

        let dep = TestDependency::new("web").shared();
        w.shared.track(t.id(), dep);
        assert_eq!(w.size(), 1);

        // Re-tracked between mark and sweep: survives.
        w.mark(&t);
        let dep = TestDependency::new("web").shared();
        w.shared.track(t.id(), dep);
        w.sweep(&t);
        assert_eq!(w.size(), 1);

        // Not re-tracked: retired.
        w.mark(&t);
        w.sweep(&t);
        assert_eq!(w.size(), 0);
    }

    #[tokio::test]
    async fn test_sweep_keeps_views_still_referenced_elsewhere() {
        let w = watcher();
        let t1 = template();
        let t2 = template();
        w.register(&t1);
        w.register(&t2);

        let dep = TestDependency::new("db").shared();
        w.shared.track(t1.id(), Arc::clone(&dep));
        w.shared.track(t2.id(), dep);

        w.mark(&t1);
        w.sweep(&t1);
        assert_eq!(w.size(), 1, "t2 still references the view");

        w.mark(&t2);
        w.sweep(&t2);
        assert_eq!(w.size(), 0);
    }

    #[tokio::test]
    async fn test_changed_is_consuming() {
        let w = watcher();
        let t = template();
        w.register(&t);

        assert!(w.changed(&t), "first read is true for a fresh template");
        assert!(!w.changed(&t), "second read consumed the flag");

        let dep = TestDependency::new("db").shared();
        let key = ViewKey::new(dep.as_ref(), t.id());
        w.shared.track(t.id(), dep);
        w.shared.publish(&key, Value::KvExists(true));

        assert!(w.changed(&t));
        assert!(!w.changed(&t));
    }

    #[tokio::test]
    async fn test_publish_skips_untracking_templates() {
        let w = watcher();
        let tracker = template();
        let bystander = template();
        w.register(&tracker);
        w.register(&bystander);
        // Drain the initial flags.
        assert!(w.changed(&tracker));
        assert!(w.changed(&bystander));

        let dep = TestDependency::new("db").shared();
        let key = ViewKey::new(dep.as_ref(), tracker.id());
        w.shared.track(tracker.id(), dep);
        w.shared.publish(&key, Value::KvExists(true));

        assert!(w.changed(&tracker));
        assert!(!w.changed(&bystander));
    }

    #[tokio::test]
    async fn test_wait_returns_on_publish() {
        let w = watcher();
        let t = template();
        w.register(&t);

        let dep = TestDependency::new("db").shared();
        let key = ViewKey::new(dep.as_ref(), t.id());
        w.shared.track(t.id(), dep);

        w.shared.publish(&key, Value::KvExists(true));
        tokio::time::timeout(Duration::from_secs(1), w.wait())
            .await
            .expect("wait should not block with a pending signal")
            .expect("wait should succeed");
    }

    #[tokio::test]
    async fn test_wait_after_stop() {
        let w = watcher();
        w.stop();
        assert!(matches!(w.wait().await, Err(Error::WatcherStopped)));
        // stop is idempotent
        w.stop();
    }

    #[tokio::test]
    async fn test_stop_stops_dependencies() {
        let w = watcher();
        let t = template();
        w.register(&t);

        let dep = Arc::new(TestDependency::new("db"));
        w.shared.track(t.id(), dep.clone() as Arc<dyn Dependency>);
        assert!(!dep.stopped());

        w.stop();
        assert!(dep.stopped());
        assert_eq!(w.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_retries_transient_errors() {
        let w = watcher();
        let t = template();
        w.register(&t);

        let dep = Arc::new(TestDependency::new("flaky"));
        dep.fail_with(Error::TransportRetryable {
            operation: "kv".to_string(),
            reason: "connection refused".to_string(),
        });
        w.shared.track(t.id(), dep.clone() as Arc<dyn Dependency>);

        // The first fetch fails; the view backs off and then succeeds.
        tokio::time::timeout(Duration::from_secs(120), w.wait())
            .await
            .expect("view never recovered")
            .expect("wait failed");
        assert!(w.cache().recall("test.dep(flaky)").is_some());
        assert_eq!(w.size(), 1, "a retrying view is not retired");
    }

    #[tokio::test]
    async fn test_retire_with_error_surfaces_on_template() {
        let w = watcher();
        let t = template();
        w.register(&t);

        let dep = TestDependency::new("db").shared();
        let key = ViewKey::new(dep.as_ref(), t.id());
        w.shared.track(t.id(), dep);

        w.shared.retire_with_error(
            &key,
            Error::TransportFatal {
                operation: "kv".to_string(),
                reason: "permission denied".to_string(),
            },
        );

        assert_eq!(w.size(), 0);
        assert!(matches!(
            w.take_error(&t),
            Some(Error::TransportFatal { .. })
        ));
        assert!(w.take_error(&t).is_none(), "error is taken once");
    }
}

//! Templates and their evaluation against cached dependency values.
//!
//! A [`Template`] pairs template source text with a [`Notifier`]
//! strategy deciding which value changes should retrigger evaluation.
//! Evaluation is a pure function of the cache: [`Template::execute`]
//! renders the source with a fresh engine instance, looking dependencies
//! up through a [`Recaller`] and returning the output together with the
//! sets of dependency identities that were *used* and *missing* during
//! the pass. Execution never blocks; a missing dependency contributes
//! its zero-form so rendering can continue and report every miss at
//! once.
//!
//! Templates are cheap to clone and safe to share: all clones refer to
//! the same instance, identified by [`Template::id`].

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tera::Tera;

use crate::dep::{Dependency, Value};
use crate::error::Error;

pub mod funcs;

pub(crate) use funcs::ExecState;

static NEXT_TEMPLATE_ID: AtomicU64 = AtomicU64::new(1);

/// Serves dependency lookups during template evaluation.
///
/// The watcher's recaller subscribes the template to the dependency and
/// reads the shared cache; a bare [`Store`] also implements this for
/// evaluating templates without a watcher.
///
/// [`Store`]: crate::store::Store
pub trait Recaller: Send + Sync {
    /// The current value for `dep`, or `None` when nothing has been
    /// fetched yet.
    fn recall(&self, dep: Arc<dyn Dependency>) -> Option<Value>;
}

impl Recaller for crate::store::Store {
    fn recall(&self, dep: Arc<dyn Dependency>) -> Option<Value> {
        crate::store::Store::recall(self, &dep.id())
    }
}

/// Decides which published values should retrigger a template.
///
/// The watcher invokes the notifier on every publish of a value the
/// template uses; returning `false` leaves the template unchanged so
/// unrelated churn does not cause re-renders.
pub trait Notifier: Send + Sync {
    /// Whether `value` warrants re-evaluating the template.
    fn notify(&self, value: &Value) -> bool;
}

/// The default notifier: every change retriggers.
pub struct AcceptAll;

impl Notifier for AcceptAll {
    fn notify(&self, _value: &Value) -> bool {
        true
    }
}

/// Construction parameters for [`Template`].
pub struct TemplateInput {
    /// Template source text.
    pub contents: String,
    /// Change-notification strategy; defaults to [`AcceptAll`].
    pub notifier: Option<Box<dyn Notifier>>,
    /// Extra functions merged into the engine for this template, keyed
    /// by the name they are callable under. Registering over a built-in
    /// name shadows it; see [`funcs::deny_function`].
    pub functions: HashMap<String, Arc<dyn tera::Function>>,
}

impl Default for TemplateInput {
    fn default() -> Self {
        Self {
            contents: String::new(),
            notifier: None,
            functions: HashMap::new(),
        }
    }
}

/// The result of one template execution.
#[derive(Debug)]
pub struct ExecuteResult {
    /// Rendered output.
    pub output: String,
    /// Identities of dependencies that had no cached value.
    pub missing: BTreeSet<String>,
    /// Identities of every dependency the pass looked up.
    pub used: BTreeSet<String>,
}

#[derive(Default)]
struct RenderState {
    last_contents: Option<String>,
    last_complete: bool,
}

struct Inner {
    id: u64,
    contents: String,
    notifier: Box<dyn Notifier>,
    functions: HashMap<String, Arc<dyn tera::Function>>,
    state: Mutex<RenderState>,
}

/// A template whose values are drawn from watched dependencies.
#[derive(Clone)]
pub struct Template {
    inner: Arc<Inner>,
}

impl Template {
    /// Create a template from its input bundle.
    pub fn new(input: TemplateInput) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_TEMPLATE_ID.fetch_add(1, Ordering::Relaxed),
                contents: input.contents,
                notifier: input.notifier.unwrap_or_else(|| Box::new(AcceptAll)),
                functions: input.functions,
                state: Mutex::new(RenderState::default()),
            }),
        }
    }

    /// Unique instance identifier. Clones share it.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The template source text.
    pub fn contents(&self) -> &str {
        &self.inner.contents
    }

    /// Render once against `recaller`, reporting used and missing
    /// dependencies.
    pub fn execute(&self, recaller: Arc<dyn Recaller>) -> Result<ExecuteResult, Error> {
        let state = ExecState::new(recaller);

        // A fresh engine per execution keeps the dependency functions
        // bound to this pass's miss-tracking state.
        let mut tera = Tera::default();
        funcs::register_functions(&mut tera, &state);
        funcs::register_filters(&mut tera);
        for (name, function) in &self.inner.functions {
            tera.register_function(name, SharedFunction(Arc::clone(function)));
        }

        tracing::trace!(template = self.inner.id, "executing template");
        let output = tera
            .render_str(&self.inner.contents, &tera::Context::new())
            .map_err(|e| Error::template_exec(&e))?;

        Ok(ExecuteResult {
            output,
            missing: state.missing(),
            used: state.used(),
        })
    }

    pub(crate) fn notify(&self, value: &Value) -> bool {
        self.inner.notifier.notify(value)
    }

    /// Completeness and contents of the last pass, for short-circuiting
    /// when nothing changed.
    pub(crate) fn last_render(&self) -> (bool, String) {
        let state = self.inner.state.lock();
        if state.last_complete {
            (true, state.last_contents.clone().unwrap_or_default())
        } else {
            (false, String::new())
        }
    }

    pub(crate) fn record_incomplete(&self) {
        self.inner.state.lock().last_complete = false;
    }

    /// Record a complete pass; returns whether the output differs from
    /// the previous complete pass.
    pub(crate) fn record_complete(&self, output: &str) -> bool {
        let mut state = self.inner.state.lock();
        let changed = !(state.last_complete && state.last_contents.as_deref() == Some(output));
        state.last_contents = Some(output.to_string());
        state.last_complete = true;
        changed
    }
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("id", &self.inner.id)
            .field("contents", &self.inner.contents)
            .finish()
    }
}

struct SharedFunction(Arc<dyn tera::Function>);

impl tera::Function for SharedFunction {
    fn call(&self, args: &HashMap<String, tera::Value>) -> tera::Result<tera::Value> {
        self.0.call(args)
    }

    fn is_safe(&self) -> bool {
        self.0.is_safe()
    }
}

//! The resolver: drives a template to a fixed point, one pass at a time.
//!
//! A resolver is stateless; any number may share a watcher. One call to
//! [`Resolver::run`] performs a single resolve pass and never suspends.
//! Callers loop `run -> wait -> run` until the returned [`ResolveEvent`]
//! reports completion:
//!
//! ```no_run
//! # async fn example(tmpl: lookout::Template, watcher: lookout::Watcher)
//! #     -> Result<String, lookout::Error> {
//! let resolver = lookout::Resolver::new();
//! loop {
//!     let event = resolver.run(&tmpl, &watcher)?;
//!     if event.complete {
//!         return Ok(event.contents);
//!     }
//!     watcher.wait().await?;
//! }
//! # }
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::constants::STALE_RECALL_THRESHOLD;
use crate::error::Error;
use crate::template::Template;
use crate::watcher::Watcher;

/// The outcome of one resolve pass.
#[derive(Debug, Clone, Default)]
pub struct ResolveEvent {
    /// Whether the pass produced no missing values.
    pub complete: bool,
    /// Whether the output is identical to the previous complete pass.
    pub no_change: bool,
    /// Rendered output; only meaningful when `complete` is true.
    pub contents: String,
}

/// Evaluates templates against a watcher until they settle.
#[derive(Debug, Clone, Copy, Default)]
pub struct Resolver;

impl Resolver {
    /// Create a resolver.
    pub fn new() -> Self {
        Self
    }

    /// Run one resolve pass of `tmpl` against `watcher`.
    ///
    /// Must be called from within a Tokio runtime: first-time lookups
    /// spawn view tasks on it.
    ///
    /// # Errors
    ///
    /// Returns the pending fatal error of any view the template
    /// references, or [`Error::TemplateExec`] when evaluation itself
    /// fails (including panics out of user-supplied functions).
    pub fn run(&self, tmpl: &Template, watcher: &Watcher) -> Result<ResolveEvent, Error> {
        if let Some(err) = watcher.take_error(tmpl) {
            return Err(err);
        }

        // Nothing the template depends on published since the last pass;
        // replay the previous outcome instead of re-rendering.
        if !watcher.changed(tmpl) {
            let (complete, contents) = tmpl.last_render();
            tracing::trace!(template = tmpl.id(), complete, "no change, skipping execution");
            return Ok(ResolveEvent {
                complete,
                no_change: true,
                contents,
            });
        }

        watcher.mark(tmpl);
        let recaller = watcher.recaller(tmpl);
        let outcome = catch_unwind(AssertUnwindSafe(|| tmpl.execute(recaller)));
        watcher.sweep(tmpl);

        let result = match outcome {
            Ok(result) => result?,
            Err(panic) => {
                return Err(Error::TemplateExec {
                    reason: panic_reason(panic.as_ref()),
                })
            }
        };

        if !result.missing.is_empty() {
            for id in &result.missing {
                let recalls = watcher.cache().recall_count(id);
                if recalls >= STALE_RECALL_THRESHOLD {
                    tracing::warn!(
                        dep = %id,
                        recalls,
                        "dependency has never published; template may never settle"
                    );
                }
            }
            tracing::debug!(
                template = tmpl.id(),
                missing = result.missing.len(),
                used = result.used.len(),
                "resolve pass incomplete"
            );
            tmpl.record_incomplete();
            return Ok(ResolveEvent {
                complete: false,
                ..Default::default()
            });
        }

        let changed = tmpl.record_complete(&result.output);
        tracing::debug!(template = tmpl.id(), changed, "resolve pass complete");
        Ok(ResolveEvent {
            complete: true,
            no_change: !changed,
            contents: result.output,
        })
    }
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panic in template function: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panic in template function: {msg}")
    } else {
        "panic in template function".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::template::{funcs, TemplateInput};
    use crate::watcher::WatcherInput;

    #[tokio::test]
    async fn test_run_plain_template_completes() {
        let watcher = Watcher::new(WatcherInput::default());
        let tmpl = Template::new(TemplateInput {
            contents: "static".to_string(),
            ..Default::default()
        });
        watcher.register(&tmpl);

        let event = Resolver::new().run(&tmpl, &watcher).unwrap();
        assert!(event.complete);
        assert!(!event.no_change);
        assert_eq!(event.contents, "static");
    }

    #[tokio::test]
    async fn test_run_twice_reports_no_change() {
        let watcher = Watcher::new(WatcherInput::default());
        let tmpl = Template::new(TemplateInput {
            contents: "static".to_string(),
            ..Default::default()
        });
        watcher.register(&tmpl);

        let resolver = Resolver::new();
        let first = resolver.run(&tmpl, &watcher).unwrap();
        let second = resolver.run(&tmpl, &watcher).unwrap();
        assert!(second.complete);
        assert!(second.no_change);
        assert_eq!(second.contents, first.contents);
    }

    #[tokio::test]
    async fn test_run_surfaces_template_errors() {
        let watcher = Watcher::new(WatcherInput::default());
        let tmpl = Template::new(TemplateInput {
            contents: "{% endfor %}".to_string(),
            ..Default::default()
        });
        watcher.register(&tmpl);

        let err = Resolver::new().run(&tmpl, &watcher).unwrap_err();
        assert!(matches!(err, Error::TemplateExec { .. }));
    }

    #[tokio::test]
    async fn test_run_converts_function_panic() {
        let panicking: Arc<dyn tera::Function> = Arc::new(
            |_: &HashMap<String, tera::Value>| -> tera::Result<tera::Value> {
                panic!("boom");
            },
        );
        let mut functions = HashMap::new();
        functions.insert("explode".to_string(), panicking);

        let watcher = Watcher::new(WatcherInput::default());
        let tmpl = Template::new(TemplateInput {
            contents: "{{ explode() }}".to_string(),
            functions,
            ..Default::default()
        });
        watcher.register(&tmpl);

        let err = Resolver::new().run(&tmpl, &watcher).unwrap_err();
        match err {
            Error::TemplateExec { reason } => assert!(reason.contains("boom")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deny_function_is_usable() {
        let mut functions = HashMap::new();
        functions.insert("secrets".to_string(), funcs::deny_function());

        let watcher = Watcher::new(WatcherInput::default());
        let tmpl = Template::new(TemplateInput {
            contents: r#"{{ secrets(path="secret/") }}"#.to_string(),
            functions,
            ..Default::default()
        });
        watcher.register(&tmpl);

        assert!(Resolver::new().run(&tmpl, &watcher).is_err());
    }
}

//! Lookout - template rendering driven by watched remote data
//!
//! Lookout renders text templates whose substitution values live in
//! remote, mutable sources (service catalogs, key/value stores, secret
//! stores). A template references an unknown set of remote values; those
//! values are fetched, cached, watched for change, and replayed through
//! the template until a pass settles with nothing missing.
//!
//! # Architecture Overview
//!
//! Data flows bottom-up through four subsystems:
//!
//! - [`dep`] - dependencies: addressable, pollable handles to one piece
//!   of external state, with a blocking-query (long-poll) contract
//! - views (internal) - one serial fetch loop per live dependency,
//!   publishing values whose index advanced
//! - [`store`] - the in-memory cache mapping dependency identities to
//!   their most recent values
//! - [`watcher`] - owner of all views, deduplicating them across
//!   templates and signalling change
//! - [`resolver`] - drives a [`template`] through repeated passes until
//!   it renders completely
//!
//! ```text
//! Dependency --poll--> View --push--> Store --lookup--> Template
//!     ^                 |                                   |
//!     +---- stop -------+          Watcher <--- register ---+
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lookout::{ClientSet, Resolver, Store, Template, TemplateInput, Watcher, WatcherInput};
//!
//! # async fn example(clients: ClientSet) -> Result<(), lookout::Error> {
//! let watcher = Watcher::new(WatcherInput {
//!     clients,
//!     cache: Arc::new(Store::new()),
//!     ..Default::default()
//! });
//! let tmpl = Template::new(TemplateInput {
//!     contents: r#"{% for s in service(name="web") %}{{ s.address }}{% endfor %}"#.into(),
//!     ..Default::default()
//! });
//! watcher.register(&tmpl);
//!
//! let resolver = Resolver::new();
//! let contents = loop {
//!     let event = resolver.run(&tmpl, &watcher)?;
//!     if event.complete {
//!         break event.contents;
//!     }
//!     watcher.wait().await?;
//! };
//! # drop(contents);
//! # Ok(())
//! # }
//! ```
//!
//! Backend clients are out of scope: implement
//! [`clients::ConsulBackend`] / [`clients::VaultBackend`] over your HTTP
//! clients of choice, or use the in-memory fakes in [`test_utils`]
//! (feature `test-utils`).

// Core subsystems
pub mod clients;
pub mod dep;
pub mod resolver;
pub mod store;
pub mod template;
pub mod watcher;

// Supporting modules
pub mod constants;
pub mod error;
pub mod renderer;

mod view;

// Available to unit tests and, via the `test-utils` feature, to
// integration tests and downstream harnesses.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use clients::ClientSet;
pub use error::Error;
pub use renderer::FileRenderer;
pub use resolver::{ResolveEvent, Resolver};
pub use store::Store;
pub use template::{ExecuteResult, Notifier, Recaller, Template, TemplateInput};
pub use watcher::{RetryFunc, Watcher, WatcherInput};

//! Escalating resolver
//!
//! Tries groups of probes in order. All probes of a group run concurrently;
//! the first group whose probes all succeed wins and later groups are never
//! started. Used to pick a working upstream provider without walking the
//! candidates strictly one request at a time.

use std::fmt::Display;
use std::future::Future;

use futures::future::{join_all, BoxFuture, FutureExt};

use crate::error::{GroupFailure, ResolveError};

type Probe = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), String>> + Send>;

pub struct ProbeGroup<T> {
    name: String,
    probes: Vec<Probe>,
    on_resolve: Box<dyn FnOnce() -> T + Send>,
}

impl<T> ProbeGroup<T> {
    /// `on_resolve` produces the value returned if this group wins.
    pub fn new(name: impl Into<String>, on_resolve: impl FnOnce() -> T + Send + 'static) -> Self {
        Self {
            name: name.into(),
            probes: Vec::new(),
            on_resolve: Box::new(on_resolve),
        }
    }

    /// Add a probe. It is only invoked if the group is reached.
    pub fn probe<F, Fut, E>(mut self, probe: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + 'static,
    {
        self.probes.push(Box::new(move || {
            async move { probe().await.map_err(|e| e.to_string()) }.boxed()
        }));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Resolve to the first group whose probes all succeed.
///
/// A group without probes succeeds immediately.
pub async fn resolve_by_probing<T>(groups: Vec<ProbeGroup<T>>) -> Result<T, ResolveError> {
    let mut failures = Vec::new();

    for group in groups {
        let ProbeGroup {
            name,
            probes,
            on_resolve,
        } = group;

        let results = join_all(probes.into_iter().map(|probe| probe())).await;
        let errors: Vec<String> = results.into_iter().filter_map(Result::err).collect();

        if errors.is_empty() {
            log::info!("Resolved provider group '{}'", name);
            return Ok(on_resolve());
        }

        log::warn!("Probe group '{}' failed: {}", name, errors.join("; "));
        failures.push(GroupFailure {
            group: name,
            errors,
        });
    }

    Err(ResolveError { failures })
}

//! Ordered release of resources acquired while connecting.

use crate::error::McpResult;
use futures::future::BoxFuture;
use std::future::Future;
use tracing::{debug, warn};

type Release = Box<dyn FnOnce() -> BoxFuture<'static, McpResult<()>> + Send>;

/// A stack of async release actions, unwound last-in first-out.
#[derive(Default)]
pub struct CleanupStack {
    entries: Vec<(String, Release)>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a release action for a resource just acquired.
    pub fn push<F, Fut>(&mut self, label: impl Into<String>, release: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = McpResult<()>> + Send + 'static,
    {
        self.entries
            .push((label.into(), Box::new(move || Box::pin(release()))));
    }

    /// Run every release in reverse order of registration.
    ///
    /// Errors are logged, never returned.
    pub async fn unwind(&mut self) {
        while let Some((label, release)) = self.entries.pop() {
            match release().await {
                Ok(()) => debug!(resource = %label, "Released"),
                Err(e) if e.is_cancellation() => {
                    debug!(resource = %label, error = %e, "Already released");
                }
                Err(e) => warn!(resource = %label, error = %e, "Failed to release resource"),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(label, _)| label))
            .finish()
    }
}

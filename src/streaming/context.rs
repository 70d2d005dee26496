//! Reuse-or-replace rotation for the compile/upload context.

use std::sync::Arc;

use crate::scene::{CompletionToken, ContextHandle, UploadBackend};

/// Lease manager for the upload context used by one compiler thread.
///
/// A context is leased for exactly one batch. `try_reuse` hands the
/// previous context back only when the backend reports its batch token
/// as settled; otherwise the caller allocates a fresh context instead of
/// blocking on GPU progress, and the busy one is abandoned to the
/// backend.
pub struct ContextRotation {
    backend: Arc<dyn UploadBackend>,
    current: Option<(ContextHandle, CompletionToken)>,
}

impl ContextRotation {
    pub fn new(backend: Arc<dyn UploadBackend>) -> Self {
        Self {
            backend,
            current: None,
        }
    }

    /// The previously retired context, if its last batch has settled.
    pub fn try_reuse(&mut self) -> Option<ContextHandle> {
        let (context, token) = self.current.take()?;
        if self.backend.context_reusable(token) {
            Some(context)
        } else {
            self.current = Some((context, token));
            None
        }
    }

    /// A fresh context from the backend. Never blocks.
    pub fn allocate(&mut self) -> ContextHandle {
        self.backend.create_context()
    }

    /// Park `context` with the token of the batch it just dispatched.
    pub fn retire(&mut self, context: ContextHandle, token: CompletionToken) {
        self.current = Some((context, token));
    }
}

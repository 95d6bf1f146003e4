//! Dispatch Seam to the Mailbox Runtime
//!
//! Accepted messages are handed to subscriber callbacks through a
//! [`Dispatcher`]. The real implementation is the external actor/mailbox
//! runtime, which decides what execution context runs the handler;
//! [`InlineDispatcher`] runs it immediately on the calling context, which
//! is what unit tests and single-threaded embeddings use.

/// Hands subscriber callbacks to whatever execution context the hosting
/// runtime assigns.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs handlers synchronously on the calling context.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn inline_dispatcher_runs_immediately() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        InlineDispatcher.dispatch(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
    }
}

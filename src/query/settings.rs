use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::psf::RecordId;

/// Cooperative cancellation flag shared between a query and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Called with `(key_type, predicate)` indexes when a sub-stream runs out;
/// returning `true` ends the query.
pub type CancelOnEos = Arc<dyn Fn(usize, usize) -> bool + Send + Sync>;

/// Per-query settings.
#[derive(Clone, Default)]
pub struct QuerySettings {
    pub cancel: CancelToken,
    pub cancel_on_eos: Option<CancelOnEos>,
    /// Only ids strictly greater than this are returned.
    pub start_after: Option<RecordId>,
}

impl QuerySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_cancel_on_eos<F>(mut self, f: F) -> Self
    where
        F: Fn(usize, usize) -> bool + Send + Sync + 'static,
    {
        self.cancel_on_eos = Some(Arc::new(f));
        self
    }

    /// Ends the query as soon as any sub-stream is exhausted. Only correct
    /// for combinators that require every predicate to match.
    pub fn stop_on_exhausted() -> Self {
        Self::new().with_cancel_on_eos(|_, _| true)
    }

    pub fn start_after(mut self, record_id: RecordId) -> Self {
        self.start_after = Some(record_id);
        self
    }

    pub(crate) fn should_stop_on_eos(&self, key_type: usize, predicate: usize) -> bool {
        self.cancel_on_eos
            .as_ref()
            .is_some_and(|f| f(key_type, predicate))
    }
}

impl fmt::Debug for QuerySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySettings")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("cancel_on_eos", &self.cancel_on_eos.is_some())
            .field("start_after", &self.start_after)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_is_shared_by_clones() {
        let token = CancelToken::new();
        let settings = QuerySettings::new().with_cancel(token.clone());
        assert!(!settings.cancel.is_cancelled());

        token.cancel();
        assert!(settings.cancel.is_cancelled());
    }

    #[test]
    fn test_cancel_on_eos() {
        assert!(!QuerySettings::new().should_stop_on_eos(0, 0));
        assert!(QuerySettings::stop_on_exhausted().should_stop_on_eos(1, 2));

        let settings = QuerySettings::new().with_cancel_on_eos(|key_type, _| key_type == 1);
        assert!(!settings.should_stop_on_eos(0, 0));
        assert!(settings.should_stop_on_eos(1, 0));
    }
}

//! Cooperative cancellation flag.
//!
//! Long extraction/embedding loops poll the flag between items and bail
//! out with a cancellation error rather than killing work mid-item.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct CancelFlag {
    inner: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }

    /// Error out if cancellation was requested.
    pub fn check(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            anyhow::bail!("cancelled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_propagates_across_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(flag.check().is_ok());
        clone.cancel();
        assert!(flag.is_cancelled());
        assert!(flag.check().is_err());
    }
}

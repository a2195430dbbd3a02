use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

/// Caller-owned cancellation flag, shared by cloning.
///
/// Training polls it between templates, detection between windows. Once
/// fired, the running stage returns [`Error::Cancelled`] and no downstream
/// stage runs; nothing partially trained is handed back.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    fired: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.fired.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.fired.load(Ordering::Relaxed)
    }

    /// `Err(Cancelled)` once fired, for `?` in stage loops.
    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_starts_clear() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_cancel_token_clones_share_the_flag() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(matches!(clone.check(), Err(Error::Cancelled)));
    }
}

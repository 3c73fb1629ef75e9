use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use crate::error::SandboxError;

/// Cooperative cancellation token shared across threads.
///
/// Every blocking wait in the launcher (downloads, console matching,
/// subprocess polling, VM state waits) checks this token and returns
/// `SandboxError::Cancelled` once it is set.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Bail with `SandboxError::Cancelled` if the token is set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(SandboxError::Cancelled.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_token_is_not_cancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_cancel_is_sticky_and_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        let err = token.check().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SandboxError>(),
            Some(SandboxError::Cancelled)
        ));
    }
}

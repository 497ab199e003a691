use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::Error;

/// Handler to receive notifications for events during transfers.
///
/// All methods are optional.
#[expect(unused_variables)]
pub trait EventHandler: Send + Sync + 'static {
    /// HTTP request sent to a registry.
    fn registry_request(&self, method: &str, url: &str) {}

    /// Registry requires an [authentication token][token].
    ///
    /// [token]: https://distribution.github.io/distribution/spec/auth/token/
    fn registry_auth(&self, url: &str) {}

    /// Some blob data (in `bytes`) has been received.
    ///
    /// This method is invoked very frequently.
    fn download_progress(&self, bytes: usize) {}

    /// Some blob data (in `bytes`) has been sent.
    fn upload_progress(&self, bytes: usize) {}
}

/// [`EventHandler`] instance to ignore all events.
pub struct NoEventHandler;

impl EventHandler for NoEventHandler {}

/// Cooperative cancellation handle.
///
/// Clones share the same flag; any clone can cancel the operations
/// that were built with it. Cancellation surfaces as
/// [`Error::Cancelled`], never as a transport error.
#[derive(Clone, Default, Debug)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<(), Error> {
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
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let clone = token.clone();

        assert!(token.check().is_ok());

        clone.cancel();

        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }
}

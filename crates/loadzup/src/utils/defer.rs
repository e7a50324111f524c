use std::fmt;

/// Runs a closure exactly once when dropped, unless it was [disarmed](Self::disarm).
///
/// The closure is boxed so guards can be stored in structs and moved across threads
/// without carrying a closure type parameter around.
pub struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + Sync + 'static>>,
}

impl CallOnDrop {
    pub fn new<F: FnOnce() + Send + Sync + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }

    /// Drops the guard without running its closure.
    pub fn disarm(mut self) {
        self.f.take();
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f()
        }
    }
}

impl fmt::Debug for CallOnDrop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOnDrop")
            .field("armed", &self.f.is_some())
            .finish()
    }
}

use std::fmt;

/// Handle to a live listener registration. Dropping the handle keeps the
/// listener alive; only [`Subscription::dispose`] removes it.
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Subscription {
            dispose: Some(Box::new(dispose)),
        }
    }

    pub fn dispose(mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("live", &self.dispose.is_some())
            .finish()
    }
}

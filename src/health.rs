use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Whether the listener is up and accepting requests. Flipped on once the
/// socket is bound and off again when shutdown begins.
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_is_shared_between_clones() {
        let readiness = Readiness::new();
        let observer = readiness.clone();
        assert!(!observer.is_ready());

        readiness.set_ready(true);
        assert!(observer.is_ready());

        readiness.set_ready(false);
        assert!(!observer.is_ready());
    }
}

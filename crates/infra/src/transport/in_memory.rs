use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{TransportError, TransportMessage, TransportPublisher};

/// Records published messages. Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    published: Mutex<Vec<TransportMessage>>,
    failures: AtomicUsize,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Fail the next `n` publishes with `Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<TransportMessage> {
        self.published
            .lock()
            .map(|msgs| msgs.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl TransportPublisher for InMemoryPublisher {
    async fn publish(&self, message: TransportMessage) -> Result<(), TransportError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::Unavailable("injected failure".to_string()));
        }

        self.published
            .lock()
            .map_err(|_| TransportError::Unavailable("lock poisoned".to_string()))?
            .push(message);
        Ok(())
    }
}

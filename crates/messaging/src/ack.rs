//! Exactly-once settlement of a delivery.

use std::sync::atomic::{AtomicBool, Ordering};

use courier_transport::Delivery;
use tracing::{error, warn};

/// Settles a delivery at most once.
///
/// A second `ack` or `nack` is a programming error: it is logged and not
/// forwarded to the broker.
#[derive(Debug)]
pub struct AckGuard {
    delivery: Delivery,
    settled: AtomicBool,
}

impl AckGuard {
    /// Wraps `delivery`.
    #[must_use]
    pub const fn new(delivery: Delivery) -> Self {
        Self {
            delivery,
            settled: AtomicBool::new(false),
        }
    }

    /// The guarded delivery.
    #[must_use]
    pub const fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    fn claim(&self, operation: &str) -> bool {
        if self.settled.swap(true, Ordering::AcqRel) {
            warn!(
                consumer_tag = %self.delivery.consumer_tag,
                operation,
                "delivery already acknowledged"
            );
            return false;
        }
        true
    }

    /// Acknowledges the delivery. Returns `false` if it was already settled.
    pub async fn ack(&self) -> bool {
        if !self.claim("ack") {
            return false;
        }
        if let Err(e) = self.delivery.ack().await {
            error!(consumer_tag = %self.delivery.consumer_tag, error = %e, "ack failed");
        }
        true
    }

    /// Rejects the delivery. Returns `false` if it was already settled.
    pub async fn nack(&self, requeue: bool) -> bool {
        if !self.claim("nack") {
            return false;
        }
        if let Err(e) = self.delivery.nack(requeue).await {
            error!(consumer_tag = %self.delivery.consumer_tag, error = %e, "nack failed");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use bytes::Bytes;
    use courier_transport::{Acker, MessageProperties, TransportError};
    use tracing_test::traced_test;

    use super::*;

    #[derive(Debug, Default)]
    struct CountingAcker {
        acks: AtomicUsize,
        nacks: AtomicUsize,
    }

    #[async_trait]
    impl Acker for CountingAcker {
        async fn ack(&self) -> Result<(), TransportError> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nack(&self, _multiple: bool, _requeue: bool) -> Result<(), TransportError> {
            self.nacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn guard(acker: Arc<CountingAcker>) -> AckGuard {
        AckGuard::new(Delivery::new(
            Bytes::new(),
            MessageProperties::default(),
            false,
            "ctag",
            "queue",
            acker,
        ))
    }

    #[tokio::test]
    #[traced_test]
    async fn second_settlement_is_logged_and_skipped() {
        let acker = Arc::new(CountingAcker::default());
        let guard = guard(acker.clone());

        assert!(guard.ack().await);
        assert!(!guard.ack().await);
        assert!(!guard.nack(true).await);

        assert_eq!(acker.acks.load(Ordering::SeqCst), 1);
        assert_eq!(acker.nacks.load(Ordering::SeqCst), 0);
        assert!(logs_contain("delivery already acknowledged"));
    }

    #[tokio::test]
    async fn nack_settles_once() {
        let acker = Arc::new(CountingAcker::default());
        let guard = guard(acker.clone());

        assert!(guard.nack(false).await);
        assert!(!guard.ack().await);
        assert_eq!(acker.nacks.load(Ordering::SeqCst), 1);
        assert_eq!(acker.acks.load(Ordering::SeqCst), 0);
    }
}

use crate::events::OpportunityEvent;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Outbound seam for detected opportunities. Fire-and-forget: returns whether
/// the event was accepted, never blocks the detection thread.
pub trait OpportunityPublisher: Send + Sync {
    fn publish(&self, event: OpportunityEvent) -> bool;
}

impl<P: OpportunityPublisher + ?Sized> OpportunityPublisher for Arc<P> {
    #[inline]
    fn publish(&self, event: OpportunityEvent) -> bool {
        (**self).publish(event)
    }
}

/// In-process bus adapter over a bounded crossbeam channel. A full channel
/// drops the event and counts it.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    sender: Sender<OpportunityEvent>,
    receiver: Receiver<OpportunityEvent>,
    published: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl ChannelPublisher {
    #[inline]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self {
            sender,
            receiver,
            published: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Consumer side. Clone it for more consumers.
    #[inline]
    pub fn receiver(&self) -> &Receiver<OpportunityEvent> {
        &self.receiver
    }

    #[inline]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

impl OpportunityPublisher for ChannelPublisher {
    fn publish(&self, event: OpportunityEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("publisher_dropped_total").increment(1);
                tracing::debug!(sequence = event.sequence, "Opportunity channel full, dropping event");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("publisher_dropped_total").increment(1);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opportunity_detector::Opportunity;

    fn event(sequence: u64) -> OpportunityEvent {
        // The channel never inspects the payload.
        let opportunity: Opportunity = serde_json::from_value(serde_json::json!({
            "id": "00000000-0000-0000-0000-000000000001",
            "legs": [],
            "amount_in": 1.0,
            "amount_out": 1.1,
            "net_profit": 0.1,
            "profit_ratio": 0.1,
            "confidence": 1.0,
            "detected_at_ns": 0
        }))
        .unwrap();
        OpportunityEvent::new(sequence, opportunity)
    }

    #[test]
    fn test_publish_then_receive() {
        let publisher = ChannelPublisher::new(4);
        assert!(publisher.publish(event(1)));
        let received = publisher.receiver().try_recv().unwrap();
        assert_eq!(received.sequence, 1);
        assert_eq!(publisher.published(), 1);
    }

    #[test]
    fn test_full_channel_drops_without_blocking() {
        let publisher = ChannelPublisher::new(1);
        assert!(publisher.publish(event(1)));
        assert!(!publisher.publish(event(2)));
        assert_eq!(publisher.dropped(), 1);
        assert_eq!(publisher.len(), 1);
    }

    #[test]
    fn test_shared_publisher_through_arc() {
        let publisher = Arc::new(ChannelPublisher::new(2));
        let dynamic: Arc<dyn OpportunityPublisher> = publisher.clone();
        assert!(dynamic.publish(event(3)));
        assert_eq!(publisher.published(), 1);
    }
}

//! Typed event bus
//!
//! Request sync publishes request changes; operations publish their status
//! transitions. Subscribers choose the topics they care about.

use std::collections::HashSet;
use tokio::sync::broadcast;
use tracing::warn;

use crate::types::{BridgeRequest, OperationRecord, RequestKind};

/// Default channel capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    IssueRequests,
    RedeemRequests,
    Operations,
}

impl Topic {
    pub fn for_kind(kind: RequestKind) -> Self {
        match kind {
            RequestKind::Issue => Topic::IssueRequests,
            RequestKind::Redeem => Topic::RedeemRequests,
        }
    }
}

#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// First time a request is seen
    RequestAdded(BridgeRequest),
    /// A tracked request changed status or correlation
    RequestUpdated(BridgeRequest),
    OperationUpdated(OperationRecord),
}

impl BridgeEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BridgeEvent::RequestAdded(r) | BridgeEvent::RequestUpdated(r) => Topic::for_kind(r.kind),
            BridgeEvent::OperationUpdated(_) => Topic::Operations,
        }
    }
}

/// Broadcast bus shared by all components
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to current subscribers; returns how many received it
    pub fn publish(&self, event: BridgeEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            topics: topics.iter().copied().collect(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Receiver filtered to a set of topics
pub struct Subscription {
    receiver: broadcast::Receiver<BridgeEvent>,
    topics: HashSet<Topic>,
}

impl Subscription {
    /// Next event on a subscribed topic; None once the bus is gone
    pub async fn next(&mut self) -> Option<BridgeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.topics.contains(&event.topic()) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "vault::events", skipped, "Subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RequestId, RequestStatus};

    fn request(kind: RequestKind) -> BridgeRequest {
        BridgeRequest {
            kind,
            id: RequestId::from_u64(1),
            requester: "0xuser".into(),
            vault: "0xvault".into(),
            btc_address: String::new(),
            amount: 1,
            status: RequestStatus::Pending,
            btc_tx: None,
            opentime: 0,
            last_update: 0,
        }
    }

    #[tokio::test]
    async fn test_subscription_filters_topics() {
        let bus = EventBus::new(16);
        let mut redeems = bus.subscribe(&[Topic::RedeemRequests]);

        assert_eq!(bus.publish(BridgeEvent::RequestAdded(request(RequestKind::Issue))), 1);
        bus.publish(BridgeEvent::RequestUpdated(request(RequestKind::Redeem)));

        match redeems.next().await {
            Some(BridgeEvent::RequestUpdated(r)) => assert_eq!(r.kind, RequestKind::Redeem),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(BridgeEvent::RequestAdded(request(RequestKind::Issue))), 0);
    }

    #[tokio::test]
    async fn test_closed_bus_ends_subscription() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe(&[Topic::Operations]);
        drop(bus);
        assert!(sub.next().await.is_none());
    }
}

// src/core/events.rs

//! The event bus for bucket lifecycle and audit notifications.
//!
//! Orchestration workers publish coarse-grained events here; the service
//! layer and tests subscribe. Subscriptions are handles whose drop
//! unsubscribes, so teardown is guaranteed on every exit path.

use crate::core::topology::NodeId;
use tokio::sync::broadcast::{self, Receiver as BroadcastReceiver, Sender as BroadcastSender};
use tracing::debug;

/// Events observable while an orchestration is running.
#[derive(Debug, Clone, PartialEq)]
pub enum BucketEvent {
    /// A bucket's move was interrupted on a node, with the surfaced reason.
    Stopped {
        bucket: String,
        node: NodeId,
        reason: String,
    },
    /// A bucket became ready on a node.
    BucketReady { bucket: String, node: NodeId },
    /// A hard failover left vbuckets without a master. Carries the
    /// percentage of the bucket's vbuckets that lost all copies.
    DataLost { bucket: String, percentage: u8 },
    /// A rebalance committed a new map for a bucket.
    MapCommitted { bucket: String, moves: usize },
}

const EVENT_BUS_CAPACITY: usize = 1024;

/// Central distribution hub for orchestration events.
#[derive(Debug)]
pub struct EventBus {
    sender: BroadcastSender<BucketEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    /// Publishes an event to all subscribers. It's okay if there are none.
    pub fn publish(&self, event: BucketEvent) {
        if self.sender.send(event.clone()).is_err() {
            debug!("Published {:?} with no active subscribers.", event);
        }
    }

    /// Provides a new subscription. Dropping the returned handle
    /// unsubscribes; no explicit teardown call exists.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }
}

/// A live subscription to the event bus.
#[derive(Debug)]
pub struct Subscription {
    receiver: BroadcastReceiver<BucketEvent>,
}

impl Subscription {
    /// Waits for the next event. Returns `None` once the bus is gone or the
    /// subscriber lagged past the channel capacity.
    pub async fn recv(&mut self) -> Option<BucketEvent> {
        self.receiver.recv().await.ok()
    }

    /// Drains any event already delivered without waiting.
    pub fn try_recv(&mut self) -> Option<BucketEvent> {
        self.receiver.try_recv().ok()
    }
}

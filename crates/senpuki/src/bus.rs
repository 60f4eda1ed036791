//! Publish/subscribe fan-out of task- and execution-state transitions.
//!
//! Notifications are always an optimization: the polling fallback in
//! [`crate::executor`] and [`crate::worker`] is authoritative, so a bus that
//! drops a message never causes an incorrect result, only a slower one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::SenpukiError;
use crate::model::{ExecutionId, TaskId};

/// A state-transition message published on a channel. Carries either a task
/// or execution id depending on which channel it arrived on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub task_id: Option<TaskId>,
    pub execution_id: Option<ExecutionId>,
    pub state: String,
}

pub fn task_channel(id: TaskId) -> String {
    format!("task:{id}")
}

pub fn execution_channel(id: ExecutionId) -> String {
    format!("execution:{id}")
}

/// A live subscription to a channel. Dropping it unsubscribes.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next message, or `None` once the subscription has been
    /// closed (e.g. the bus side dropped it, or an optional expiry elapsed).
    async fn recv(&mut self) -> Option<ChannelMessage>;
}

/// Publish/subscribe fan-out. Implementations: [`InProcessBus`] (in this
/// crate, zero external dependency) and `senpuki_notify_redis::RedisBus` (for
/// multi-process deployments). [`NoOpBus`] signals "no bus configured" to
/// callers that should fall back to adaptive polling.
#[async_trait]
pub trait NotificationBus: Send + Sync {
    async fn publish(&self, channel: &str, message: ChannelMessage) -> Result<(), SenpukiError>;

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, SenpukiError>;
}

/// `tokio::sync::broadcast`-backed bus for single-process deployments and
/// tests. Slow subscribers may miss messages under `broadcast`'s lagging
/// semantics, which is fine: polling is always there to catch up.
pub struct InProcessBus {
    sender: broadcast::Sender<(String, ChannelMessage)>,
}

impl InProcessBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

struct InProcessSubscription {
    channel: String,
    receiver: broadcast::Receiver<(String, ChannelMessage)>,
}

#[async_trait]
impl Subscription for InProcessSubscription {
    async fn recv(&mut self) -> Option<ChannelMessage> {
        loop {
            match self.receiver.recv().await {
                Ok((chan, msg)) if chan == self.channel => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
impl NotificationBus for InProcessBus {
    async fn publish(&self, channel: &str, message: ChannelMessage) -> Result<(), SenpukiError> {
        // No subscribers is not an error: publishing is fire-and-forget.
        let _ = self.sender.send((channel.to_string(), message));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, SenpukiError> {
        Ok(Box::new(InProcessSubscription {
            channel: channel.to_string(),
            receiver: self.sender.subscribe(),
        }))
    }
}

/// Signals that no bus is configured. `subscribe` returns a subscription
/// whose `recv` never resolves, so callers using [`crate::poll::wait_with_poll`]
/// naturally fall through to the adaptive-polling path instead.
pub struct NoOpBus;

struct NeverSubscription;

#[async_trait]
impl Subscription for NeverSubscription {
    async fn recv(&mut self) -> Option<ChannelMessage> {
        std::future::pending().await
    }
}

#[async_trait]
impl NotificationBus for NoOpBus {
    async fn publish(&self, _channel: &str, _message: ChannelMessage) -> Result<(), SenpukiError> {
        Ok(())
    }

    async fn subscribe(&self, _channel: &str) -> Result<Box<dyn Subscription>, SenpukiError> {
        Ok(Box::new(NeverSubscription))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_process_bus_delivers_to_matching_channel() {
        let bus = InProcessBus::new();
        let mut sub = bus.subscribe("task:1").await.unwrap();
        bus.publish(
            "task:1",
            ChannelMessage {
                task_id: None,
                execution_id: None,
                state: "completed".into(),
            },
        )
        .await
        .unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.state, "completed");
    }

    #[tokio::test]
    async fn in_process_bus_ignores_other_channels() {
        let bus = InProcessBus::new();
        let mut sub = bus.subscribe("task:1").await.unwrap();
        bus.publish(
            "task:2",
            ChannelMessage {
                task_id: None,
                execution_id: None,
                state: "completed".into(),
            },
        )
        .await
        .unwrap();
        let recv = tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await;
        assert!(recv.is_err(), "should not have received a message for a different channel");
    }
}

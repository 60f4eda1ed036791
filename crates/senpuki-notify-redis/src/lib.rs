//! Redis pub/sub implementation of [`senpuki::NotificationBus`].
//!
//! Publishing goes through a [`redis::aio::ConnectionManager`] (auto
//! reconnecting, safe to clone and share). Subscribing opens a dedicated
//! connection per call and puts it into Redis subscriber mode, since a
//! connection in that mode can no longer run ordinary commands — mirroring
//! `InProcessBus`'s one-subscription-per-channel shape, just over the wire.
//! Per [`senpuki::NotificationBus`]'s contract, a dropped or lagging
//! connection here only degrades to slower polling; it never produces a
//! wrong result.

use async_trait::async_trait;
use futures::StreamExt;
use senpuki::{ChannelMessage, NotificationBus, SenpukiError, Subscription};
use redis::AsyncCommands;

fn redis_err(e: redis::RedisError) -> SenpukiError {
    SenpukiError::BackendUnavailable(format!("redis: {e}"))
}

fn ser_err(e: impl std::fmt::Display) -> SenpukiError {
    SenpukiError::SerializationFailed(e.to_string())
}

/// A Redis-backed [`NotificationBus`] for multi-process deployments.
pub struct RedisBus {
    client: redis::Client,
    manager: redis::aio::ConnectionManager,
}

impl RedisBus {
    pub async fn connect(redis_url: &str) -> Result<Self, SenpukiError> {
        let client = redis::Client::open(redis_url).map_err(redis_err)?;
        let manager = client.get_connection_manager().await.map_err(redis_err)?;
        Ok(Self { client, manager })
    }
}

struct RedisSubscription {
    stream: std::pin::Pin<Box<dyn futures::Stream<Item = redis::Msg> + Send>>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn recv(&mut self) -> Option<ChannelMessage> {
        loop {
            let msg = self.stream.next().await?;
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping non-utf8 redis pubsub payload");
                    continue;
                }
            };
            match serde_json::from_str::<ChannelMessage>(&payload) {
                Ok(message) => return Some(message),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed redis pubsub payload");
                    continue;
                }
            }
        }
    }
}

#[async_trait]
impl NotificationBus for RedisBus {
    async fn publish(&self, channel: &str, message: ChannelMessage) -> Result<(), SenpukiError> {
        let payload = serde_json::to_string(&message).map_err(ser_err)?;
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(channel, payload).await.map_err(redis_err)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, SenpukiError> {
        let conn = self.client.get_async_connection().await.map_err(redis_err)?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await.map_err(redis_err)?;
        let stream = pubsub.into_on_message();
        Ok(Box::new(RedisSubscription { stream: Box::pin(stream) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_message_round_trips_through_json() {
        let message = ChannelMessage {
            task_id: Some(uuid::Uuid::new_v4()),
            execution_id: None,
            state: "completed".into(),
        };
        let encoded = serde_json::to_string(&message).unwrap();
        let decoded: ChannelMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.state, "completed");
        assert_eq!(decoded.task_id, message.task_id);
    }
}

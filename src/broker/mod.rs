//! Publish/subscribe fan-out keyed by recipient identity.

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::RelayResult;

pub mod memory;
pub mod rabbit;

pub use memory::InMemoryBroker;
pub use rabbit::RabbitBroker;

/// A long-lived, non-restartable stream of payloads for one channel.
/// Dropping it unsubscribes.
pub type Subscription = BoxStream<'static, RelayResult<Vec<u8>>>;

#[async_trait]
pub trait PubSubBroker: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> RelayResult<()>;

    async fn subscribe(&self, channel: &str) -> RelayResult<Subscription>;
}

/// Channel key for a user's real-time notifications.
pub fn user_channel(user_id: Uuid) -> String {
    user_id.to_string()
}

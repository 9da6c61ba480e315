use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use super::{PubSubBroker, Subscription};
use crate::error::{RelayError, RelayResult};

type Channels = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>>;

/// In-process broker: every subscriber gets its own unbounded queue. A
/// queue leaves its channel when its subscription is dropped, and the
/// channel entry goes with its last queue.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    channels: Channels,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscribers on `channel`, counting only those still attached.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .map(|channels| {
                channels
                    .get(channel)
                    .map(|list| list.iter().filter(|tx| !tx.is_closed()).count())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl PubSubBroker for InMemoryBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> RelayResult<()> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| RelayError::Transient("broker lock poisoned".into()))?;

        if let Some(list) = channels.get_mut(channel) {
            list.retain(|tx| tx.send(payload.clone()).is_ok());
            debug!("Published to {} ({} subscribers)", channel, list.len());
            if list.is_empty() {
                channels.remove(channel);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> RelayResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut channels = self
                .channels
                .lock()
                .map_err(|_| RelayError::Transient("broker lock poisoned".into()))?;
            let list = channels.entry(channel.to_string()).or_default();
            list.retain(|tx| !tx.is_closed());
            list.push(tx);
        }

        let feed = Feed {
            rx,
            channel: channel.to_string(),
            channels: self.channels.clone(),
        };
        let stream = futures::stream::unfold(feed, |mut feed| async move {
            feed.rx
                .recv()
                .await
                .map(|payload| (Ok::<_, RelayError>(payload), feed))
        });
        Ok(stream.boxed())
    }
}

/// Receiving end of one subscription; detaches itself from the channel list
/// when dropped.
struct Feed {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    channel: String,
    channels: Channels,
}

impl Drop for Feed {
    fn drop(&mut self) {
        self.rx.close();
        let Ok(mut channels) = self.channels.lock() else {
            return;
        };
        if let Some(list) = channels.get_mut(&self.channel) {
            list.retain(|tx| !tx.is_closed());
            if list.is_empty() {
                channels.remove(&self.channel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn every_subscriber_of_the_channel_sees_the_payload() {
        let broker = InMemoryBroker::new();
        let mut first = broker.subscribe("r").await.unwrap();
        let mut second = broker.subscribe("r").await.unwrap();
        let mut other = broker.subscribe("someone-else").await.unwrap();

        broker.publish("r", b"hello".to_vec()).await.unwrap();

        assert_eq!(first.next().await.unwrap().unwrap(), b"hello");
        assert_eq!(second.next().await.unwrap().unwrap(), b"hello");
        assert!(
            timeout(Duration::from_millis(50), other.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn single_publisher_order_is_kept() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe("r").await.unwrap();

        for i in 0..10u8 {
            broker.publish("r", vec![i]).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(sub.next().await.unwrap().unwrap(), vec![i]);
        }
    }

    #[tokio::test]
    async fn dropping_the_subscription_unsubscribes() {
        let broker = InMemoryBroker::new();
        let sub = broker.subscribe("r").await.unwrap();
        assert_eq!(broker.subscriber_count("r"), 1);

        drop(sub);
        assert_eq!(broker.subscriber_count("r"), 0);
        broker.publish("r", b"nobody".to_vec()).await.unwrap();
    }

    fn retained(broker: &InMemoryBroker, channel: &str) -> Option<usize> {
        broker.channels.lock().unwrap().get(channel).map(Vec::len)
    }

    #[tokio::test]
    async fn idle_reconnects_do_not_accumulate_senders() {
        let broker = InMemoryBroker::new();
        let live = broker.subscribe("idle-user").await.unwrap();

        for _ in 0..1000 {
            drop(broker.subscribe("idle-user").await.unwrap());
        }
        assert_eq!(retained(&broker, "idle-user"), Some(1));

        drop(live);
        assert_eq!(retained(&broker, "idle-user"), None);
    }

    #[tokio::test]
    async fn polled_subscription_detaches_on_drop() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe("r").await.unwrap();
        broker.publish("r", b"one".to_vec()).await.unwrap();
        assert_eq!(sub.next().await.unwrap().unwrap(), b"one");

        drop(sub);
        assert_eq!(retained(&broker, "r"), None);
    }
}

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
    options::{
        BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{PubSubBroker, Subscription};
use crate::error::{RelayError, RelayResult};

/// AMQP-backed broker. Channels map to routing keys on one direct exchange;
/// each subscription owns an exclusive, auto-deleted queue bound to its key.
pub struct RabbitBroker {
    connection: Connection,
    publisher: Channel,
    exchange: String,
}

impl RabbitBroker {
    pub async fn connect(url: &str, exchange: &str) -> RelayResult<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        info!("Connected to RabbitMQ at {}", url);

        let publisher = connection.create_channel().await?;

        // Enable publisher confirmations
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        publisher
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(Self {
            connection,
            publisher,
            exchange: exchange.to_string(),
        })
    }
}

#[async_trait]
impl PubSubBroker for RabbitBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> RelayResult<()> {
        let confirm = self
            .publisher
            .basic_publish(
                &self.exchange,
                channel,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await?
            .await?;

        match confirm {
            Confirmation::Ack(_) => Ok(()),
            Confirmation::Nack(_) => Err(RelayError::Transient(
                "message was nacked by RabbitMQ".into(),
            )),
            Confirmation::NotRequested => Err(RelayError::Transient(
                "publisher confirmation was not requested".into(),
            )),
        }
    }

    async fn subscribe(&self, channel: &str) -> RelayResult<Subscription> {
        let amqp_channel = self.connection.create_channel().await?;

        let queue = amqp_channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        amqp_channel
            .queue_bind(
                queue.name().as_str(),
                &self.exchange,
                channel,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let consumer = amqp_channel
            .basic_consume(
                queue.name().as_str(),
                &format!("relay_{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        debug!("Subscribed queue {} to {}", queue.name().as_str(), channel);
        Ok(RabbitSubscription {
            consumer,
            channel: amqp_channel,
        }
        .boxed())
    }
}

struct RabbitSubscription {
    consumer: Consumer,
    channel: Channel,
}

impl Stream for RabbitSubscription {
    type Item = RelayResult<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.consumer.poll_next_unpin(cx).map(|item| {
            item.map(|delivery| delivery.map(|d| d.data).map_err(RelayError::from))
        })
    }
}

impl Drop for RabbitSubscription {
    fn drop(&mut self) {
        // Closing the channel cancels the consumer and deletes the queue.
        let channel = self.channel.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = channel.close(200, "unsubscribed").await {
                    warn!("Failed to close subscription channel: {}", e);
                }
            });
        }
    }
}

use std::{sync::Arc, time::Duration};

use tracing::{info, warn};
use uuid::Uuid;

use super::{ConnectionManager, RelayContext};
use crate::{
    broker::{PubSubBroker, user_channel},
    chat::Envelope,
    error::{RelayError, RelayResult},
    metrics::Metrics,
    models::Conversation,
    store::{Database, UserDirectory},
};

#[derive(Clone)]
pub struct RelayService {
    ctx: RelayContext,
}

impl RelayService {
    pub fn new(
        db: Arc<Database>,
        users: Arc<dyn UserDirectory>,
        broker: Arc<dyn PubSubBroker>,
        persist_timeout: Duration,
    ) -> Self {
        Self {
            ctx: RelayContext {
                db,
                users,
                broker,
                persist_timeout,
            },
        }
    }

    pub fn db(&self) -> &Database {
        &self.ctx.db
    }

    pub fn users(&self) -> &dyn UserDirectory {
        self.ctx.users.as_ref()
    }

    /// Creates the conversation, then tells the target's live connections
    /// about it. The conversation stands even if that notification fails.
    pub async fn start_conversation(
        &self,
        starter_id: Uuid,
        target_id: Uuid,
    ) -> RelayResult<Conversation> {
        let conv = self
            .ctx
            .db
            .conversations()
            .create(self.ctx.users.as_ref(), starter_id, target_id)
            .await?;

        let notify = async {
            let payload = Envelope::new_conversation(conv.clone()).to_bytes()?;
            self.ctx
                .broker
                .publish(&user_channel(conv.user2_id), payload)
                .await
        };
        match notify.await {
            Ok(()) => Metrics::envelope_published(),
            Err(e) => warn!(
                "Failed to notify user {} of conversation {}: {}",
                conv.user2_id, conv.id, e
            ),
        }

        Ok(conv)
    }

    /// Validates that `principal` may open `user_id`'s connection and
    /// subscribes it. The returned manager is started with
    /// [`ConnectionManager::run`] once the transport is ready.
    pub async fn accept_connection(
        &self,
        user_id: Uuid,
        principal: Uuid,
    ) -> RelayResult<ConnectionManager> {
        if user_id != principal {
            return Err(RelayError::forbidden(
                "not-your-conn",
                "You can only open your own connection.",
            ));
        }

        let user = self.ctx.users.find_by_id(user_id).await?;
        let manager = ConnectionManager::open(user.id, self.ctx.clone()).await?;

        info!("Accepted relay connection for {} ({})", user.username, user.id);
        Ok(manager)
    }
}

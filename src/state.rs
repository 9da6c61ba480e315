use std::sync::Arc;

use tracing::info;

use crate::{
    broker::{InMemoryBroker, PubSubBroker, RabbitBroker},
    config::RelayConfig,
    error::RelayResult,
    relay::RelayService,
    store::{Database, UserDirectory},
};

pub struct AppState {
    pub db: Arc<Database>,
    pub users: Arc<dyn UserDirectory>,
    pub broker: Arc<dyn PubSubBroker>,
    pub relay: RelayService,
}

impl AppState {
    fn new(db: Database, broker: Arc<dyn PubSubBroker>, config: &RelayConfig) -> Self {
        let db = Arc::new(db);
        let users: Arc<dyn UserDirectory> = Arc::new(db.users());
        let relay = RelayService::new(
            db.clone(),
            users.clone(),
            broker.clone(),
            config.persist_timeout,
        );

        Self {
            db,
            users,
            broker,
            relay,
        }
    }
}

#[derive(Default)]
pub struct AppStateBuilder {
    config: Option<RelayConfig>,
    database: Option<Database>,
    broker: Option<Arc<dyn PubSubBroker>>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Uses an already-open database instead of connecting to
    /// `config.database_url`.
    pub fn with_database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn PubSubBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub async fn build(self) -> RelayResult<AppState> {
        let config = self.config.unwrap_or_default();

        let db = match self.database {
            Some(db) => db,
            None => Database::connect(&config.database_url).await?,
        };
        db.run_migrations().await?;

        let broker: Arc<dyn PubSubBroker> = match (self.broker, &config.rabbitmq_url) {
            (Some(broker), _) => broker,
            (None, Some(url)) => Arc::new(RabbitBroker::connect(url, &config.exchange).await?),
            (None, None) => {
                info!("RABBITMQ_URL not set, using the in-process broker");
                Arc::new(InMemoryBroker::new())
            }
        };

        Ok(AppState::new(db, broker, &config))
    }
}

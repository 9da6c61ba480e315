//! Real-time relay between the stores, the broker and user connections.

use std::{sync::Arc, time::Duration};

use crate::{
    broker::PubSubBroker,
    store::{Database, UserDirectory},
};

pub mod connection_manager;
pub mod handlers;
pub mod service;

pub use connection_manager::{ConnectionManager, ConnectionState};
pub use service::RelayService;

/// Collaborators shared by the relay service and every connection it accepts.
#[derive(Clone)]
pub struct RelayContext {
    pub db: Arc<Database>,
    pub users: Arc<dyn UserDirectory>,
    pub broker: Arc<dyn PubSubBroker>,
    /// Ceiling on each inbound persist.
    pub persist_timeout: Duration,
}

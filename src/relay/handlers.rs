use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use super::RelayContext;
use crate::{
    broker::user_channel,
    chat::{Envelope, InboundFrame},
    error::{RelayError, RelayResult},
    metrics::Metrics,
    models::Message,
};

/// Persists one client frame and publishes it to the receiver's channel.
///
/// Any error ends the sender's connection.
pub async fn handle_direct_message(
    ctx: &RelayContext,
    user_id: Uuid,
    text: &str,
) -> RelayResult<Message> {
    let frame = InboundFrame::parse(text)?;

    if frame.sender_id != user_id {
        return Err(RelayError::forbidden(
            "spoofed-sender",
            "Messages can only be sent as yourself.",
        ));
    }

    let persist = ctx.db.append_message(
        frame.conv_id,
        frame.sender_id,
        frame.receiver_id,
        frame.body,
    );
    let msg = timeout(ctx.persist_timeout, persist)
        .await
        .map_err(|_| RelayError::Transient("persist deadline exceeded".into()))??;

    let payload = Envelope::new_message(msg.clone()).to_bytes()?;
    ctx.broker
        .publish(&user_channel(msg.receiver_id), payload)
        .await?;
    Metrics::envelope_published();

    debug!(
        "Relayed message {} from {} to {}",
        msg.id, msg.sender_id, msg.receiver_id
    );
    Ok(msg)
}

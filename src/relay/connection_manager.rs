use std::{fmt::Display, sync::Arc};

use axum::extract::ws::Message as WsMessage;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{RelayContext, handlers};
use crate::{
    broker::{Subscription, user_channel},
    chat::Envelope,
    error::RelayResult,
    metrics::Metrics,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why a loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LoopExit {
    /// The paired loop ended first.
    Cancelled,
    PeerClosed,
    ReadFailed,
    WriteFailed,
    FrameRejected,
    SubscriptionEnded,
}

impl LoopExit {
    fn label(self) -> &'static str {
        match self {
            LoopExit::Cancelled => "cancelled",
            LoopExit::PeerClosed => "peer_closed",
            LoopExit::ReadFailed => "read_failed",
            LoopExit::WriteFailed => "write_failed",
            LoopExit::FrameRejected => "frame_rejected",
            LoopExit::SubscriptionEnded => "subscription_ended",
        }
    }
}

/// One live connection: an outbound loop draining the user's broker channel
/// into the socket and an inbound loop persisting and relaying client frames.
///
/// The loops share nothing but a shutdown signal. Whichever exits first flips
/// it, which unblocks the other; the socket is closed after both are done.
pub struct ConnectionManager {
    user_id: Uuid,
    ctx: RelayContext,
    subscription: Subscription,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    /// Subscribes to the user's channel. The manager stays `Connecting` until
    /// [`run`](Self::run) is handed the socket.
    pub async fn open(user_id: Uuid, ctx: RelayContext) -> RelayResult<Self> {
        let subscription = ctx.broker.subscribe(&user_channel(user_id)).await?;
        let (state, _) = watch::channel(ConnectionState::Connecting);

        debug!("Subscribed relay channel for user {}", user_id);
        Ok(Self {
            user_id,
            ctx,
            subscription,
            state,
        })
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub async fn run<W, R, E>(self, sink: W, stream: R)
    where
        W: Sink<WsMessage> + Unpin + Send + 'static,
        W::Error: Display + Send,
        R: Stream<Item = Result<WsMessage, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
    {
        let Self {
            user_id,
            ctx,
            subscription,
            state,
        } = self;

        state.send_replace(ConnectionState::Active);
        Metrics::connection_opened();
        info!("Relay connection active for user {}", user_id);

        let state = Arc::new(state);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let send_task = {
            let state = state.clone();
            let shutdown_tx = shutdown_tx.clone();
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                let (sink, exit) = outbound_loop(user_id, subscription, sink, shutdown_rx).await;
                begin_closing(user_id, "outbound", exit, &state, &shutdown_tx);
                (sink, exit)
            })
        };

        let recv_task = {
            let state = state.clone();
            let shutdown_tx = shutdown_tx.clone();
            tokio::spawn(async move {
                let exit = inbound_loop(user_id, &ctx, stream, shutdown_rx).await;
                begin_closing(user_id, "inbound", exit, &state, &shutdown_tx);
                exit
            })
        };

        let (outbound, inbound) = tokio::join!(send_task, recv_task);

        let outbound_exit = match outbound {
            Ok((mut sink, exit)) => {
                if let Err(e) = sink.close().await {
                    debug!("Closing socket for user {} failed: {}", user_id, e);
                }
                exit
            }
            Err(e) => {
                error!("Outbound loop for user {} panicked: {}", user_id, e);
                LoopExit::WriteFailed
            }
        };
        let inbound_exit = inbound.unwrap_or_else(|e| {
            error!("Inbound loop for user {} panicked: {}", user_id, e);
            LoopExit::ReadFailed
        });

        let reason = if inbound_exit != LoopExit::Cancelled {
            inbound_exit
        } else {
            outbound_exit
        };

        state.send_replace(ConnectionState::Closed);
        Metrics::connection_closed(reason.label());
        info!(
            "Relay connection closed for user {} ({})",
            user_id,
            reason.label()
        );
    }
}

fn begin_closing(
    user_id: Uuid,
    side: &str,
    exit: LoopExit,
    state: &watch::Sender<ConnectionState>,
    shutdown: &watch::Sender<bool>,
) {
    shutdown.send_replace(true);
    let first = state.send_if_modified(|current| {
        if *current == ConnectionState::Active {
            *current = ConnectionState::Closing;
            true
        } else {
            false
        }
    });
    if first {
        debug!(
            "{} loop for user {} ended first ({})",
            side,
            user_id,
            exit.label()
        );
    }
}

async fn outbound_loop<W>(
    user_id: Uuid,
    mut subscription: Subscription,
    mut sink: W,
    mut shutdown: watch::Receiver<bool>,
) -> (W, LoopExit)
where
    W: Sink<WsMessage> + Unpin,
    W::Error: Display,
{
    let exit = loop {
        tokio::select! {
            _ = shutdown.changed() => break LoopExit::Cancelled,
            item = subscription.next() => match item {
                Some(Ok(payload)) => {
                    if let Err(e) = Envelope::from_bytes(&payload) {
                        warn!("Dropping undecodable payload for user {}: {}", user_id, e);
                        continue;
                    }
                    let json = match String::from_utf8(payload) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Dropping non-UTF-8 payload for user {}: {}", user_id, e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                        debug!(
                            "WebSocket send failed for user {}, likely disconnected: {}",
                            user_id, e
                        );
                        break LoopExit::WriteFailed;
                    }
                    Metrics::envelope_delivered();
                }
                Some(Err(e)) => {
                    error!("Subscription for user {} failed: {}", user_id, e);
                    break LoopExit::SubscriptionEnded;
                }
                None => break LoopExit::SubscriptionEnded,
            },
        }
    };
    // The subscription is released here, whatever ended the loop.
    drop(subscription);
    (sink, exit)
}

async fn inbound_loop<R, E>(
    user_id: Uuid,
    ctx: &RelayContext,
    mut stream: R,
    mut shutdown: watch::Receiver<bool>,
) -> LoopExit
where
    R: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return LoopExit::Cancelled,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                Metrics::envelope_received();
                if let Err(e) = handlers::handle_direct_message(ctx, user_id, text.as_str()).await
                {
                    warn!(
                        "Dropping connection for user {}: {} ({})",
                        user_id,
                        e,
                        e.code()
                    );
                    return LoopExit::FrameRejected;
                }
            }
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
            Some(Ok(WsMessage::Binary(_))) => {
                warn!("User {} sent a binary frame, closing", user_id);
                return LoopExit::FrameRejected;
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                debug!("Connection closed by client for user {}", user_id);
                return LoopExit::PeerClosed;
            }
            Some(Err(e)) => {
                debug!("Read error for user {}: {}", user_id, e);
                return LoopExit::ReadFailed;
            }
        }
    }
}

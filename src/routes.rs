use std::{collections::HashMap, sync::Arc};

use axum::{
    Json,
    extract::{FromRequestParts, Path, Query, State, WebSocketUpgrade},
    http::request::Parts,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{RelayError, RelayResult},
    models::{Conversation, Message, User},
    socket::dm_socket,
    state::AppState,
};

const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated caller. Browsers cannot set headers on a WebSocket
/// upgrade, so the `token` query parameter is accepted as well.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Viewer(pub Uuid);

impl<S: Send + Sync> FromRequestParts<S> for Viewer {
    type Rejection = RelayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let from_header = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let raw = match from_header {
            Some(raw) => raw,
            None => Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(mut params)| params.remove("token"))
                .ok_or(RelayError::Unauthorized)?,
        };

        Uuid::parse_str(raw.trim())
            .map(Viewer)
            .map_err(|_| RelayError::Unauthorized)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartConversationRequest {
    pub starter_id: Uuid,
    pub target_id: Uuid,
}

/// Resolves `{username}` and requires it to be the caller.
async fn owner(state: &AppState, username: &str, viewer: Viewer) -> RelayResult<User> {
    let user = state.users.find_by_username(username).await?;
    if user.id != viewer.0 {
        return Err(RelayError::forbidden(
            "not-your-conv",
            "You can only act on your own conversations.",
        ));
    }
    Ok(user)
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    viewer: Viewer,
) -> RelayResult<Json<Vec<Conversation>>> {
    let user = owner(&state, &username, viewer).await?;
    let convs = state.db.conversations().list_for_user(user.id).await?;
    Ok(Json(convs))
}

pub async fn create_conversation(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    viewer: Viewer,
    Json(req): Json<StartConversationRequest>,
) -> RelayResult<Json<Conversation>> {
    let user = owner(&state, &username, viewer).await?;
    if req.starter_id != user.id {
        return Err(RelayError::forbidden(
            "not-your-conv",
            "Conversations can only be started as yourself.",
        ));
    }

    let conv = state
        .relay
        .start_conversation(req.starter_id, req.target_id)
        .await?;
    Ok(Json(conv))
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path((username, conv_id)): Path<(String, Uuid)>,
    viewer: Viewer,
) -> RelayResult<Json<Vec<Message>>> {
    let user = owner(&state, &username, viewer).await?;
    let conv = state.db.conversations().get_by_id(conv_id).await?;
    if !conv.has_participant(user.id) {
        return Err(RelayError::forbidden(
            "not-participant",
            "Not a participant of this conversation.",
        ));
    }

    let msgs = state.db.messages().list_for_conversation(conv_id).await?;
    Ok(Json(msgs))
}

pub async fn mark_conversation_seen(
    State(state): State<Arc<AppState>>,
    Path((username, conv_id)): Path<(String, Uuid)>,
    viewer: Viewer,
) -> RelayResult<Json<Conversation>> {
    let user = owner(&state, &username, viewer).await?;
    let conv = state
        .db
        .conversations()
        .mark_seen(conv_id, user.id, Utc::now())
        .await?;
    Ok(Json(conv))
}

pub async fn connect(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    viewer: Viewer,
) -> RelayResult<Response> {
    let user = state.users.find_by_username(&username).await?;
    // Subscribed before the upgrade so nothing published in between is lost.
    let manager = state.relay.accept_connection(user.id, viewer.0).await?;

    debug!("Upgrading relay connection for user {}", user.id);
    Ok(ws.on_upgrade(move |socket| dm_socket(socket, manager)))
}

pub async fn health() -> impl IntoResponse {
    "OK"
}

use axum::extract::ws::WebSocket;
use futures::StreamExt;

use crate::relay::ConnectionManager;

pub async fn dm_socket(socket: WebSocket, manager: ConnectionManager) {
    let (sender, receiver) = socket.split();
    manager.run(sender, receiver).await;
}

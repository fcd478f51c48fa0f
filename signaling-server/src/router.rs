use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use peercall_protocol::{RoomId, UserId};
use serde::Deserialize;

use crate::connection;
use crate::relay::RelayServer;

/// Query parameters of the signaling endpoint.
///
/// The user id is expected to be vouched for by whatever authenticates the
/// upgrade request in front of the relay.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub room_id: RoomId,
    pub user_id: UserId,
}

#[allow(clippy::unused_async)]
async fn health_handler() -> &'static str {
    "OK"
}

#[allow(clippy::unused_async)]
async fn signaling_handler(
    State(relay): State<RelayServer>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    if params.room_id.as_str().is_empty() || params.user_id.as_str().is_empty() {
        return (StatusCode::BAD_REQUEST, "roomId and userId are required").into_response();
    }
    ws.on_upgrade(move |socket| {
        connection::user_connected(socket, relay, params.room_id, params.user_id)
    })
}

pub fn create(relay: RelayServer) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(signaling_handler))
        .with_state(relay)
}

use std::ops::ControlFlow;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use peercall_protocol::{RoomId, SignalKind, SignalMessage, UserId};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::relay::{ConnectionId, Delivery, Registration, RelayServer};

/// Serves one upgraded WebSocket until the peer leaves or the socket drops.
pub async fn user_connected(ws: WebSocket, relay: RelayServer, room_id: RoomId, user_id: UserId) {
    info!("new connection from {} for room {}", user_id, room_id);

    let (mut user_ws_tx, mut user_ws_rx) = ws.split();

    let Registration {
        connection_id,
        receiver,
    } = relay.connect(&room_id, &user_id).await;
    let mut receiver = UnboundedReceiverStream::new(receiver);

    // The relay drops the sending half when the member is removed or replaced,
    // which ends this task.
    tokio::task::spawn(async move {
        while let Some(message) = receiver.next().await {
            let frame = match serde_json::to_string(&message) {
                Ok(frame) => frame,
                Err(err) => {
                    error!("failed to serialize {} frame: {}", message.kind, err);
                    continue;
                }
            };
            if let Err(err) = user_ws_tx.send(Message::Text(frame)).await {
                error!("websocket send error (connection {}): {}", connection_id, err);
                break;
            }
        }
    });

    while let Some(result) = user_ws_rx.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(err) => {
                error!("websocket error (connection {}): {}", connection_id, err);
                break;
            }
        };

        let frame = match msg {
            Message::Text(frame) => frame,
            Message::Close(_) => break,
            Message::Binary(_) => {
                warn!("ignoring binary frame from {}", user_id);
                continue;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match user_message(&relay, &room_id, &user_id, connection_id, &frame).await {
            Ok(ControlFlow::Continue(())) => {}
            Ok(ControlFlow::Break(())) => break,
            Err(err) => warn!("dropping frame from {}: {}", user_id, err),
        }
    }

    info!("connection {} of {} closed", connection_id, user_id);
    relay.disconnect(&room_id, &user_id, connection_id).await;
}

async fn user_message(
    relay: &RelayServer,
    room_id: &RoomId,
    sender: &UserId,
    connection_id: ConnectionId,
    frame: &str,
) -> crate::Result<ControlFlow<()>> {
    let message = serde_json::from_str::<SignalMessage>(frame)?;
    debug!("{} frame received from {}", message.kind, sender);

    match message.kind {
        SignalKind::Leave => return Ok(ControlFlow::Break(())),
        SignalKind::Join => {
            debug!("{} is already registered in room {}", sender, room_id);
        }
        SignalKind::PeerJoined | SignalKind::PeerLeft | SignalKind::ExistingPeers => {
            warn!(
                "{} tried to send relay-only {} frame, ignoring it",
                sender, message.kind
            );
        }
        SignalKind::Offer | SignalKind::Answer | SignalKind::IceCandidate => {
            match relay.relay(room_id, sender, connection_id, message).await {
                Delivery::Delivered => {}
                other => warn!("{} frame from {} was not delivered: {:?}", room_id, sender, other),
            }
        }
    }
    Ok(ControlFlow::Continue(()))
}

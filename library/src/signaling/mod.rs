/*!
Client side of the signaling relay.

[`SignalingClient::connect`] opens a transport to the relay for a single room and
spawns a task that owns it. The task forwards inbound messages, in order, to the
receiver returned next to the client handle and writes outbound frames queued by
[`SignalingClient::send`]. When the transport drops unexpectedly the task walks
through its [`RetryPolicy`]; frames queued while the link was down are discarded,
never replayed.
*/

mod retry;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use peercall_protocol::{RoomId, SignalMessage, UserId};
use tokio::sync::{mpsc, watch, Notify};

pub use retry::RetryPolicy;
#[cfg(test)]
pub(crate) use transport::testing;
pub use transport::{Connector, Transport, WebSocketConnector};

use crate::{Error, Result};

/// Everything the client reports to its single consumer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SignalingEvent {
    Message(SignalMessage),
    Reconnecting { attempt: u32, delay: Duration },
    Reconnected,
    /// Emitted once when the retry policy is exhausted, the client is dead afterwards.
    ConnectionFailed,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionStatus {
    Open,
    Reconnecting,
    Closed,
    Failed,
}

/// Anything that can push a signaling message towards a remote peer.
pub trait SignalSink: Send + Sync {
    /// # Errors
    /// Fails when the message cannot be handed to the transport.
    fn send_signal(&self, message: SignalMessage) -> Result<()>;
}

/// Cloneable handle to a room's signaling connection.
#[derive(Debug, Clone)]
pub struct SignalingClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    room_id: RoomId,
    user_id: UserId,
    outbound: mpsc::UnboundedSender<String>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    shutdown: Arc<Notify>,
}

/// Relay URL for the given room and user.
#[must_use]
pub fn signaling_url(base_url: &str, room_id: &RoomId, user_id: &UserId) -> String {
    let separator = if base_url.contains('?') { '&' } else { '?' };
    format!(
        "{base_url}{separator}roomId={}&userId={}",
        urlencoding::encode(room_id.as_str()),
        urlencoding::encode(user_id.as_str())
    )
}

impl SignalingClient {
    /// Opens the first transport and starts the connection task.
    ///
    /// # Errors
    /// Fails when the first transport cannot be opened, no retry is attempted
    /// for the initial connection.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        base_url: &str,
        room_id: RoomId,
        user_id: UserId,
        policy: RetryPolicy,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>)> {
        let url = signaling_url(base_url, &room_id, &user_id);
        let transport = connector.connect(&url).await?;
        info!("signaling connected to room {room_id} as {user_id}");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let status = Arc::new(watch::Sender::new(ConnectionStatus::Open));
        let shutdown = Arc::new(Notify::new());

        let connection = Connection {
            connector,
            url,
            policy,
            transport,
            outbound: outbound_rx,
            events: events_tx,
            status: Arc::clone(&status),
            shutdown: Arc::clone(&shutdown),
        };
        tokio::spawn(connection.run());

        let client = Self {
            inner: Arc::new(Inner {
                room_id,
                user_id,
                outbound: outbound_tx,
                status,
                shutdown,
            }),
        };
        Ok((client, events_rx))
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.inner.room_id
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Queues a message for the relay.
    ///
    /// # Errors
    /// [`Error::NotConnected`] unless the transport is currently open.
    pub fn send(&self, message: &SignalMessage) -> Result<()> {
        if self.status() != ConnectionStatus::Open {
            return Err(Error::NotConnected);
        }
        let frame = serde_json::to_string(message)?;
        self.inner
            .outbound
            .send(frame)
            .or(Err(Error::NotConnected))
    }

    /// Sends a best-effort `leave` and closes the transport without reconnecting.
    pub fn disconnect(&self) {
        let current = self.status();
        if matches!(current, ConnectionStatus::Closed | ConnectionStatus::Failed) {
            return;
        }
        if current == ConnectionStatus::Open {
            let leave = SignalMessage::leave(self.inner.room_id.clone(), self.inner.user_id.clone());
            if let Err(error) = self.send(&leave) {
                debug!("could not announce leave: {error}");
            }
        }
        self.inner.status.send_replace(ConnectionStatus::Closed);
        self.inner.shutdown.notify_one();
    }
}

impl SignalSink for SignalingClient {
    fn send_signal(&self, message: SignalMessage) -> Result<()> {
        self.send(&message)
    }
}

enum Interruption {
    Shutdown,
    Lost,
}

enum Reconnect {
    Connected(Box<dyn Transport>),
    Exhausted,
    Cancelled,
}

struct Connection {
    connector: Arc<dyn Connector>,
    url: String,
    policy: RetryPolicy,
    transport: Box<dyn Transport>,
    outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    shutdown: Arc<Notify>,
}

impl Connection {
    async fn run(mut self) {
        loop {
            if let Interruption::Shutdown = self.pump().await {
                if let Err(error) = self.transport.close().await {
                    debug!("closing signaling transport: {error}");
                }
                self.status.send_replace(ConnectionStatus::Closed);
                info!("signaling disconnected from {}", self.url);
                return;
            }

            warn!("signaling transport to {} dropped", self.url);
            self.status.send_replace(ConnectionStatus::Reconnecting);
            self.discard_queued();

            match self.reconnect().await {
                Reconnect::Connected(transport) => {
                    self.transport = transport;
                    self.discard_queued();
                    self.status.send_replace(ConnectionStatus::Open);
                    info!("signaling reconnected to {}", self.url);
                    self.emit(SignalingEvent::Reconnected);
                }
                Reconnect::Exhausted => {
                    self.status.send_replace(ConnectionStatus::Failed);
                    warn!(
                        "giving up on {} after {} attempts",
                        self.url, self.policy.max_attempts
                    );
                    self.emit(SignalingEvent::ConnectionFailed);
                    return;
                }
                Reconnect::Cancelled => {
                    self.status.send_replace(ConnectionStatus::Closed);
                    return;
                }
            }
        }
    }

    async fn pump(&mut self) -> Interruption {
        loop {
            tokio::select! {
                biased;
                frame = self.outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(error) = self.transport.send(frame).await {
                            warn!("signaling send failed: {error}");
                            return Interruption::Lost;
                        }
                    }
                    None => return Interruption::Shutdown,
                },
                () = self.shutdown.notified() => return Interruption::Shutdown,
                incoming = self.transport.recv() => match incoming {
                    Some(Ok(frame)) => self.deliver(&frame),
                    Some(Err(error)) => {
                        warn!("signaling receive failed: {error}");
                        return Interruption::Lost;
                    }
                    None => return Interruption::Lost,
                },
            }
        }
    }

    async fn reconnect(&mut self) -> Reconnect {
        for attempt in 1..=self.policy.max_attempts {
            let Some(delay) = self.policy.delay_for(attempt) else {
                break;
            };
            info!("reconnecting to {} in {delay:?} (attempt {attempt})", self.url);
            self.emit(SignalingEvent::Reconnecting { attempt, delay });

            tokio::select! {
                () = self.shutdown.notified() => return Reconnect::Cancelled,
                () = tokio::time::sleep(delay) => {}
            }
            let connected = tokio::select! {
                () = self.shutdown.notified() => return Reconnect::Cancelled,
                connected = self.connector.connect(&self.url) => connected,
            };
            match connected {
                Ok(transport) => return Reconnect::Connected(transport),
                Err(error) => warn!("reconnection attempt {attempt} failed: {error}"),
            }
        }
        Reconnect::Exhausted
    }

    fn deliver(&self, frame: &str) {
        match serde_json::from_str::<SignalMessage>(frame) {
            Ok(message) => self.emit(SignalingEvent::Message(message)),
            Err(error) => warn!("dropping unparsable signaling frame: {error}"),
        }
    }

    fn discard_queued(&mut self) {
        let mut discarded = 0_usize;
        while self.outbound.try_recv().is_ok() {
            discarded = discarded.saturating_add(1);
        }
        if discarded > 0 {
            warn!("discarded {discarded} frames queued while reconnecting");
        }
    }

    fn emit(&self, event: SignalingEvent) {
        if self.events.send(event).is_err() {
            debug!("signaling event dropped, no consumer");
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use peercall_protocol::SignalKind;

    use super::testing::ChannelConnector;
    use super::*;

    fn room() -> RoomId {
        RoomId::from("video-call-conv123-1")
    }

    async fn connect(
        connector: &ChannelConnector,
        policy: RetryPolicy,
    ) -> (SignalingClient, mpsc::UnboundedReceiver<SignalingEvent>) {
        SignalingClient::connect(
            Arc::new(connector.clone()),
            "ws://relay.test/ws",
            room(),
            UserId::from("alice"),
            policy,
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_url_carries_encoded_query() {
        let url = signaling_url(
            "ws://relay.test/ws",
            &RoomId::from("group-call-circle 1-5"),
            &UserId::from("bob&co"),
        );
        assert_eq!(
            url,
            "ws://relay.test/ws?roomId=group-call-circle%201-5&userId=bob%26co"
        );
    }

    #[tokio::test]
    async fn test_initial_connection_failure_is_an_error() {
        let connector = ChannelConnector::new();
        connector.refuse_connections(true);
        let result = SignalingClient::connect(
            Arc::new(connector.clone()),
            "ws://relay.test/ws",
            room(),
            UserId::from("alice"),
            RetryPolicy::default(),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways_in_order() {
        let connector = ChannelConnector::new();
        let (client, mut events) = connect(&connector, RetryPolicy::default()).await;
        let mut server = connector.accepted().await;
        assert!(server.url.contains("roomId=video-call-conv123-1"));

        for n in 0..10 {
            let offer = SignalMessage::offer(
                room(),
                UserId::from("alice"),
                UserId::from("bob"),
                format!("sdp-{n}"),
            );
            client.send(&offer).unwrap();
        }
        for n in 0..10 {
            let frame = server.from_client.recv().await.unwrap();
            let message: SignalMessage = serde_json::from_str(&frame).unwrap();
            assert_eq!(message.data.sdp, Some(format!("sdp-{n}")));
        }

        let joined = SignalMessage::peer_joined(room(), UserId::from("bob"));
        server
            .to_client
            .send(serde_json::to_string(&joined).unwrap())
            .unwrap();
        server.to_client.send("not json".to_owned()).unwrap();
        let left = SignalMessage::peer_left(room(), UserId::from("bob"));
        server
            .to_client
            .send(serde_json::to_string(&left).unwrap())
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            SignalingEvent::Message(joined)
        );
        assert_eq!(events.recv().await.unwrap(), SignalingEvent::Message(left));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_unexpected_close() {
        let connector = ChannelConnector::new();
        let (client, mut events) = connect(&connector, RetryPolicy::default()).await;
        let first = connector.accepted().await;

        drop(first);
        assert_eq!(
            events.recv().await.unwrap(),
            SignalingEvent::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(500)
            }
        );
        assert!(matches!(
            client.send(&SignalMessage::leave(room(), UserId::from("alice"))),
            Err(Error::NotConnected)
        ));

        assert_eq!(events.recv().await.unwrap(), SignalingEvent::Reconnected);
        let mut second = connector.accepted().await;
        assert_eq!(client.status(), ConnectionStatus::Open);

        let offer = SignalMessage::offer(room(), UserId::from("alice"), UserId::from("bob"), "v=0".to_owned());
        client.send(&offer).unwrap();
        let frame = second.from_client.recv().await.unwrap();
        let message: SignalMessage = serde_json::from_str(&frame).unwrap();
        assert_eq!(message.kind, SignalKind::Offer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_policy_fails_exactly_once() {
        let connector = ChannelConnector::new();
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let (client, mut events) = connect(&connector, policy).await;
        let server = connector.accepted().await;

        connector.refuse_connections(true);
        drop(server);

        let mut attempts = Vec::new();
        loop {
            match events.recv().await {
                Some(SignalingEvent::Reconnecting { attempt, .. }) => attempts.push(attempt),
                Some(SignalingEvent::ConnectionFailed) => break,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(events.recv().await, None);
        assert_eq!(client.status(), ConnectionStatus::Failed);
        // initial connection plus three retries
        assert_eq!(connector.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_never_reconnects() {
        let connector = ChannelConnector::new();
        let (client, mut events) = connect(&connector, RetryPolicy::default()).await;
        let mut server = connector.accepted().await;

        client.disconnect();

        let frame = server.from_client.recv().await.unwrap();
        let message: SignalMessage = serde_json::from_str(&frame).unwrap();
        assert_eq!(message.kind, SignalKind::Leave);

        assert_eq!(events.recv().await, None);
        assert_eq!(client.status(), ConnectionStatus::Closed);
        assert_eq!(connector.attempts(), 1);
        assert!(matches!(
            client.send(&SignalMessage::leave(room(), UserId::from("alice"))),
            Err(Error::NotConnected)
        ));
    }
}

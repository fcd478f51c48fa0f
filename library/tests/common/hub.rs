//! In-memory relay speaking the signaling protocol.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use peercall::protocol::{RoomId, SignalKind, SignalMessage, UserId};
use tokio::sync::mpsc;

use peercall::signaling::{Connector, Transport};

#[derive(Default)]
struct HubState {
    rooms: BTreeMap<RoomId, BTreeMap<UserId, (u64, mpsc::UnboundedSender<String>)>>,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct Hub {
    state: Arc<Mutex<HubState>>,
    refuse: Arc<AtomicBool>,
}

fn frame(message: &SignalMessage) -> String {
    serde_json::to_string(message).unwrap()
}

fn query_param(url: &str, name: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| urlencoding::decode(value).unwrap().into_owned())
    })
}

impl Hub {
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Drops the socket of `user` the way a network hiccup would: the others
    /// see `peer-left` and the client sees its connection close.
    pub fn drop_socket(&self, room: &RoomId, user: &UserId) {
        let id = self
            .state
            .lock()
            .unwrap()
            .rooms
            .get(room)
            .and_then(|members| members.get(user))
            .map(|&(id, _)| id);
        if let Some(id) = id {
            self.leave(room, user, id);
        }
    }

    pub fn members(&self, room: &RoomId) -> Vec<UserId> {
        self.state
            .lock()
            .unwrap()
            .rooms
            .get(room)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn leave(&self, room: &RoomId, user: &UserId, id: u64) {
        let mut state = self.state.lock().unwrap();
        let Some(members) = state.rooms.get_mut(room) else {
            return;
        };
        if members.get(user).map(|&(current, _)| current) != Some(id) {
            return;
        }
        members.remove(user);
        for (_, tx) in members.values() {
            let _ = tx.send(frame(&SignalMessage::peer_left(room.clone(), user.clone())));
        }
        if members.is_empty() {
            state.rooms.remove(room);
        }
    }

    fn route(&self, room: &RoomId, sender: &UserId, mut message: SignalMessage) {
        let Some(target) = message.to_peer_id.clone() else {
            return;
        };
        message.from_user_id = sender.clone();
        message.room_id = room.clone();
        let state = self.state.lock().unwrap();
        if let Some((_, tx)) = state.rooms.get(room).and_then(|members| members.get(&target)) {
            let _ = tx.send(frame(&message));
        }
    }
}

#[async_trait]
impl Connector for Hub {
    async fn connect(&self, url: &str) -> anyhow::Result<Box<dyn Transport>> {
        if self.refuse.load(Ordering::SeqCst) {
            bail!("relay unavailable");
        }
        let room = RoomId::new(query_param(url, "roomId").ok_or_else(|| anyhow!("no roomId"))?);
        let user = UserId::new(query_param(url, "userId").ok_or_else(|| anyhow!("no userId"))?);
        let (tx, inbound) = mpsc::unbounded_channel();

        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        let members = state.rooms.entry(room.clone()).or_default();
        let existing: Vec<UserId> = members.keys().filter(|peer| **peer != user).cloned().collect();
        for (peer, (_, peer_tx)) in members.iter() {
            if *peer != user {
                let _ = peer_tx.send(frame(&SignalMessage::peer_joined(room.clone(), user.clone())));
            }
        }
        let _ = tx.send(frame(&SignalMessage::existing_peers(
            room.clone(),
            user.clone(),
            existing,
        )));
        members.insert(user.clone(), (id, tx));
        drop(state);

        Ok(Box::new(HubTransport {
            hub: self.clone(),
            room,
            user,
            id,
            inbound,
        }))
    }
}

struct HubTransport {
    hub: Hub,
    room: RoomId,
    user: UserId,
    id: u64,
    inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for HubTransport {
    async fn send(&mut self, frame: String) -> anyhow::Result<()> {
        let message: SignalMessage = serde_json::from_str(&frame)?;
        match message.kind {
            SignalKind::Leave => self.hub.leave(&self.room, &self.user, self.id),
            kind if kind.is_directed() => self.hub.route(&self.room, &self.user, message),
            _ => {}
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<anyhow::Result<String>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.hub.leave(&self.room, &self.user, self.id);
        Ok(())
    }
}

impl Drop for HubTransport {
    fn drop(&mut self) {
        self.hub.leave(&self.room, &self.user, self.id);
    }
}

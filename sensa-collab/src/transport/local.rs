//! In-process realtime service.
//!
//! [`LocalRealtime`] plays the part of the relay for clients living in the
//! same process: it owns the topic rooms, routes store changes onto them and
//! can be switched offline to simulate an outage.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::{ChannelEvent, ChannelHandle, ChannelStatus, RealtimeTransport};
use crate::broadcast::{BroadcastGroup, Envelope, RoomManager};
use crate::error::{CollabError, Result};
use crate::model::{ClientId, SessionId};
use crate::protocol::{session_topic, Frame};
use crate::store::ChangeFeed;

pub struct LocalRealtime {
    rooms: RoomManager,
    online: watch::Sender<bool>,
    capacity: usize,
    routers: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalRealtime {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (online, _) = watch::channel(true);
        Arc::new(Self {
            rooms: RoomManager::new(capacity),
            online,
            capacity,
            routers: Mutex::new(Vec::new()),
        })
    }

    /// A new client connection to this hub.
    pub fn connect(self: &Arc<Self>) -> LocalTransport {
        LocalTransport {
            client_id: ClientId::new(),
            hub: self.clone(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Taking the hub offline drops deliveries, refuses sends and moves
    /// every open channel to `Error`. Coming back online reconnects them.
    pub fn set_online(&self, online: bool) {
        let previous = self.online.send_replace(online);
        if previous != online {
            log::info!("Local realtime hub is now {}", if online { "online" } else { "offline" });
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Route every change published on `feed` to its session's topic.
    pub fn attach_change_feed(self: &Arc<Self>, feed: &ChangeFeed) {
        let mut rx = feed.subscribe();
        let hub: Weak<Self> = Arc::downgrade(self);
        let router = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => {
                        let Some(hub) = hub.upgrade() else { break };
                        if hub.is_online() {
                            hub.rooms.route_table_change(&change).await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Change router lagged, {skipped} changes dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.routers.lock().push(router);
    }

    pub async fn member_count(&self, session_id: SessionId) -> usize {
        match self.rooms.get(&session_topic(session_id)).await {
            Some(room) => room.member_count().await,
            None => 0,
        }
    }
}

impl Drop for LocalRealtime {
    fn drop(&mut self) {
        for router in self.routers.lock().drain(..) {
            router.abort();
        }
    }
}

struct LocalChannel {
    handle: ChannelHandle,
    group: Arc<BroadcastGroup>,
    pump: JoinHandle<()>,
}

/// One client's connection to a [`LocalRealtime`] hub.
pub struct LocalTransport {
    client_id: ClientId,
    hub: Arc<LocalRealtime>,
    channels: Mutex<HashMap<SessionId, LocalChannel>>,
}

impl LocalTransport {
    pub fn hub(&self) -> &Arc<LocalRealtime> {
        &self.hub
    }

    /// Drop every channel at once, as a closed tab would.
    pub async fn disconnect(&self) {
        let channels: Vec<LocalChannel> = self.channels.lock().drain().map(|(_, c)| c).collect();
        for channel in channels {
            self.teardown(channel).await;
        }
    }

    async fn teardown(&self, channel: LocalChannel) {
        channel.pump.abort();
        channel.group.remove_member(self.client_id).await;
        self.hub.rooms.remove_if_empty(channel.group.topic()).await;
        channel.handle.close();
        log::info!("Client {} left {}", self.client_id, channel.group.topic());
    }

    fn live_group(&self, channel: &ChannelHandle) -> Result<Arc<BroadcastGroup>> {
        if !self.hub.is_online() {
            channel.set_status(ChannelStatus::Error);
            return Err(CollabError::channel("realtime service unreachable"));
        }
        let status = channel.status();
        if status != ChannelStatus::Connected {
            return Err(CollabError::channel(format!("channel {} is {status:?}", channel.topic())));
        }
        self.channels
            .lock()
            .get(&channel.session_id())
            .filter(|c| c.handle.same_channel(channel))
            .map(|c| c.group.clone())
            .ok_or_else(|| CollabError::channel(format!("channel {} is not open", channel.topic())))
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        for (_, channel) in self.channels.lock().drain() {
            channel.pump.abort();
            channel.handle.close();
        }
    }
}

async fn pump(
    mut rx: broadcast::Receiver<Arc<Envelope>>,
    handle: ChannelHandle,
    me: ClientId,
    mut online: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(envelope) => {
                    if !*online.borrow() || !envelope.is_for(me) {
                        continue;
                    }
                    match Frame::decode(&envelope.bytes).and_then(|f| ChannelEvent::from_frame(&f)) {
                        Ok(Some(event)) => handle.dispatch(event),
                        Ok(None) => {}
                        Err(e) => log::warn!("Dropping undecodable frame on {}: {e}", handle.topic()),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Channel {} lagged, {skipped} frames dropped", handle.topic());
                }
                Err(RecvError::Closed) => break,
            },
            changed = online.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = if *online.borrow() {
                    ChannelStatus::Connected
                } else {
                    ChannelStatus::Error
                };
                handle.set_status(status);
            }
        }
    }
}

#[async_trait]
impl RealtimeTransport for LocalTransport {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    async fn open_channel(&self, session_id: SessionId) -> Result<ChannelHandle> {
        let stale = {
            let mut channels = self.channels.lock();
            match channels.get(&session_id) {
                Some(existing) if existing.handle.status() == ChannelStatus::Connected => {
                    return Ok(existing.handle.clone());
                }
                Some(_) => channels.remove(&session_id),
                None => None,
            }
        };
        if let Some(stale) = stale {
            self.teardown(stale).await;
        }

        if !self.hub.is_online() {
            return Err(CollabError::channel("realtime service unreachable"));
        }

        let topic = session_topic(session_id);
        let group = self.hub.rooms.get_or_create(&topic).await;
        let handle = ChannelHandle::new(session_id, self.hub.capacity);
        let rx = group.add_member(self.client_id).await;
        for presence in group.presence_list().await {
            handle.dispatch(ChannelEvent::Presence(presence));
        }
        handle.set_status(ChannelStatus::Connected);

        let pump = tokio::spawn(pump(rx, handle.clone(), self.client_id, self.hub.online.subscribe()));
        let replaced = self.channels.lock().insert(
            session_id,
            LocalChannel {
                handle: handle.clone(),
                group,
                pump,
            },
        );
        if let Some(old) = replaced {
            old.pump.abort();
            old.handle.close();
        }
        log::info!("Client {} joined {topic}", self.client_id);
        Ok(handle)
    }

    async fn broadcast(&self, channel: &ChannelHandle, event: &str, payload: Value) -> Result<()> {
        let group = self.live_group(channel)?;
        let frame = Frame::broadcast(channel.topic(), 0, event, &payload)?;
        let receivers = group.publish(Some(self.client_id), &frame)?;
        log::debug!("Broadcast {event} on {} to {receivers} receivers", channel.topic());
        Ok(())
    }

    async fn track(&self, channel: &ChannelHandle, key: &str, state: Value) -> Result<()> {
        let group = self.live_group(channel)?;
        group.track(self.client_id, key, state).await;
        Ok(())
    }

    async fn untrack(&self, channel: &ChannelHandle, key: &str) -> Result<()> {
        let group = self.live_group(channel)?;
        group.untrack(self.client_id, key).await;
        Ok(())
    }

    async fn close_channel(&self, channel: &ChannelHandle) {
        let entry = {
            let mut channels = self.channels.lock();
            match channels.get(&channel.session_id()) {
                Some(c) if c.handle.same_channel(channel) => channels.remove(&channel.session_id()),
                _ => None,
            }
        };
        match entry {
            Some(entry) => self.teardown(entry).await,
            None => channel.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChangeKind, PresenceEvent, Table, TableChange};
    use crate::transport::TableFilter;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_open_channel_is_idempotent() {
        let hub = LocalRealtime::new(32);
        let client = hub.connect();
        let session_id = SessionId::new();

        let a = client.open_channel(session_id).await.unwrap();
        let b = client.open_channel(session_id).await.unwrap();
        assert!(a.same_channel(&b));
        assert_eq!(hub.member_count(session_id).await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let hub = LocalRealtime::new(32);
        let alice = hub.connect();
        let bob = hub.connect();
        let session_id = SessionId::new();

        let a = alice.open_channel(session_id).await.unwrap();
        let b = bob.open_channel(session_id).await.unwrap();
        let mut alice_sub = a.on_broadcast("operation");
        let mut bob_sub = b.on_broadcast("operation");

        for i in 0..3 {
            alice.broadcast(&a, "operation", json!(i)).await.unwrap();
        }
        for i in 0..3 {
            let msg = timeout(WAIT, bob_sub.recv()).await.unwrap().unwrap();
            assert_eq!(msg.payload, json!(i));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(alice_sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_offline_hub_refuses() {
        let hub = LocalRealtime::new(32);
        let client = hub.connect();
        let session_id = SessionId::new();
        let channel = client.open_channel(session_id).await.unwrap();
        let mut status = channel.watch_status();

        hub.set_online(false);
        timeout(WAIT, status.wait_for(|s| *s == ChannelStatus::Error))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            client.broadcast(&channel, "operation", json!({})).await,
            Err(CollabError::Channel(_))
        ));
        assert!(matches!(
            client.open_channel(SessionId::new()).await,
            Err(CollabError::Channel(_))
        ));

        hub.set_online(true);
        timeout(WAIT, status.wait_for(|s| *s == ChannelStatus::Connected))
            .await
            .unwrap()
            .unwrap();
        let reopened = client.open_channel(session_id).await.unwrap();
        assert!(reopened.same_channel(&channel));
        client.broadcast(&channel, "operation", json!({})).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_publishes_presence_leave() {
        let hub = LocalRealtime::new(32);
        let alice = hub.connect();
        let bob = hub.connect();
        let session_id = SessionId::new();

        let a = alice.open_channel(session_id).await.unwrap();
        let b = bob.open_channel(session_id).await.unwrap();
        let mut presence = b.on_presence_change();

        alice.track(&a, "alice-tab", json!({ "name": "Alice" })).await.unwrap();
        let joined = timeout(WAIT, presence.recv()).await.unwrap().unwrap();
        assert!(matches!(joined, PresenceEvent::Join { ref key, .. } if key == "alice-tab"));

        alice.disconnect().await;
        let left = timeout(WAIT, presence.recv()).await.unwrap().unwrap();
        assert_eq!(left, PresenceEvent::Leave { key: "alice-tab".into() });
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_late_joiner_sees_existing_presence() {
        let hub = LocalRealtime::new(32);
        let alice = hub.connect();
        let session_id = SessionId::new();
        let a = alice.open_channel(session_id).await.unwrap();
        alice.track(&a, "alice-tab", json!({ "x": 1 })).await.unwrap();

        let bob = hub.connect();
        let b = bob.open_channel(session_id).await.unwrap();
        assert_eq!(b.presence_state()["alice-tab"], json!({ "x": 1 }));
    }

    #[tokio::test]
    async fn test_change_feed_routed_to_topic() {
        let hub = LocalRealtime::new(32);
        let feed = ChangeFeed::new(32);
        hub.attach_change_feed(&feed);

        let client = hub.connect();
        let session_id = SessionId::new();
        let channel = client.open_channel(session_id).await.unwrap();
        let mut sub = channel.on_table_change(TableFilter::table(Table::Snapshots));

        feed.publish(Table::Snapshots, ChangeKind::Insert, session_id, &json!({ "name": "v1" }));
        feed.publish(Table::Snapshots, ChangeKind::Insert, SessionId::new(), &json!({}));

        let change: TableChange = timeout(WAIT, sub.recv()).await.unwrap().unwrap();
        assert_eq!(change.session_id, session_id);
        assert_eq!(change.record["name"], "v1");
    }

    #[tokio::test]
    async fn test_close_channel_twice() {
        let hub = LocalRealtime::new(32);
        let client = hub.connect();
        let session_id = SessionId::new();
        let channel = client.open_channel(session_id).await.unwrap();

        client.close_channel(&channel).await;
        client.close_channel(&channel).await;
        assert!(channel.is_closed());
        assert_eq!(hub.member_count(session_id).await, 0);
    }
}

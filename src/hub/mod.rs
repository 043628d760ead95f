pub mod cache;
pub mod source;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::domain::ConnectionState;
use cache::ActionCache;
use source::Source;

/// Identifier the hub hands out per registered subscriber.
pub type ClientId = u64;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// The hub-side handle of a subscriber. The hub holds the only sender for
/// the subscriber's delivery channel, so dropping this handle is the one
/// and only way that channel closes.
pub struct HubFeedClient {
    pub id: ClientId,
    pub internal: bool,
    tx: mpsc::Sender<Vec<u8>>,
}

impl HubFeedClient {
    /// Deliver a frame the way the hub's fan-out would.
    #[cfg(test)]
    pub(crate) async fn send_for_test(&self, frame: Vec<u8>) {
        let _ = self.tx.send(frame).await;
    }
}

/// Create a subscriber handle and its delivery channel. The channel holds a
/// single frame, so fan-out to a subscriber that stopped reading blocks.
pub fn new_hub_feed_client(internal: bool) -> (HubFeedClient, mpsc::Receiver<Vec<u8>>) {
    let (tx, rx) = mpsc::channel(1);
    let client = HubFeedClient {
        id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
        internal,
        tx,
    };
    (client, rx)
}

/// Connection status of the upstream feed as reported on the local API.
#[derive(Debug, Clone, Serialize)]
pub struct WebsocketStatus {
    #[serde(rename = "readyState")]
    pub ready_state: String,
    #[serde(rename = "remoteFeedUrl")]
    pub remote_feed_url: String,
    #[serde(rename = "connectedClients")]
    pub connected_clients: u32,
}

/// Maintains the set of active subscribers, replays cached pending actions
/// to newcomers and broadcasts every upstream frame to all of them.
///
/// Fan-out is synchronous: one frame is delivered to every subscriber before
/// the next frame is taken off the broadcast channel, so a slow subscriber
/// stalls the hub. Replay and fan-out run under the same lock, which makes
/// the replay-then-live handoff gapless.
pub struct FeedHub {
    source: Arc<dyn Source>,
    cache: Option<Arc<dyn ActionCache>>,
    clients: Arc<Mutex<HashMap<ClientId, HubFeedClient>>>,
    is_running: Arc<AtomicBool>,
}

impl FeedHub {
    pub fn new(source: Arc<dyn Source>, cache: Option<Arc<dyn ActionCache>>) -> Self {
        Self {
            source,
            cache,
            clients: Arc::new(Mutex::new(HashMap::new())),
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True only while the fan-out loop is alive.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Connect the source and start the fan-out. Returns false without side
    /// effects when the source cannot connect.
    pub async fn run(&self) -> bool {
        if !self.source.connect().await {
            return false;
        }

        let mut broadcast = match self.source.take_receiver() {
            Some(rx) => rx,
            None => {
                debug!("FeedHub: broadcast channel already taken");
                return false;
            }
        };

        self.is_running.store(true, Ordering::SeqCst);

        {
            let source = Arc::clone(&self.source);
            tokio::spawn(async move { source.listen().await });
        }

        let clients = Arc::clone(&self.clients);
        let cache = self.cache.clone();
        let is_running = Arc::clone(&self.is_running);

        tokio::spawn(async move {
            while let Some(frame) = broadcast.recv().await {
                let mut clients = clients.lock().await;
                debug!("FeedHub: message received: {}", String::from_utf8_lossy(&frame));

                if let Some(cache) = &cache {
                    cache.add(&frame).await;
                }

                // send the frame to every connected subscriber; a subscriber
                // that dropped its receiver is unregistered on the spot
                let mut gone = Vec::new();
                for (id, client) in clients.iter() {
                    if client.tx.send(frame.clone()).await.is_err() {
                        gone.push(*id);
                    }
                }
                for id in gone {
                    clients.remove(&id);
                    info!("FeedHub: feed client dropped its channel, unregistered");
                }
            }

            info!("FeedHub: the broadcast channel was closed");
            is_running.store(false, Ordering::SeqCst);

            // closing every remaining subscriber channel
            let mut clients = clients.lock().await;
            if !clients.is_empty() {
                info!("FeedHub: closing feed clients");
                clients.clear();
            }
        });

        true
    }

    /// Disconnect the source. Its outbound channel closes, the fan-out loop
    /// exits and every subscriber channel is closed in turn.
    pub async fn stop(&self) {
        if self.source.ready_state() == ConnectionState::Open {
            self.source.disconnect().await;
        }

        info!("FeedHub: stopped");
    }

    /// Add a subscriber. Every live cached frame is pushed to it first, so
    /// it observes all currently pending actions and then the live stream
    /// without a gap.
    pub async fn register_client(&self, client: HubFeedClient) {
        let mut clients = self.clients.lock().await;

        if let Some(cache) = &self.cache {
            for frame in cache.get_all().await {
                if client.tx.send(frame).await.is_err() {
                    // receiver already gone, nothing to register
                    return;
                }
            }
        }

        clients.insert(client.id, client);
        info!("FeedHub: new feed client registered");
    }

    /// Remove a subscriber and close its delivery channel. A second call for
    /// the same id is a no-op.
    pub async fn unregister_client(&self, id: ClientId) {
        let mut clients = self.clients.lock().await;
        if clients.remove(&id).is_some() {
            info!("FeedHub: feed client unregistered");
        }
    }

    pub async fn websocket_status(&self) -> WebsocketStatus {
        let clients = self.clients.lock().await;
        let external = clients.values().filter(|c| !c.internal).count();

        WebsocketStatus {
            ready_state: self.source.ready_state().to_string(),
            remote_feed_url: self.source.feed_url(),
            connected_clients: external as u32,
        }
    }
}

/// Source fake fed by a test-held channel. Dropping the test's sender
/// stands in for the upstream connection going away for good.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex as StdMutex;

    pub(crate) struct ChannelSource {
        state: StdMutex<ConnectionState>,
        rx: StdMutex<Option<mpsc::Receiver<Vec<u8>>>>,
        connectable: bool,
    }

    impl ChannelSource {
        pub(crate) fn new(connectable: bool) -> (Arc<Self>, mpsc::Sender<Vec<u8>>) {
            let (tx, rx) = mpsc::channel(1);
            let source = Arc::new(Self {
                state: StdMutex::new(ConnectionState::Closed),
                rx: StdMutex::new(Some(rx)),
                connectable,
            });
            (source, tx)
        }
    }

    #[async_trait::async_trait]
    impl Source for ChannelSource {
        async fn connect(&self) -> bool {
            if self.connectable {
                *self.state.lock().unwrap() = ConnectionState::Open;
            }
            self.connectable
        }

        async fn listen(&self) {}

        async fn disconnect(&self) {
            *self.state.lock().unwrap() = ConnectionState::Closed;
        }

        fn ready_state(&self) -> ConnectionState {
            *self.state.lock().unwrap()
        }

        fn feed_url(&self) -> String {
            "wss://feed.example.net".to_string()
        }

        fn take_receiver(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
            self.rx.lock().unwrap().take()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ChannelSource;
    use super::*;
    use crate::hub::cache::LocalActionCache;
    use chrono::Utc;
    use std::time::Duration;

    fn frame(id: &str, expire_offset: i64) -> Vec<u8> {
        format!(
            r#"{{"id":"{}","status":1,"messages":["ff"],"expireTime":{}}}"#,
            id,
            Utc::now().timestamp() + expire_offset
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn test_run_fails_when_source_cannot_connect() {
        let (source, _tx) = ChannelSource::new(false);
        let hub = FeedHub::new(source, None);

        assert!(!hub.run().await);
        assert!(!hub.is_running());
    }

    #[tokio::test]
    async fn test_fan_out_delivers_in_order() {
        let (source, tx) = ChannelSource::new(true);
        let hub = FeedHub::new(source, None);
        assert!(hub.run().await);

        let (client, mut rx) = new_hub_feed_client(false);
        hub.register_client(client).await;

        tx.send(frame("a", 60)).await.unwrap();
        tx.send(frame("b", 60)).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(String::from_utf8_lossy(&first).contains("\"a\""));
        assert!(String::from_utf8_lossy(&second).contains("\"b\""));
    }

    #[tokio::test]
    async fn test_cached_replay_skips_expired_entries() {
        let cache = Arc::new(LocalActionCache::new());
        cache.add(&frame("a", 60)).await;
        // expired entry never makes it into the cache
        cache.add(&frame("b", -1)).await;

        let (source, _tx) = ChannelSource::new(true);
        let hub = FeedHub::new(source, Some(cache.clone()));
        assert!(hub.run().await);

        let (client, mut rx) = new_hub_feed_client(false);
        hub.register_client(client).await;

        let replayed = rx.recv().await.unwrap();
        assert!(String::from_utf8_lossy(&replayed).contains("\"a\""));

        // nothing else was cached
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
        assert_eq!(cache.get_all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_replay_precedes_live_frames() {
        let cache = Arc::new(LocalActionCache::new());
        cache.add(&frame("cached", 60)).await;

        let (source, tx) = ChannelSource::new(true);
        let hub = Arc::new(FeedHub::new(source, Some(cache)));
        assert!(hub.run().await);

        let (client, mut rx) = new_hub_feed_client(false);
        hub.register_client(client).await;
        tx.send(frame("live", 60)).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(String::from_utf8_lossy(&first).contains("cached"));
        assert!(String::from_utf8_lossy(&second).contains("live"));
    }

    #[tokio::test]
    async fn test_slow_subscriber_stalls_fan_out() {
        let (source, tx) = ChannelSource::new(true);
        let hub = FeedHub::new(source, None);
        assert!(hub.run().await);

        let (fast, mut fast_rx) = new_hub_feed_client(false);
        let (slow, slow_rx) = new_hub_feed_client(false);
        hub.register_client(fast).await;
        hub.register_client(slow).await;

        // the slow subscriber never reads: its one-frame buffer fills and
        // the hub blocks, so the fast one cannot run ahead by more than the
        // in-flight frames
        let sender = tokio::spawn(async move {
            for i in 0..4 {
                if tx.send(frame(&format!("f{}", i), 60)).await.is_err() {
                    break;
                }
            }
            tx
        });

        let mut fast_received = 0;
        while tokio::time::timeout(Duration::from_millis(50), fast_rx.recv())
            .await
            .ok()
            .flatten()
            .is_some()
        {
            fast_received += 1;
        }
        assert!(fast_received < 4, "fan-out did not stall, got {}", fast_received);

        // dropping the slow receiver unblocks the hub
        drop(slow_rx);
        let next = tokio::time::timeout(Duration::from_secs(1), fast_rx.recv()).await;
        assert!(next.is_ok(), "fast subscriber still blocked");

        let _tx = sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_close_cascades_to_subscribers() {
        let (source, tx) = ChannelSource::new(true);
        let hub = FeedHub::new(source, None);
        assert!(hub.run().await);

        let (client, mut rx) = new_hub_feed_client(false);
        hub.register_client(client).await;

        // upstream goes away for good
        drop(tx);

        assert!(rx.recv().await.is_none());

        // the fan-out loop has stopped
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!hub.is_running());
    }

    #[tokio::test]
    async fn test_unregister_twice_is_noop() {
        let (source, _tx) = ChannelSource::new(true);
        let hub = FeedHub::new(source, None);
        assert!(hub.run().await);

        let (client, mut rx) = new_hub_feed_client(false);
        let id = client.id;
        hub.register_client(client).await;

        hub.unregister_client(id).await;
        assert!(rx.recv().await.is_none());
        hub.unregister_client(id).await;
    }

    #[tokio::test]
    async fn test_status_counts_only_external_clients() {
        let (source, _tx) = ChannelSource::new(true);
        let hub = FeedHub::new(source, None);
        assert!(hub.run().await);

        let (external, _ext_rx) = new_hub_feed_client(false);
        let (internal, _int_rx) = new_hub_feed_client(true);
        hub.register_client(external).await;
        hub.register_client(internal).await;

        let status = hub.websocket_status().await;
        assert_eq!(status.connected_clients, 1);
        assert_eq!(status.ready_state, "OPEN");
        assert_eq!(status.remote_feed_url, "wss://feed.example.net");
    }
}

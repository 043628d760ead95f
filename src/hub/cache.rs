use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use serde::Deserialize;
use tracing::{debug, error};

const KEY_PREFIX: &str = "transaction:";
const KEY_PATTERN: &str = "transaction:*";

/// The cache key and TTL source parsed out of a raw frame.
#[derive(Debug, Deserialize)]
struct FrameInfo {
    #[serde(default)]
    id: String,
    #[serde(rename = "expireTime", default)]
    expire_time: i64,
}

impl FrameInfo {
    /// Seconds until expiry; zero or negative means the frame is already
    /// dead and must not be cached.
    fn expiration_secs(&self) -> i64 {
        self.expire_time - Utc::now().timestamp()
    }
}

/// Store of non-expired pending action frames, keyed by action id. Late
/// subscribers are replayed from here on registration.
#[async_trait]
pub trait ActionCache: Send + Sync {
    /// Parse and store one frame. Unparseable or already-expired frames are
    /// silently dropped.
    async fn add(&self, frame: &[u8]);
    /// All currently live frames. Expired and unparseable entries are pruned
    /// as a side effect.
    async fn get_all(&self) -> Vec<Vec<u8>>;
    /// Drop the frame for the given action id. Idempotent.
    async fn remove(&self, action_id: &str);
}

/// In-process cache for single-instance deployments.
pub struct LocalActionCache {
    frames: Mutex<HashMap<String, Vec<u8>>>,
}

impl LocalActionCache {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for LocalActionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionCache for LocalActionCache {
    async fn add(&self, frame: &[u8]) {
        let info: FrameInfo = match serde_json::from_slice(frame) {
            Ok(info) => info,
            Err(e) => {
                debug!("ActionCache: dropping unparseable frame, err: {}", e);
                return;
            }
        };

        if info.expiration_secs() <= 0 {
            debug!("ActionCache: dropping expired frame `{}`", info.id);
            return;
        }

        let mut frames = self.frames.lock().expect("cache lock poisoned");
        frames.insert(info.id, frame.to_vec());
    }

    async fn get_all(&self) -> Vec<Vec<u8>> {
        let mut frames = self.frames.lock().expect("cache lock poisoned");

        // lazy GC: prune everything that no longer parses or has expired
        frames.retain(|_, frame| {
            serde_json::from_slice::<FrameInfo>(frame)
                .map(|info| info.expiration_secs() > 0)
                .unwrap_or(false)
        });

        frames.values().cloned().collect()
    }

    async fn remove(&self, action_id: &str) {
        debug!("ActionCache: removing frame with id `{}`", action_id);
        let mut frames = self.frames.lock().expect("cache lock poisoned");
        frames.remove(action_id);
    }
}

/// Cache shared across a fleet of agents through an external key-value
/// server. Entry expiry is delegated to the server's TTL handling.
pub struct SharedActionCache {
    conn: redis::aio::MultiplexedConnection,
}

impl SharedActionCache {
    pub fn new(conn: redis::aio::MultiplexedConnection) -> Self {
        Self { conn }
    }

    fn key(action_id: &str) -> String {
        format!("{}{}", KEY_PREFIX, action_id)
    }
}

#[async_trait]
impl ActionCache for SharedActionCache {
    async fn add(&self, frame: &[u8]) {
        let info: FrameInfo = match serde_json::from_slice(frame) {
            Ok(info) => info,
            Err(e) => {
                debug!("ActionCache: dropping unparseable frame, err: {}", e);
                return;
            }
        };

        let expiration = info.expiration_secs();
        if expiration <= 0 {
            debug!("ActionCache: dropping expired frame `{}`", info.id);
            return;
        }

        let mut conn = self.conn.clone();
        if let Err(e) = conn
            .set_ex::<_, _, ()>(Self::key(&info.id), frame, expiration as u64)
            .await
        {
            error!("ActionCache: error while storing frame `{}`: {}", info.id, e);
        }
    }

    async fn get_all(&self) -> Vec<Vec<u8>> {
        let mut conn = self.conn.clone();

        // collect the keys first, the scan borrows the connection
        let keys: Vec<String> = {
            let mut iter = match conn.scan_match::<_, String>(KEY_PATTERN).await {
                Ok(iter) => iter,
                Err(e) => {
                    error!("ActionCache: error while scanning frames: {}", e);
                    return Vec::new();
                }
            };

            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let mut frames = Vec::new();
        for key in keys {
            match conn.get::<_, Option<Vec<u8>>>(&key).await {
                // the entry may have expired between scan and get
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => {}
                Err(e) => error!("ActionCache: error while retrieving frames: {}", e),
            }
        }

        frames
    }

    async fn remove(&self, action_id: &str) {
        debug!("ActionCache: removing frame with id `{}`", action_id);

        let mut conn = self.conn.clone();
        if let Err(e) = conn.del::<_, ()>(Self::key(action_id)).await {
            error!("ActionCache: error while removing frame `{}`: {}", action_id, e);
        }
    }
}

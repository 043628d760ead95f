use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::debug;

use crate::config::LoadBalancingConfig;
use crate::error::{AgentError, Result};

const HANDLED_KEY_PREFIX: &str = "action_v2:";

/// How long an acquired action lock lives before the store reclaims it. A
/// crash while holding the lock must not block the action forever.
const LOCK_TTL: Duration = Duration::from_secs(8);

/// Mutual exclusion across a fleet of agents sharing one upstream identity:
/// each action id is acted on by at most one agent.
///
/// Two agents may both see the handled-marker absent; the lock breaks the
/// tie. At-most-once acting is guaranteed, at-least-once is not.
#[async_trait]
pub trait ActionSync: Send + Sync {
    /// False when some agent already handled this action id.
    async fn should_handle(&self, action_id: &str) -> bool;
    /// Take the cross-instance lock for the action. On failure the caller
    /// drops the action; another agent most likely holds it.
    async fn acquire_lock(&self, action_id: &str) -> Result<()>;
    /// Drop the lock and mark the action id handled for
    /// `actionIDExpirationSec`, whatever the lock state.
    async fn release(&self, action_id: &str) -> Result<()>;
}

/// ActionSync backed by the shared key-value server.
pub struct KvActionSync {
    conn: redis::aio::MultiplexedConnection,
    on_lock_error_timeout: Duration,
    action_id_expiration: Duration,
}

impl KvActionSync {
    pub fn new(conn: redis::aio::MultiplexedConnection, config: &LoadBalancingConfig) -> Self {
        Self {
            conn,
            on_lock_error_timeout: Duration::from_millis(config.on_lock_error_timeout_ms),
            action_id_expiration: Duration::from_secs(config.action_id_expiration_sec),
        }
    }

    fn handled_key(action_id: &str) -> String {
        format!("{}{}", HANDLED_KEY_PREFIX, action_id)
    }

    fn lock_key(action_id: &str) -> String {
        format!("lock:{}", action_id)
    }
}

#[async_trait]
impl ActionSync for KvActionSync {
    async fn should_handle(&self, action_id: &str) -> bool {
        let mut conn = self.conn.clone();

        match conn.exists::<_, bool>(Self::handled_key(action_id)).await {
            Ok(exists) => !exists,
            // treat a store failure as not handled; the lock still arbitrates
            Err(e) => {
                debug!("ActionSync: handled-marker check failed for `{}`: {}", action_id, e);
                true
            }
        }
    }

    async fn acquire_lock(&self, action_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();

        let acquired: std::result::Result<bool, redis::RedisError> = redis::cmd("SET")
            .arg(Self::lock_key(action_id))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(LOCK_TTL.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map(|value: redis::Value| !matches!(value, redis::Value::Nil));

        match acquired {
            Ok(true) => Ok(()),
            Ok(false) => {
                tokio::time::sleep(self.on_lock_error_timeout).await;
                Err(AgentError::LockNotAcquired(action_id.to_string()))
            }
            Err(e) => {
                tokio::time::sleep(self.on_lock_error_timeout).await;
                Err(AgentError::Kv(e))
            }
        }
    }

    async fn release(&self, action_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();

        let unlock = conn.del::<_, ()>(Self::lock_key(action_id)).await;

        // the marker is set regardless of the unlock outcome, it is what
        // keeps re-deliveries from being handled twice
        conn.set_ex::<_, _, ()>(Self::handled_key(action_id), 1, self.action_id_expiration.as_secs())
            .await?;

        unlock.map_err(AgentError::Kv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_naming() {
        assert_eq!(KvActionSync::handled_key("x1"), "action_v2:x1");
        assert_eq!(KvActionSync::lock_key("x1"), "lock:x1");
    }
}

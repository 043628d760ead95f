use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::domain::AgentInfo;
use crate::error::{AgentError, Result};

const AGENT_ID_KEY: &str = "AgentID_V2";

/// Sentinel a freshly provisioned secret backend hands out before anything
/// was written to it.
const UNINITIALIZED_SENTINEL: &str = "initialise me";

/// Key-value store for the agent identity, opaque byte values. Concrete
/// secret-manager backends plug in behind this seam.
pub trait KvStore: Send + Sync {
    /// Value for the key. `AgentError::NotFound` when the key is absent.
    fn get(&self, key: &str) -> Result<Vec<u8>>;
    fn set(&self, key: &str, data: &[u8]) -> Result<()>;
    fn del(&self, key: &str) -> Result<()>;
    /// Prepare the backend for use, self-healing an uninitialized one.
    fn init(&self) -> Result<()>;
}

/// File-backed store: one JSON object mapping keys to base64 values.
pub struct FileKvStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileKvStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn persist(&self, entries: &HashMap<String, String>) -> Result<()> {
        let data = serde_json::to_vec(entries)?;
        std::fs::write(&self.path, data)?;
        Ok(())
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let entries = self.entries.lock().expect("store lock poisoned");

        let value = entries
            .get(key)
            .ok_or_else(|| AgentError::NotFound(format!("key `{}` not in store", key)))?;

        BASE64
            .decode(value)
            .map_err(|e| AgentError::Internal(format!("corrupt store entry `{}`: {}", key, e)))
    }

    fn set(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        entries.insert(key.to_string(), BASE64.encode(data));
        self.persist(&entries)
    }

    fn del(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        entries.remove(key);
        self.persist(&entries)
    }

    fn init(&self) -> Result<()> {
        let mut entries = self.entries.lock().expect("store lock poisoned");

        match std::fs::read(&self.path) {
            Ok(raw) => {
                // a provisioned-but-empty backend is healed to an empty map
                if raw.is_empty() || raw == UNINITIALIZED_SENTINEL.as_bytes() {
                    *entries = HashMap::new();
                    return self.persist(&entries);
                }

                *entries = serde_json::from_slice(&raw)?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *entries = HashMap::new();
                self.persist(&entries)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Persists the registered agent identity: `AgentID_V2` points at the api
/// key id, which keys the serialized AgentInfo.
pub struct AgentStore {
    kv: Box<dyn KvStore>,
}

impl AgentStore {
    pub fn new(kv: Box<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn save_agent_info(&self, id: &str, agent: &AgentInfo) -> Result<()> {
        if id.is_empty() {
            return Err(AgentError::Validation("invalid agent id".to_string()));
        }

        let data = serde_json::to_vec(agent)?;

        self.kv
            .set(id, &data)
            .map_err(|e| AgentError::Internal(format!("failed to save agent info, err: {}", e)))?;

        self.kv
            .set(AGENT_ID_KEY, id.as_bytes())
            .map_err(|e| AgentError::Internal(format!("failed to set agent id, err: {}", e)))
    }

    /// The stored identity, or None when the agent was never registered.
    pub fn get_agent_info(&self) -> Result<Option<AgentInfo>> {
        let id = match self.kv.get(AGENT_ID_KEY) {
            Ok(id) => String::from_utf8_lossy(&id).to_string(),
            Err(AgentError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let data = self
            .kv
            .get(&id)
            .map_err(|e| AgentError::Internal(format!("failed to retrieve agent info, err: {}", e)))?;

        let info = serde_json::from_slice(&data)
            .map_err(|e| AgentError::Internal(format!("failed to parse agent info, err: {}", e)))?;

        Ok(Some(info))
    }
}

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::auth::HeaderProvider;
use crate::crypto;
use crate::domain::{url_action, STATUS_APPROVE, STATUS_PENDING, STATUS_REJECT};
use crate::error::{AgentError, Result};

#[derive(Debug, Serialize)]
struct SignRequest {
    status: i32,
    signatures: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GetActionResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: i32,
    #[serde(default)]
    messages: Vec<String>,
}

/// Produces the BLS signature over an action's payload and submits the
/// approve or reject decision to the authority.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Install the base64-encoded BLS private key.
    fn set_key(&self, bls_private_key: &str) -> Result<()>;
    /// Fetch the action, sign its first message and submit an approval.
    async fn action_approve(&self, action_id: &str) -> Result<()>;
    /// Fetch the action, sign its first message and submit a rejection.
    async fn action_reject(&self, action_id: &str) -> Result<()>;
    /// Sign the supplied payload directly and submit an approval. Used when
    /// the payload is already at hand from the feed.
    async fn approve_action_message(&self, action_id: &str, message: &[u8]) -> Result<()>;
}

pub struct ActionSigner {
    base_url: String,
    htc: reqwest::Client,
    auth_provider: Arc<dyn HeaderProvider>,
    bls_private_key: RwLock<Option<Vec<u8>>>,
}

impl ActionSigner {
    pub fn new(base_url: &str, auth_provider: Arc<dyn HeaderProvider>, bls_private_key: Option<&str>) -> Result<Self> {
        let signer = Self {
            base_url: base_url.to_string(),
            htc: reqwest::Client::new(),
            auth_provider,
            bls_private_key: RwLock::new(None),
        };

        if let Some(key) = bls_private_key {
            if !key.is_empty() {
                signer.set_key(key)?;
            }
        }

        Ok(signer)
    }

    /// Fetch the action and return the payload to sign. Refuses anything
    /// that is no longer pending.
    async fn get_action_message(&self, action_id: &str) -> Result<Vec<u8>> {
        let url = url_action(&self.base_url, action_id);

        let resp = self
            .htc
            .get(&url)
            .headers(self.auth_provider.auth_header())
            .send()
            .await?
            .error_for_status()
            .map_err(|e| AgentError::Upstream(format!("failed to get action `{}`: {}", action_id, e)))?
            .json::<GetActionResponse>()
            .await?;

        if resp.status != STATUS_PENDING {
            return Err(AgentError::Validation(
                "action can't be signed, status not pending".to_string(),
            ));
        }

        let first = resp
            .messages
            .first()
            .ok_or_else(|| AgentError::Internal(format!("action `{}` has no message", resp.id)))?;

        hex::decode(first).map_err(|e| {
            error!("failed to decode the action message, err: {}", e);
            AgentError::Internal("failed to decode the action message".to_string())
        })
    }

    async fn sign_action(&self, action_id: &str, message: &[u8], status: i32) -> Result<()> {
        let signature = {
            let key = self.bls_private_key.read().expect("key lock poisoned");
            let key = key
                .as_ref()
                .ok_or_else(|| AgentError::Internal("failed to generate signature, no bls key set".to_string()))?;

            hex::encode(crypto::bls_sign(message, key)?)
        };

        let body = SignRequest {
            status,
            signatures: vec![signature],
        };

        self.htc
            .post(url_action(&self.base_url, action_id))
            .headers(self.auth_provider.auth_header())
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| {
                error!("error while signing the action `{}`, err: {}", action_id, e);
                AgentError::Upstream(format!("failed to sign the action: {}", e))
            })?;

        Ok(())
    }
}

#[async_trait]
impl Signer for ActionSigner {
    fn set_key(&self, bls_private_key: &str) -> Result<()> {
        let data = BASE64.decode(bls_private_key).map_err(|e| {
            error!("failed to decode the agent bls private key, err: {}", e);
            AgentError::Validation("invalid bls key".to_string())
        })?;

        *self.bls_private_key.write().expect("key lock poisoned") = Some(data);
        Ok(())
    }

    async fn action_approve(&self, action_id: &str) -> Result<()> {
        let message = self.get_action_message(action_id).await?;
        self.sign_action(action_id, &message, STATUS_APPROVE).await
    }

    async fn action_reject(&self, action_id: &str) -> Result<()> {
        let message = self.get_action_message(action_id).await?;
        self.sign_action(action_id, &message, STATUS_REJECT).await
    }

    async fn approve_action_message(&self, action_id: &str, message: &[u8]) -> Result<()> {
        self.sign_action(action_id, message, STATUS_APPROVE).await
    }
}

use std::sync::Arc;

use tracing::{error, info};

use crate::coordination::ActionSync;
use crate::error::Result;
use crate::hub::cache::ActionCache;

use super::signer::Signer;

/// Approve or reject an action on an external request, with the same
/// coordination discipline as the auto-approver.
pub struct ActionService {
    synchronizer: Option<Arc<dyn ActionSync>>,
    load_balancing_enabled: bool,
    cache: Option<Arc<dyn ActionCache>>,
    signer: Arc<dyn Signer>,
}

impl ActionService {
    pub fn new(
        synchronizer: Option<Arc<dyn ActionSync>>,
        load_balancing_enabled: bool,
        cache: Option<Arc<dyn ActionCache>>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        Self {
            synchronizer,
            load_balancing_enabled,
            cache,
            signer,
        }
    }

    pub async fn approve(&self, action_id: &str) -> Result<()> {
        info!("Action Service: approving action `{}`", action_id);
        self.act(action_id, true).await
    }

    pub async fn reject(&self, action_id: &str) -> Result<()> {
        info!("Action Service: rejecting action `{}`", action_id);
        self.act(action_id, false).await
    }

    async fn act(&self, action_id: &str, approve: bool) -> Result<()> {
        if self.load_balancing_enabled {
            if let Some(sync) = self.synchronizer.as_ref() {
                if !sync.should_handle(action_id).await {
                    // another agent already took care of it
                    info!("Action Service: action `{}` was already handled!", action_id);
                    return Ok(());
                }

                if let Err(e) = sync.acquire_lock(action_id).await {
                    error!("Action Service: lock acquire err: {}, actionID `{}`", e, action_id);
                    return Err(e);
                }

                let outcome = self.sign_and_uncache(action_id, approve).await;

                if let Err(e) = sync.release(action_id).await {
                    error!("Action Service: lock release err: {}, actionID `{}`", e, action_id);
                }

                return outcome;
            }
        }

        self.sign_and_uncache(action_id, approve).await
    }

    async fn sign_and_uncache(&self, action_id: &str, approve: bool) -> Result<()> {
        if approve {
            self.signer.action_approve(action_id).await?;
        } else {
            self.signer.action_reject(action_id).await?;
        }

        if let Some(cache) = self.cache.as_ref() {
            cache.remove(action_id).await;
        }

        Ok(())
    }
}

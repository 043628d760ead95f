use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::AutoApprovalConfig;
use crate::coordination::ActionSync;
use crate::domain::ActionInfo;
use crate::hub::{new_hub_feed_client, ClientId, HubFeedClient};

use super::signer::Signer;

/// Internal feed subscriber that approves every live pending action it
/// receives, with bounded retry. When load balancing is enabled it runs the
/// coordinator protocol first so only one agent in the fleet signs.
pub struct AutoApprover {
    config: AutoApprovalConfig,
    load_balancing_enabled: bool,
    synchronizer: Option<Arc<dyn ActionSync>>,
    signer: Arc<dyn Signer>,

    client_id: ClientId,
    client: Mutex<Option<HubFeedClient>>,
    rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl AutoApprover {
    pub fn new(
        config: AutoApprovalConfig,
        load_balancing_enabled: bool,
        synchronizer: Option<Arc<dyn ActionSync>>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        let (client, rx) = new_hub_feed_client(true);

        Self {
            config,
            load_balancing_enabled,
            synchronizer,
            signer,
            client_id: client.id,
            client: Mutex::new(Some(client)),
            rx: Mutex::new(Some(rx)),
        }
    }

    /// The hub-side handle for registration. Yields once; afterwards the hub
    /// alone decides when the delivery channel closes.
    pub fn take_feed_client(&self) -> Option<HubFeedClient> {
        self.client.lock().expect("client lock poisoned").take()
    }

    /// Id to unregister from the hub with.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Consume frames until the hub closes the delivery channel. Each frame
    /// is handled concurrently.
    pub async fn listen(self: Arc<Self>) {
        debug!("AutoApprover: listening");

        let mut rx = match self.rx.lock().expect("receiver lock poisoned").take() {
            Some(rx) => rx,
            None => return,
        };

        while let Some(frame) = rx.recv().await {
            let approver = Arc::clone(&self);
            tokio::spawn(async move { approver.handle_message(frame).await });
        }

        info!("AutoApprover: stopped");
    }

    async fn handle_message(&self, frame: Vec<u8>) {
        let action: ActionInfo = match serde_json::from_slice(&frame) {
            Ok(action) => action,
            Err(e) => {
                error!(
                    "AutoApprover: fail to parse the message `{}`, err: {}",
                    String::from_utf8_lossy(&frame),
                    e
                );
                return;
            }
        };

        if action.is_expired() {
            info!("AutoApprover: action `{}` has expired", action.id);
            return;
        }

        if !action.is_pending() {
            info!("AutoApprover: action `{}` status not pending", action.id);
            return;
        }

        let Some(message) = action.messages.first() else {
            error!("AutoApprover: action `{}` has no message to sign", action.id);
            return;
        };

        if !self.should_handle_action(&action.id).await {
            return;
        }

        if self.load_balancing_enabled {
            let Some(sync) = self.synchronizer.as_ref() else {
                return;
            };

            if let Err(e) = sync.acquire_lock(&action.id).await {
                debug!("AutoApprover: lock err: {}, action `{}`", e, action.id);
                return;
            }

            self.approve_action(&action.id, message).await;

            if let Err(e) = sync.release(&action.id).await {
                debug!("AutoApprover: unlock err: {}, action `{}`", e, action.id);
            }
        } else {
            self.approve_action(&action.id, message).await;
        }
    }

    async fn should_handle_action(&self, action_id: &str) -> bool {
        if self.load_balancing_enabled {
            if let Some(sync) = self.synchronizer.as_ref() {
                // skip actions already picked up by another agent
                if !sync.should_handle(action_id).await {
                    debug!("AutoApprover: action `{}` was already approved!", action_id);
                    return false;
                }
            }
        }

        true
    }

    /// Approve with fixed-interval retry until `retryIntervalMaxSec` worth
    /// of wall-clock has elapsed.
    async fn approve_action(&self, action_id: &str, message: &[u8]) {
        let retry_interval = std::time::Duration::from_secs(self.config.retry_interval_sec);
        let retry_interval_max = std::time::Duration::from_secs(self.config.retry_interval_max_sec);
        let started = Instant::now();

        loop {
            match self.signer.approve_action_message(action_id, message).await {
                Ok(()) => {
                    info!("AutoApprover: action `{}` approved automatically", action_id);
                    return;
                }
                Err(e) => {
                    error!("AutoApprover: approval failed for action `{}`, err: {}", action_id, e);

                    if started.elapsed() >= retry_interval_max {
                        warn!("AutoApprover: auto action approve timed out for action `{}`", action_id);
                        return;
                    }

                    warn!("AutoApprover: auto approve action is repeated for action `{}`", action_id);
                    tokio::time::sleep(retry_interval).await;
                }
            }
        }
    }
}

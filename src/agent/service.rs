use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::action::{AutoApprover, Signer};
use crate::auth::HeaderProvider;
use crate::config::AppConfig;
use crate::crypto;
use crate::domain::{url_api_key, url_local_feed, AgentInfo};
use crate::error::{AgentError, Result};
use crate::hub::{FeedHub, WebsocketStatus};

use super::store::AgentStore;

#[derive(Debug, Serialize)]
struct SaveKeyDataRequest {
    #[serde(rename = "blsPublicKey")]
    bls_public_key: String,
    #[serde(rename = "ecPublicKey")]
    ec_public_key: String,
}

#[derive(Debug, Deserialize)]
struct PendingActionResponse {
    #[serde(rename = "actionID")]
    action_id: String,
}

#[derive(Debug, Deserialize)]
struct ApiKeyNameResponse {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentRegisterRequest {
    #[serde(rename = "apiKeyID")]
    pub api_key_id: String,
    pub secret: String,
    #[serde(rename = "workspaceID")]
    pub workspace_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentDetailsResponse {
    pub name: String,
    #[serde(rename = "agentID")]
    pub agent_id: String,
    #[serde(rename = "feedURL")]
    pub feed_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatusResponse {
    #[serde(flatten)]
    pub websocket: WebsocketStatus,
    #[serde(rename = "localFeedUrl")]
    pub local_feed_url: String,
}

/// Owns the agent lifecycle: one-shot registration with the authority, and
/// the start/stop wiring of the feed hub and auto-approver.
pub struct AgentService {
    config: AppConfig,
    htc: reqwest::Client,
    store: Arc<AgentStore>,
    auth_provider: Arc<dyn HeaderProvider>,
    signer: Arc<dyn Signer>,
    feed_hub: Arc<FeedHub>,
    auto_approver: Option<Arc<AutoApprover>>,
    agent_info: RwLock<Option<AgentInfo>>,
}

impl AgentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        store: Arc<AgentStore>,
        auth_provider: Arc<dyn HeaderProvider>,
        signer: Arc<dyn Signer>,
        feed_hub: Arc<FeedHub>,
        auto_approver: Option<Arc<AutoApprover>>,
        agent_info: Option<AgentInfo>,
    ) -> Self {
        Self {
            config,
            htc: reqwest::Client::new(),
            store,
            auth_provider,
            signer,
            feed_hub,
            auto_approver,
            agent_info: RwLock::new(agent_info),
        }
    }

    fn current_agent_info(&self) -> Option<AgentInfo> {
        self.agent_info.read().expect("agent info lock poisoned").clone()
    }

    pub fn is_registered(&self) -> bool {
        self.current_agent_info().is_some()
    }

    /// Register this agent with the authority: generate the keypairs, attach
    /// the public keys to the api key and approve that attachment with the
    /// newly installed signing key. Runs exactly once per install.
    pub async fn register(&self, req: &AgentRegisterRequest) -> Result<AgentDetailsResponse> {
        if self.is_registered() {
            return Err(AgentError::Validation("signing agent already registered".to_string()));
        }

        let keys = crypto::generate_keys().map_err(|e| {
            error!("Agent Service: error while generating keys, err: {}", e);
            AgentError::Internal("failed to generate keys".to_string())
        })?;

        self.auth_provider
            .initiate(&req.workspace_id, &req.secret, &req.api_key_id)
            .await
            .map_err(|e| {
                error!("Agent Service: failed to initiate the auth provider, err: {}", e);
                AgentError::Internal("failed to initiate the auth provider".to_string())
            })?;

        let action_id = self
            .update_api_key(&req.api_key_id, &req.workspace_id, &keys.bls_public, &keys.ec_public)
            .await
            .map_err(|e| {
                error!("Agent Service: failed to update api keys, err: {}", e);
                AgentError::Internal("failed to register agent".to_string())
            })?;

        self.signer.set_key(&keys.bls_private).map_err(|e| {
            error!("Agent Service: failed to set signer key, err: {}", e);
            AgentError::Internal("failed to setup signer".to_string())
        })?;

        // the agent signs off on its own key installation
        self.signer.action_approve(&action_id).await?;

        let info = AgentInfo {
            bls_private_key: keys.bls_private,
            ec_private_key: keys.ec_private,
            workspace_id: req.workspace_id.clone(),
            api_key_id: req.api_key_id.clone(),
            api_key_secret: req.secret.clone(),
        };

        self.store.save_agent_info(&req.api_key_id, &info).map_err(|e| {
            error!("Agent Service: failed to save agent info, err: {}", e);
            AgentError::Internal("failed to save agent info".to_string())
        })?;

        *self.agent_info.write().expect("agent info lock poisoned") = Some(info);

        let name = self.get_agent_name().await.map_err(|e| {
            error!("Agent Service: failed to get api key name, err: {}", e);
            AgentError::Internal("failed to get agent name".to_string())
        })?;

        Ok(AgentDetailsResponse {
            name,
            agent_id: req.api_key_id.clone(),
            feed_url: self.local_feed_url(),
        })
    }

    /// Run the feed hub and hook up the auto-approver. A no-op while the
    /// agent is unregistered.
    pub async fn start(&self) -> Result<()> {
        if !self.is_registered() {
            warn!("Agent Service: agent is not yet configured, auto-approval not started");
            return Ok(());
        }

        // the approver consumes its channel before registration, so the
        // cached replay cannot block the hub
        if let Some(approver) = self.auto_approver.as_ref() {
            tokio::spawn(Arc::clone(approver).listen());
        }

        if !self.feed_hub.run().await {
            error!("Agent Service: failed to start the feed hub");

            // closing the approver's channel stops its listen task
            if let Some(approver) = self.auto_approver.as_ref() {
                drop(approver.take_feed_client());
            }
            return Err(AgentError::Internal("failed to start the feed hub".to_string()));
        }

        if let Some(approver) = self.auto_approver.as_ref() {
            if let Some(client) = approver.take_feed_client() {
                self.feed_hub.register_client(client).await;
            }
        }

        Ok(())
    }

    /// Stop the hub and the token refresh on shutdown.
    pub async fn stop(&self) {
        info!("Agent Service: stopping");

        self.feed_hub.stop().await;
        self.auth_provider.stop();
    }

    pub async fn get_agent_details(&self) -> Result<AgentDetailsResponse> {
        let info = self
            .current_agent_info()
            .ok_or_else(|| AgentError::NotFound("agent not registered".to_string()))?;

        let name = self.get_agent_name().await.map_err(|e| {
            error!("Agent Service: failed to get api key name, err: {}", e);
            AgentError::Internal("failed to get agent name".to_string())
        })?;

        Ok(AgentDetailsResponse {
            name,
            agent_id: info.api_key_id,
            feed_url: self.local_feed_url(),
        })
    }

    pub async fn websocket_status(&self) -> HealthStatusResponse {
        HealthStatusResponse {
            websocket: self.feed_hub.websocket_status().await,
            local_feed_url: self.local_feed_url(),
        }
    }

    pub fn feed_hub(&self) -> Arc<FeedHub> {
        Arc::clone(&self.feed_hub)
    }

    async fn update_api_key(
        &self,
        api_key_id: &str,
        workspace_id: &str,
        bls_public: &str,
        ec_public: &str,
    ) -> Result<String> {
        let body = SaveKeyDataRequest {
            bls_public_key: bls_public.to_string(),
            ec_public_key: ec_public.to_string(),
        };

        let resp = self
            .htc
            .put(url_api_key(&self.config.base.qredo_api, workspace_id, api_key_id))
            .headers(self.auth_provider.auth_header())
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| AgentError::Upstream(format!("api key update failed: {}", e)))?
            .json::<PendingActionResponse>()
            .await?;

        Ok(resp.action_id)
    }

    async fn get_agent_name(&self) -> Result<String> {
        let info = self
            .current_agent_info()
            .ok_or_else(|| AgentError::NotFound("agent not registered".to_string()))?;

        let resp = self
            .htc
            .get(url_api_key(&self.config.base.qredo_api, &info.workspace_id, &info.api_key_id))
            .headers(self.auth_provider.auth_header())
            .send()
            .await?
            .error_for_status()
            .map_err(|e| AgentError::Upstream(format!("api key lookup failed: {}", e)))?
            .json::<ApiKeyNameResponse>()
            .await?;

        Ok(resp.name)
    }

    fn local_feed_url(&self) -> String {
        url_local_feed(&self.config.http.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionSigner, AutoApprover};
    use crate::agent::store::FileKvStore;
    use crate::agent::store::KvStore;
    use crate::auth::TokenProvider;
    use crate::domain::{STATUS_APPROVE, STATUS_PENDING};
    use crate::hub::testing::ChannelSource;
    use axum::extract::{Path as AxumPath, State};
    use axum::routing::{get, post, put};
    use axum::{Json, Router};
    use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
    use base64::Engine;
    use chrono::Utc;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct Authority {
        /// POST bodies seen, as (action_id, status)
        submitted: Arc<Mutex<Vec<(String, i32)>>>,
    }

    fn make_jwt(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{}}}"#, exp));
        format!("{}.{}.sig", header, payload)
    }

    async fn serve_authority(authority: Authority) -> String {
        async fn token(headers: axum::http::HeaderMap) -> Json<serde_json::Value> {
            assert!(headers.contains_key("qredo-api-key"));
            assert!(headers.contains_key("qredo-api-timestamp"));
            assert!(headers.contains_key("qredo-api-signature"));
            Json(serde_json::json!({ "token": make_jwt(Utc::now().timestamp() + 600) }))
        }

        async fn attach_keys(Json(body): Json<serde_json::Value>) -> Json<serde_json::Value> {
            assert!(body["blsPublicKey"].as_str().is_some_and(|k| !k.is_empty()));
            assert!(body["ecPublicKey"].as_str().is_some_and(|k| !k.is_empty()));
            Json(serde_json::json!({ "actionID": "reg-action" }))
        }

        async fn key_name() -> Json<serde_json::Value> {
            Json(serde_json::json!({ "name": "test agent" }))
        }

        async fn get_action(AxumPath(id): AxumPath<String>) -> Json<serde_json::Value> {
            Json(serde_json::json!({
                "id": id,
                "status": STATUS_PENDING,
                "messages": [hex::encode(b"attach these keys")],
            }))
        }

        async fn post_action(
            AxumPath(id): AxumPath<String>,
            State(authority): State<Authority>,
            Json(body): Json<serde_json::Value>,
        ) -> Json<serde_json::Value> {
            let status = body["status"].as_i64().unwrap_or(0) as i32;
            authority.submitted.lock().unwrap().push((id, status));
            Json(serde_json::json!({}))
        }

        let app = Router::new()
            .route("/workspaces/:wid/token", get(token))
            .route("/workspaces/:wid/apikeys/:kid", put(attach_keys))
            .route("/workspaces/:wid/apikeys/:kid", get(key_name))
            .route("/actions/:id", get(get_action))
            .route("/actions/:id", post(post_action))
            .with_state(authority);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{}", addr)
    }

    struct Fixture {
        service: AgentService,
        authority: Authority,
        feed_tx: tokio::sync::mpsc::Sender<Vec<u8>>,
        _dir: TempDir,
    }

    async fn fixture(hub_connectable: bool, auto_approval: bool) -> Fixture {
        let authority = Authority::default();
        let base_url = serve_authority(authority.clone()).await;

        let mut config = AppConfig::default();
        config.base.qredo_api = base_url.clone();
        config.auto_approval.enabled = auto_approval;
        config.auto_approval.retry_interval_sec = 1;
        config.auto_approval.retry_interval_max_sec = 2;

        let dir = TempDir::new().unwrap();
        let kv = FileKvStore::new(dir.path().join("store.db"));
        kv.init().unwrap();
        let store = Arc::new(AgentStore::new(Box::new(kv)));

        let auth: Arc<dyn HeaderProvider> = Arc::new(TokenProvider::new(&base_url));
        let signer: Arc<dyn Signer> =
            Arc::new(ActionSigner::new(&base_url, Arc::clone(&auth), None).unwrap());

        let (source, feed_tx) = ChannelSource::new(hub_connectable);
        let feed_hub = Arc::new(FeedHub::new(source, None));

        let auto_approver = auto_approval.then(|| {
            Arc::new(AutoApprover::new(
                config.auto_approval.clone(),
                false,
                None,
                Arc::clone(&signer),
            ))
        });

        let service = AgentService::new(config, store, auth, signer, feed_hub, auto_approver, None);

        Fixture {
            service,
            authority,
            feed_tx,
            _dir: dir,
        }
    }

    fn register_request() -> AgentRegisterRequest {
        AgentRegisterRequest {
            api_key_id: "key-1".to_string(),
            secret: URL_SAFE_NO_PAD.encode(b"api-key-secret"),
            workspace_id: "workspace-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_attaches_keys_and_self_approves() {
        let fixture = fixture(true, false).await;

        let resp = fixture.service.register(&register_request()).await.unwrap();
        assert_eq!(resp.name, "test agent");
        assert_eq!(resp.agent_id, "key-1");
        assert!(resp.feed_url.ends_with("/api/v2/client/feed"));

        // the key attachment action was approved with status 3
        let submitted = fixture.authority.submitted.lock().unwrap().clone();
        assert_eq!(submitted, vec![("reg-action".to_string(), STATUS_APPROVE)]);

        assert!(fixture.service.is_registered());
    }

    #[tokio::test]
    async fn test_register_twice_is_rejected() {
        let fixture = fixture(true, false).await;

        fixture.service.register(&register_request()).await.unwrap();
        let err = fixture.service.register(&register_request()).await.unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }

    #[tokio::test]
    async fn test_details_require_registration() {
        let fixture = fixture(true, false).await;

        let err = fixture.service.get_agent_details().await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_start_is_noop_when_unregistered() {
        let fixture = fixture(true, false).await;

        fixture.service.start().await.unwrap();
        assert!(!fixture.service.feed_hub().is_running());
    }

    #[tokio::test]
    async fn test_start_fails_when_hub_cannot_connect() {
        let fixture = fixture(false, true).await;

        fixture.service.register(&register_request()).await.unwrap();
        assert!(fixture.service.start().await.is_err());
    }

    #[tokio::test]
    async fn test_started_agent_auto_approves_feed_actions() {
        let fixture = fixture(true, true).await;

        fixture.service.register(&register_request()).await.unwrap();
        fixture.service.start().await.unwrap();
        assert!(fixture.service.feed_hub().is_running());

        let frame = format!(
            r#"{{"id":"feed-action","status":1,"messages":["{}"],"expireTime":{}}}"#,
            BASE64.encode(b"sign me"),
            Utc::now().timestamp() + 60
        );
        fixture.feed_tx.send(frame.into_bytes()).await.unwrap();

        // the approver runs concurrently, poll for the submission
        for _ in 0..100 {
            let submitted = fixture.authority.submitted.lock().unwrap().clone();
            if submitted.contains(&("feed-action".to_string(), STATUS_APPROVE)) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("feed action was never auto-approved");
    }
}

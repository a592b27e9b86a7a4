
use super::*;
use crate::Result;
use crate::cache::CredentialCache;
use crate::config::{CacheConfig, SessionConfig};
use crate::error::RefreshError;
use crate::model::{
    CacheEntry, InstanceCredentials, InstanceStatus, OAuthStatus, RefreshedToken, TokenData,
};
use crate::refresh::ServiceAdapter;
use crate::sessions::{HandlerSessionRegistry, null_factory};
use crate::storage::{CredentialStore, MemoryStore};
use axum::body::{Body, to_bytes};
use axum::http::Request;
use axum::routing::{get, post};
use axum::Router;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tower::ServiceExt;

#[derive(Clone, Copy)]
enum Script {
    Succeed,
    InvalidGrant,
    Transient,
}

struct ScriptedAdapter {
    store: Arc<MemoryStore>,
    scripts: Mutex<HashMap<Uuid, Script>>,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl ServiceAdapter for ScriptedAdapter {
    fn service_name(&self) -> &str {
        "*"
    }

    async fn lookup_credentials(
        &self,
        instance_id: Uuid,
        service_name: &str,
    ) -> Result<Option<InstanceCredentials>> {
        self.store
            .lookup_instance_credentials(instance_id, service_name)
            .await
    }

    async fn refresh(
        &self,
        creds: &InstanceCredentials,
        _refresh_token: &str,
    ) -> std::result::Result<RefreshedToken, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self
            .scripts
            .lock()
            .get(&creds.instance_id)
            .copied()
            .unwrap_or(Script::Succeed)
        {
            Script::Succeed => Ok(RefreshedToken {
                access_token: "fresh-token".to_string(),
                refresh_token: None,
                expires_in: 3600,
                scope: None,
            }),
            Script::InvalidGrant => {
                Err(RefreshError::InvalidGrant("refresh token revoked".to_string()))
            }
            Script::Transient => Err(RefreshError::ServiceUnavailable("502".to_string())),
        }
    }
}

struct Harness {
    cache: Arc<CredentialCache>,
    store: Arc<MemoryStore>,
    adapter: Arc<ScriptedAdapter>,
    app: Router,
}

async fn echo(auth: InstanceAuth) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "instanceId": auth.instance_id,
        "userId": auth.user_id,
        "token": auth.bearer_token,
    }))
}

fn harness() -> Harness {
    let cache = Arc::new(CredentialCache::new(CacheConfig::default()));
    let store = Arc::new(MemoryStore::new());
    let sessions = Arc::new(HandlerSessionRegistry::new(
        SessionConfig::default(),
        null_factory(),
    ));
    let adapter = Arc::new(ScriptedAdapter {
        store: store.clone(),
        scripts: Mutex::new(HashMap::new()),
        calls: AtomicUsize::new(0),
    });
    let coordinator = Arc::new(crate::refresh::RefreshCoordinator::new(
        cache.clone(),
        store.clone() as Arc<dyn CredentialStore>,
        sessions,
        adapter.clone(),
        60,
        600,
    ));
    let state = AuthState::new(coordinator);

    let app = Router::new()
        .route(
            "/mcp/{service}/{instance_id}",
            post(echo).route_layer(axum::middleware::from_fn_with_state(
                state.clone(),
                credential_auth,
            )),
        )
        .route(
            "/status/{service}/{instance_id}",
            get(echo).route_layer(axum::middleware::from_fn_with_state(
                state,
                lightweight_auth,
            )),
        );

    Harness {
        cache,
        store,
        adapter,
        app,
    }
}

impl Harness {
    async fn seed_store(&self, status: InstanceStatus, expires_in_secs: i64) -> Uuid {
        let now = Utc::now();
        let instance_id = Uuid::new_v4();
        let creds = InstanceCredentials {
            instance_id,
            user_id: "user-1".to_string(),
            team_id: None,
            service_name: "github".to_string(),
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            token_url: "https://example.com/token".to_string(),
            auth_url: None,
            access_token: Some("stored-token".to_string()),
            refresh_token: Some("refresh-1".to_string()),
            token_expires_at: Some(now + Duration::seconds(expires_in_secs)),
            status,
            oauth_status: OAuthStatus::Connected,
            last_error: None,
            service_active: true,
            created_at: now,
            updated_at: now,
        };
        self.store.save_instance(&creds).await.unwrap();
        instance_id
    }

    async fn seed_cached(&self, expires_in_secs: i64) -> Uuid {
        let id = self.seed_store(InstanceStatus::Active, expires_in_secs).await;
        let creds = self
            .store
            .lookup_instance_credentials(id, "github")
            .await
            .unwrap()
            .unwrap();
        self.cache.set(CacheEntry::from_credentials(
            &creds,
            TokenData {
                bearer_token: "cached-token".to_string(),
                refresh_token: Some("refresh-1".to_string()),
                expires_at: Utc::now() + Duration::seconds(expires_in_secs),
            },
        ));
        id
    }

    async fn post(&self, service: &str, instance_id: &str) -> (axum::http::StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method("POST")
            .uri(format!("/mcp/{}/{}", service, instance_id))
            .body(Body::empty())
            .unwrap();
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    async fn get_status(&self, instance_id: &str) -> (axum::http::StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method("GET")
            .uri(format!("/status/github/{}", instance_id))
            .body(Body::empty())
            .unwrap();
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }
}

#[tokio::test]
async fn test_malformed_instance_id_is_bad_request() {
    let h = harness();
    let (status, body) = h.post("github", "not-a-uuid").await;
    assert_eq!(status, axum::http::StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_instance_id");
}

#[tokio::test]
async fn test_unknown_instance_is_not_found() {
    let h = harness();
    let (status, body) = h.post("github", &Uuid::new_v4().to_string()).await;
    assert_eq!(status, axum::http::StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "instance_not_found");
}

#[tokio::test]
async fn test_inactive_instance_is_forbidden() {
    let h = harness();
    let id = h.seed_store(InstanceStatus::Inactive, 3600).await;
    let (status, body) = h.post("github", &id.to_string()).await;
    assert_eq!(status, axum::http::StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "not_authorized");
}

#[tokio::test]
async fn test_valid_cached_token_passes_through() {
    let h = harness();
    let id = h.seed_cached(3600).await;

    let (status, body) = h.post("github", &id.to_string()).await;
    assert_eq!(status, axum::http::StatusCode::OK);
    assert_eq!(body["token"], "cached-token");
    assert_eq!(body["userId"], "user-1");
    assert_eq!(h.adapter.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_expiring_token_is_refreshed_inline() {
    let h = harness();
    let id = h.seed_cached(10).await; // inside the 60s margin

    let (status, body) = h.post("github", &id.to_string()).await;
    assert_eq!(status, axum::http::StatusCode::OK);
    assert_eq!(body["token"], "fresh-token");
    assert_eq!(h.adapter.calls.load(Ordering::SeqCst), 1);

    // Request-path refreshes never consume the watcher's attempt budget
    assert_eq!(h.cache.peek(id).unwrap().refresh_attempts, 0);
}

#[tokio::test]
async fn test_cold_load_primes_cache() {
    let h = harness();
    let id = h.seed_store(InstanceStatus::Active, 3600).await;
    assert!(h.cache.peek(id).is_none());

    let (status, body) = h.post("github", &id.to_string()).await;
    assert_eq!(status, axum::http::StatusCode::OK);
    assert_eq!(body["token"], "stored-token");
    assert!(h.cache.peek(id).is_some());
}

#[tokio::test]
async fn test_terminal_refresh_failure_requires_reauthorization() {
    let h = harness();
    let id = h.seed_cached(10).await;
    h.adapter.scripts.lock().insert(id, Script::InvalidGrant);

    let (status, body) = h.post("github", &id.to_string()).await;
    assert_eq!(status, axum::http::StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "reauthorization_required");
    assert!(h.cache.peek(id).is_none(), "terminal failure evicts");
}

#[tokio::test]
async fn test_transient_refresh_failure_is_service_unavailable() {
    let h = harness();
    let id = h.seed_cached(10).await;
    h.adapter.scripts.lock().insert(id, Script::Transient);

    let (status, body) = h.post("github", &id.to_string()).await;
    assert_eq!(status, axum::http::StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "provider_unavailable");
    assert!(h.cache.peek(id).is_some(), "entry survives for retry");
}

#[tokio::test]
async fn test_lightweight_auth_never_refreshes() {
    let h = harness();
    let id = h.seed_store(InstanceStatus::Active, -10).await; // already expired

    let (status, body) = h.get_status(&id.to_string()).await;
    assert_eq!(status, axum::http::StatusCode::OK);
    assert_eq!(body["token"], "");
    assert_eq!(h.adapter.calls.load(Ordering::SeqCst), 0);
}

/// In-memory log sink so tests can assert on emitted audit lines
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[tokio::test]
async fn test_rejections_emit_audit_log() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let h = harness();
    let unknown = Uuid::new_v4();
    let (status, _) = h.post("github", &unknown.to_string()).await;
    assert_eq!(status, axum::http::StatusCode::NOT_FOUND);

    let (status, _) = h.post("github", "not-a-uuid").await;
    assert_eq!(status, axum::http::StatusCode::BAD_REQUEST);

    let inactive = h.seed_store(InstanceStatus::Inactive, 3600).await;
    let (status, _) = h.post("github", &inactive.to_string()).await;
    assert_eq!(status, axum::http::StatusCode::FORBIDDEN);

    // Every terminal failure leaves an audit line naming the instance
    // and the outcome, with no token material.
    let output = logs.contents();
    assert!(output.contains("request rejected"));
    assert!(output.contains(&unknown.to_string()));
    assert!(output.contains("instance_not_found"));
    assert!(output.contains("invalid_instance_id"));
    assert!(output.contains("not_authorized"));
    assert!(!output.contains("stored-token"));
}

#[tokio::test]
async fn test_lightweight_auth_rejects_inactive_and_missing() {
    let h = harness();
    let inactive = h.seed_store(InstanceStatus::Expired, 3600).await;

    let (status, _) = h.get_status(&inactive.to_string()).await;
    assert_eq!(status, axum::http::StatusCode::FORBIDDEN);

    let (status, _) = h.get_status(&Uuid::new_v4().to_string()).await;
    assert_eq!(status, axum::http::StatusCode::NOT_FOUND);

    let (status, _) = h.get_status("garbage").await;
    assert_eq!(status, axum::http::StatusCode::BAD_REQUEST);
}

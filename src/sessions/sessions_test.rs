
use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Test handler recording token pushes and dispatched requests
struct RecordingHandler {
    token: RwLock<String>,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl ProtocolHandler for RecordingHandler {
    fn set_bearer_token(&self, token: &str) {
        *self.token.write() = token.to_string();
    }

    async fn handle(&self, request: serde_json::Value) -> Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(request)
    }
}

fn recording_factory(built: Arc<AtomicUsize>) -> HandlerFactory {
    Arc::new(move |_config: &ServiceConfig, token: &str| {
        built.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(RecordingHandler {
            token: RwLock::new(token.to_string()),
            calls: AtomicUsize::new(0),
        }) as Arc<dyn ProtocolHandler>)
    })
}

fn test_config() -> SessionConfig {
    SessionConfig {
        sweep_interval_secs: 1,
        idle_timeout_secs: 1800,
    }
}

#[tokio::test]
async fn test_get_or_create_reuses_session() {
    let built = Arc::new(AtomicUsize::new(0));
    let registry = HandlerSessionRegistry::new(test_config(), recording_factory(built.clone()));
    let id = Uuid::new_v4();
    let config = ServiceConfig::new("github");

    let first = registry.get_or_create(id, &config, "token-1").unwrap();
    let second = registry.get_or_create(id, &config, "token-1").unwrap();

    assert_eq!(built.load(Ordering::SeqCst), 1, "second call must reuse");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.statistics().active_sessions, 1);
}

#[tokio::test]
async fn test_get_or_create_pushes_changed_token() {
    let built = Arc::new(AtomicUsize::new(0));
    let registry = HandlerSessionRegistry::new(test_config(), recording_factory(built));
    let id = Uuid::new_v4();
    let config = ServiceConfig::new("github");

    registry.get_or_create(id, &config, "token-1").unwrap();
    registry.get_or_create(id, &config, "token-2").unwrap();

    assert_eq!(registry.statistics().token_updates, 1);
}

#[tokio::test]
async fn test_update_bearer_token() {
    let built = Arc::new(AtomicUsize::new(0));
    let registry = HandlerSessionRegistry::new(test_config(), recording_factory(built));
    let id = Uuid::new_v4();

    assert!(!registry.update_bearer_token(id, "token-2"));

    registry
        .get_or_create(id, &ServiceConfig::new("github"), "token-1")
        .unwrap();
    assert!(registry.update_bearer_token(id, "token-2"));

    // A subsequent call with the new token detects no change
    registry
        .get_or_create(id, &ServiceConfig::new("github"), "token-2")
        .unwrap();
    assert_eq!(registry.statistics().token_updates, 1);
}

#[tokio::test]
async fn test_invalidate_and_remove() {
    let built = Arc::new(AtomicUsize::new(0));
    let registry = HandlerSessionRegistry::new(test_config(), recording_factory(built.clone()));
    let id = Uuid::new_v4();
    let config = ServiceConfig::new("github");

    registry.get_or_create(id, &config, "token-1").unwrap();
    registry.invalidate(id);
    assert_eq!(registry.statistics().active_sessions, 0);
    assert!(!registry.remove(id));

    // Next request constructs a fresh handler
    registry.get_or_create(id, &config, "token-1").unwrap();
    assert_eq!(built.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_idle_sweep() {
    let built = Arc::new(AtomicUsize::new(0));
    let config = SessionConfig {
        sweep_interval_secs: 1,
        idle_timeout_secs: 0, // everything is instantly idle
    };
    let registry = HandlerSessionRegistry::new(config, recording_factory(built));
    registry
        .get_or_create(Uuid::new_v4(), &ServiceConfig::new("github"), "t")
        .unwrap();
    registry
        .get_or_create(Uuid::new_v4(), &ServiceConfig::new("slack"), "t")
        .unwrap();

    assert_eq!(registry.sweep_idle(), 2);
    assert_eq!(registry.statistics().active_sessions, 0);
    // Sweeping an empty registry removes nothing
    assert_eq!(registry.sweep_idle(), 0);
}

#[tokio::test]
async fn test_cleanup_start_stop_idempotent() {
    let built = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(HandlerSessionRegistry::new(
        test_config(),
        recording_factory(built),
    ));

    registry.start_cleanup();
    assert!(registry.cleanup_running());
    registry.start_cleanup(); // no-op
    assert!(registry.cleanup_running());

    registry.stop_cleanup().await;
    assert!(!registry.cleanup_running());
    registry.stop_cleanup().await; // no-op
}

#[tokio::test]
async fn test_null_factory_errors() {
    let registry = HandlerSessionRegistry::new(test_config(), null_factory());
    let result = registry.get_or_create(Uuid::new_v4(), &ServiceConfig::new("github"), "t");
    assert!(result.is_err());
}

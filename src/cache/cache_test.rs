
use super::*;
use crate::model::InstanceStatus;

fn test_config() -> CacheConfig {
    CacheConfig {
        max_entries: 10,
        expiry_grace_secs: 300,
        max_refresh_attempts: 3,
        refresh_margin_secs: 60,
    }
}

fn test_entry(expires_in_secs: i64) -> CacheEntry {
    let now = Utc::now();
    CacheEntry {
        instance_id: Uuid::new_v4(),
        user_id: "user-1".to_string(),
        team_id: None,
        service_name: "github".to_string(),
        bearer_token: "bearer-1".to_string(),
        refresh_token: Some("refresh-1".to_string()),
        expires_at: now + Duration::seconds(expires_in_secs),
        status: InstanceStatus::Active,
        refresh_attempts: 0,
        cached_at: now,
        last_used: now,
        last_modified: now,
        last_refresh_attempt: None,
        last_successful_refresh: None,
    }
}

#[test]
fn test_get_touches_last_used_peek_does_not() {
    let cache = CredentialCache::new(test_config());
    let entry = test_entry(3600);
    let id = entry.instance_id;
    let original_last_used = entry.last_used;
    cache.set(entry);

    std::thread::sleep(std::time::Duration::from_millis(5));
    let peeked = cache.peek(id).unwrap();
    assert_eq!(peeked.last_used, original_last_used);

    let fetched = cache.get(id).unwrap();
    assert!(fetched.last_used > original_last_used);
}

#[test]
fn test_token_expiry_pairing() {
    let cache = CredentialCache::new(test_config());
    let entry = test_entry(60);
    let id = entry.instance_id;
    cache.set(entry);

    let new_expiry = Utc::now() + Duration::seconds(3600);
    assert!(cache.set_token(
        id,
        TokenData {
            bearer_token: "bearer-2".to_string(),
            refresh_token: None,
            expires_at: new_expiry,
        },
    ));

    // The new token is never observed with the old expiry
    let after = cache.get(id).unwrap();
    assert_eq!(after.bearer_token, "bearer-2");
    assert_eq!(after.expires_at, new_expiry);
    // Refresh token carried over when not rotated
    assert_eq!(after.refresh_token.as_deref(), Some("refresh-1"));
}

#[test]
fn test_update_metadata_absent_entry() {
    let cache = CredentialCache::new(test_config());
    assert!(!cache.update_metadata(Uuid::new_v4(), CacheMetadataUpdate::default()));
}

#[test]
fn test_increment_and_reset_attempts() {
    let cache = CredentialCache::new(test_config());
    let entry = test_entry(3600);
    let id = entry.instance_id;
    cache.set(entry);

    assert_eq!(cache.increment_refresh_attempts(id), 1);
    assert_eq!(cache.increment_refresh_attempts(id), 2);
    assert!(cache.peek(id).unwrap().last_refresh_attempt.is_some());

    // Reset is idempotent
    cache.reset_refresh_attempts(id);
    assert_eq!(cache.peek(id).unwrap().refresh_attempts, 0);
    cache.reset_refresh_attempts(id);
    assert_eq!(cache.peek(id).unwrap().refresh_attempts, 0);

    // Absent entry: no panic, returns 0
    assert_eq!(cache.increment_refresh_attempts(Uuid::new_v4()), 0);
}

#[test]
fn test_cleanup_invalid_reasons() {
    let cache = CredentialCache::new(test_config());

    // Healthy entry survives
    let healthy = test_entry(3600);
    let healthy_id = healthy.instance_id;
    cache.set(healthy);

    // Expired beyond the grace window
    let expired = test_entry(-400);
    cache.set(expired);

    // Inactive status
    let mut inactive = test_entry(3600);
    inactive.status = InstanceStatus::Inactive;
    cache.set(inactive);

    // Exhausted refresh budget
    let mut exhausted = test_entry(3600);
    exhausted.refresh_attempts = 3;
    cache.set(exhausted);

    // Expired but within grace: kept for the refresher to rescue
    let in_grace = test_entry(-60);
    let in_grace_id = in_grace.instance_id;
    cache.set(in_grace);

    assert_eq!(cache.cleanup_invalid("test"), 3);
    assert!(cache.peek(healthy_id).is_some());
    assert!(cache.peek(in_grace_id).is_some());

    // Cleanup on an already-clean cache removes nothing
    assert_eq!(cache.cleanup_invalid("test"), 0);
    assert_eq!(cache.len(), 2);
}

#[test]
fn test_eviction_is_final() {
    let cache = CredentialCache::new(test_config());
    let entry = test_entry(3600);
    let id = entry.instance_id;
    cache.set(entry);

    assert!(cache.remove(id).is_some());
    assert!(cache.get(id).is_none());
    assert!(cache.remove(id).is_none());
}

#[test]
fn test_lru_pruning_under_pressure() {
    let cache = CredentialCache::new(test_config());

    let mut ids = Vec::new();
    for i in 0..10 {
        let mut entry = test_entry(3600);
        // Stagger last_used so ordering is deterministic
        entry.last_used = Utc::now() - Duration::seconds(100 - i);
        ids.push(entry.instance_id);
        cache.set(entry);
    }
    assert_eq!(cache.len(), 10);

    // Admitting an 11th entry prunes the oldest ~10%
    let newcomer = test_entry(3600);
    let newcomer_id = newcomer.instance_id;
    cache.set(newcomer);

    assert_eq!(cache.len(), 10);
    assert!(cache.peek(ids[0]).is_none(), "oldest entry should be pruned");
    assert!(cache.peek(newcomer_id).is_some());

    // Replacing an existing key does not prune
    let mut replacement = test_entry(3600);
    replacement.instance_id = newcomer_id;
    cache.set(replacement);
    assert_eq!(cache.len(), 10);
}

#[test]
fn test_statistics() {
    let cache = CredentialCache::new(test_config());
    let entry = test_entry(3600);
    let id = entry.instance_id;
    cache.set(entry);

    let mut slack = test_entry(3600);
    slack.service_name = "slack".to_string();
    cache.set(slack);

    cache.get(id);
    cache.get(Uuid::new_v4());

    let stats = cache.statistics();
    assert_eq!(stats.size, 2);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    assert_eq!(stats.sets, 2);
    assert_eq!(stats.per_service.get("github"), Some(&1));
    assert_eq!(stats.per_service.get("slack"), Some(&1));
    assert!(stats.memory_estimate_bytes > 0);
}

#[test]
fn test_list_instance_ids() {
    let cache = CredentialCache::new(test_config());
    assert!(cache.is_empty());
    let a = test_entry(3600);
    let b = test_entry(3600);
    let (id_a, id_b) = (a.instance_id, b.instance_id);
    cache.set(a);
    cache.set(b);

    let mut ids = cache.list_instance_ids();
    ids.sort();
    let mut expected = vec![id_a, id_b];
    expected.sort();
    assert_eq!(ids, expected);
}

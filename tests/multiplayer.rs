//! End-to-end scenarios: two or more peers attached to one namespace over
//! the in-memory KV service.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use roomsync::{
    AuthMode, Conflict, ConflictStrategy, MemoryKvService, MemoryStateStore, MultiplayerOptions,
    MultiplayerStore, StatePatch, RESERVED_FIELD,
};

// ============================================================================
// Helpers
// ============================================================================

fn options(namespace: &str) -> MultiplayerOptions {
    MultiplayerOptions::new(
        namespace,
        "wss://kv.example.com",
        AuthMode::ApiKey("test-key".into()),
    )
}

fn peer(service: &MemoryKvService, namespace: &str) -> MultiplayerStore {
    peer_with(service, options(namespace))
}

fn peer_with(service: &MemoryKvService, opts: MultiplayerOptions) -> MultiplayerStore {
    MultiplayerStore::attach(
        Arc::new(MemoryStateStore::new()),
        Arc::new(service.client()),
        opts,
    )
    .expect("attach")
}

/// State with the reserved subtree stripped, for convergence comparisons.
fn visible_state(store: &MultiplayerStore) -> Value {
    let mut state = store.state();
    if let Some(map) = state.as_object_mut() {
        map.remove(RESERVED_FIELD);
    }
    state
}

fn field(store: &MultiplayerStore, name: &str) -> Value {
    store.state()[name].clone()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within timeout");
}

fn assert_converged(a: &MultiplayerStore, b: &MultiplayerStore) {
    assert_eq!(visible_state(a), visible_state(b));
}

// ============================================================================
// Scenario 1 — basic sync
// ============================================================================

#[tokio::test]
async fn basic_sync_between_two_peers() {
    let service = MemoryKvService::new();
    let a = peer(&service, "room");
    let b = peer(&service, "room");
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    a.set(json!({ "count": 1 })).await.unwrap();
    assert_eq!(field(&b, "count"), json!(1));

    a.set(json!({ "text": "hi" })).await.unwrap();
    assert_eq!(field(&b, "text"), json!("hi"));

    b.set(json!({ "nested": { "value": 42 } })).await.unwrap();
    assert_eq!(field(&a, "nested")["value"], json!(42));

    assert_converged(&a, &b);
}

#[tokio::test]
async fn late_joiner_hydrates_existing_state() {
    let service = MemoryKvService::new();
    let a = peer(&service, "room");
    a.connect().await.unwrap();
    a.set(json!({ "count": 1, "todos": { "t1": { "title": "one" } } }))
        .await
        .unwrap();

    let b = peer(&service, "room");
    b.connect().await.unwrap();
    assert!(b.has_hydrated());
    assert_converged(&a, &b);
}

// ============================================================================
// Scenario 2 — disconnect & replay, one test per strategy
// ============================================================================

/// Drive both peers into three-way divergence on `text`: start synced, B
/// drops, A moves the field remotely, B queues a different local value.
async fn diverge(
    service: &MemoryKvService,
    b_options: MultiplayerOptions,
) -> (MultiplayerStore, MultiplayerStore) {
    let a = peer(service, "room");
    let b = peer_with(service, b_options);
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    a.set(json!({ "text": "start" })).await.unwrap();
    assert_eq!(field(&b, "text"), json!("start"));

    b.disconnect().await.unwrap();
    a.set(json!({ "text": "remote" })).await.unwrap();
    b.set(json!({ "text": "local" })).await.unwrap();

    b.connect().await.unwrap();
    wait_until(|| b.has_hydrated() && b.pending_mutations() == 0).await;
    (a, b)
}

#[tokio::test]
async fn replay_with_keep_remote_converges_to_remote() {
    let service = MemoryKvService::new();
    let mut opts = options("room");
    opts.on_conflict = Some(Arc::new(|_: &[Conflict]| ConflictStrategy::KeepRemote));
    let (a, b) = diverge(&service, opts).await;

    assert_eq!(field(&b, "text"), json!("remote"));
    assert_eq!(field(&a, "text"), json!("remote"));
    assert_converged(&a, &b);
}

#[tokio::test]
async fn replay_with_keep_local_converges_to_local() {
    let service = MemoryKvService::new();
    let mut opts = options("room");
    opts.on_conflict = Some(Arc::new(|_: &[Conflict]| ConflictStrategy::KeepLocal));
    let (a, b) = diverge(&service, opts).await;

    wait_until(|| field(&a, "text") == json!("local")).await;
    assert_eq!(field(&b, "text"), json!("local"));
    assert_converged(&a, &b);
}

#[tokio::test]
async fn replay_with_merge_converges_to_merged_values() {
    let service = MemoryKvService::new();
    let observed = Arc::new(Mutex::new(Vec::<Conflict>::new()));
    let observed_clone = Arc::clone(&observed);
    let mut opts = options("room");
    opts.on_conflict = Some(Arc::new(move |conflicts: &[Conflict]| {
        observed_clone.lock().extend_from_slice(conflicts);
        let merged: Vec<String> = conflicts
            .iter()
            .map(|c| {
                format!(
                    "{} - {}",
                    c.remote_value.as_ref().and_then(Value::as_str).unwrap_or(""),
                    c.pending_value.as_ref().and_then(Value::as_str).unwrap_or(""),
                )
            })
            .collect();
        ConflictStrategy::Merge {
            merged_values: Some(json!({ "text": merged[0] })),
        }
    }));
    let (a, b) = diverge(&service, opts).await;

    wait_until(|| field(&a, "text") == json!("remote - local")).await;
    assert_eq!(field(&b, "text"), json!("remote - local"));
    assert_converged(&a, &b);

    let conflicts = observed.lock();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].field, "text");
    assert_eq!(conflicts[0].stale_value, Some(json!("start")));
    assert_eq!(conflicts[0].remote_value, Some(json!("remote")));
    assert_eq!(conflicts[0].pending_value, Some(json!("local")));
}

#[tokio::test]
async fn default_policy_keeps_remote() {
    let service = MemoryKvService::new();
    let (a, b) = diverge(&service, options("room")).await;
    assert_eq!(field(&b, "text"), json!("remote"));
    assert_converged(&a, &b);
}

// ============================================================================
// Scenario 3 — granular deletes
// ============================================================================

#[tokio::test]
async fn granular_delete_keeps_siblings_and_parent() {
    let service = MemoryKvService::new();
    let a = peer(&service, "room");
    let b = peer(&service, "room");
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    a.set(json!({ "todos": {
        "t1": { "title": "one" },
        "t2": { "title": "two" },
    }}))
    .await
    .unwrap();
    assert_eq!(field(&b, "todos")["t1"]["title"], json!("one"));
    assert_eq!(field(&b, "todos")["t2"]["title"], json!("two"));

    // Remove t1 by re-setting the todos field without it.
    a.set(json!({ "todos": { "t2": { "title": "two" } } }))
        .await
        .unwrap();

    let todos = field(&b, "todos");
    assert!(todos.get("t1").is_none());
    assert_eq!(todos["t2"]["title"], json!("two"));
    assert_converged(&a, &b);
}

#[tokio::test]
async fn deleting_the_last_entry_leaves_an_empty_parent() {
    let service = MemoryKvService::new();
    let a = peer(&service, "room");
    let b = peer(&service, "room");
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    a.set(json!({ "todos": { "t1": { "title": "one" } } }))
        .await
        .unwrap();
    a.set(json!({ "todos": {} })).await.unwrap();

    assert_eq!(field(&a, "todos"), json!({}));
    wait_until(|| field(&b, "todos") == json!({})).await;
    assert_converged(&a, &b);
}

// ============================================================================
// Scenario 4 — filtered fields are not synced
// ============================================================================

#[tokio::test]
async fn unpublished_fields_never_reach_other_peers() {
    let service = MemoryKvService::new();
    let mut opts = options("room");
    opts.publish_updates_for = Some(vec!["shared".into()]);
    let a = peer_with(&service, opts);
    let b = peer(&service, "room");
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    a.set(json!({ "shared": 1, "private": "secret" }))
        .await
        .unwrap();

    assert_eq!(field(&b, "shared"), json!(1));
    assert!(b.state().get("private").is_none());

    // A fresh peer hydrates without the private field too.
    let c = peer(&service, "room");
    c.connect().await.unwrap();
    assert!(c.state().get("private").is_none());
    assert_eq!(field(&c, "shared"), json!(1));
}

#[tokio::test]
async fn subscribe_filter_ignores_unlisted_fields() {
    let service = MemoryKvService::new();
    let a = peer(&service, "room");
    let mut opts = options("room");
    opts.subscribe_to_updates_for = Some(vec!["wanted".into()]);
    let b = peer_with(&service, opts);
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    a.set(json!({ "wanted": 1, "unwanted": 2 })).await.unwrap();

    assert_eq!(field(&b, "wanted"), json!(1));
    assert!(b.state().get("unwanted").is_none());
}

// ============================================================================
// Scenario 5 — echo suppression
// ============================================================================

#[tokio::test]
async fn peers_never_apply_their_own_writes() {
    let service = MemoryKvService::new();
    let a = peer(&service, "room");
    let b = peer(&service, "room");
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    a.set(json!({ "count": 1 })).await.unwrap();
    a.set(json!({ "count": 2 })).await.unwrap();

    // B applied both notifications; A applied none of its own.
    assert_eq!(a.metrics().notifications_applied, 0);
    assert_eq!(b.metrics().notifications_applied, 2);
    assert_eq!(field(&a, "count"), json!(2));
    assert_eq!(field(&b, "count"), json!(2));
}

// ============================================================================
// Scenario 6 — reconnect on write
// ============================================================================

#[tokio::test]
async fn write_while_disconnected_reconnects_and_replays() {
    let service = MemoryKvService::new();
    let a = peer(&service, "room");
    let b = peer(&service, "room");
    a.connect().await.unwrap();
    b.connect().await.unwrap();
    a.disconnect().await.unwrap();

    a.set(json!({ "count": 9 })).await.unwrap();

    wait_until(|| field(&b, "count") == json!(9)).await;
    assert!(a.has_hydrated());
    assert_eq!(a.pending_mutations(), 0);
    assert_converged(&a, &b);
}

// ============================================================================
// Queue ordering (P7)
// ============================================================================

#[tokio::test]
async fn queued_mutations_replay_in_order() {
    let service = MemoryKvService::new();
    let a = peer(&service, "room");
    let b = peer(&service, "room");
    a.connect().await.unwrap();
    b.connect().await.unwrap();
    a.disconnect().await.unwrap();

    for i in 1..=5 {
        a.set(json!({ "count": i, (format!("step{i}")): true }))
            .await
            .unwrap();
    }
    a.connect().await.unwrap();
    wait_until(|| a.pending_mutations() == 0 && field(&b, "count") == json!(5)).await;

    for i in 1..=5 {
        assert_eq!(field(&b, &format!("step{i}")), json!(true));
    }
    assert_converged(&a, &b);
}

// ============================================================================
// Convergence over mixed writers (P2)
// ============================================================================

#[tokio::test]
async fn peers_converge_after_interleaved_writes() {
    let service = MemoryKvService::new();
    let a = peer(&service, "room");
    let b = peer(&service, "room");
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    a.set(json!({ "scores": { "alice": 1 } })).await.unwrap();
    b.set(json!({ "scores": { "alice": 1, "bob": 2 } }))
        .await
        .unwrap();
    a.set(json!({ "round": 1 })).await.unwrap();
    b.set(StatePatch::Fn(Arc::new(|state: &Value| {
        json!({ "round": state["round"].as_i64().unwrap_or(0) + 1 })
    })))
    .await
    .unwrap();

    assert_eq!(field(&a, "round"), json!(2));
    assert_converged(&a, &b);
}

// ============================================================================
// Idempotent hydration (P6)
// ============================================================================

#[tokio::test]
async fn rehydrating_an_idle_namespace_is_stable() {
    let service = MemoryKvService::new();
    let a = peer(&service, "room");
    a.connect().await.unwrap();
    a.set(json!({ "count": 1 })).await.unwrap();

    // Two hydrations in a row with no intervening writes: the first rebuilds
    // (the namespace changed since connect), the second is memoised.
    let base = a.metrics().hydration_count;
    a.re_hydrate().await.unwrap();
    let before = a.state();
    a.re_hydrate().await.unwrap();

    assert_eq!(visible_state_value(&before), visible_state(&a));
    assert_eq!(a.metrics().hydration_count, base + 1);
}

fn visible_state_value(state: &Value) -> Value {
    let mut state = state.clone();
    if let Some(map) = state.as_object_mut() {
        map.remove(RESERVED_FIELD);
    }
    state
}

// ============================================================================
// z-factor partitioning (P9)
// ============================================================================

#[tokio::test]
async fn peers_with_different_z_factors_do_not_cross_talk() {
    let service = MemoryKvService::new();
    let a = peer(&service, "room");
    let mut opts = options("room");
    opts.z_factor = Some(3);
    let c = peer_with(&service, opts);
    a.connect().await.unwrap();
    c.connect().await.unwrap();

    a.set(json!({ "count": 1 })).await.unwrap();
    c.set(json!({ "count": 2 })).await.unwrap();

    assert_eq!(field(&a, "count"), json!(1));
    assert_eq!(field(&c, "count"), json!(2));

    // A fresh z=3 peer sees only the z=3 partition.
    let mut opts = options("room");
    opts.z_factor = Some(3);
    let d = peer_with(&service, opts);
    d.connect().await.unwrap();
    assert_eq!(field(&d, "count"), json!(2));
}

// ============================================================================
// Envelope tolerance
// ============================================================================

#[tokio::test]
async fn bare_values_written_by_legacy_clients_hydrate() {
    let service = MemoryKvService::new();
    // A legacy writer that bypasses the envelope.
    let raw = service.client();
    use roomsync::KvClient;
    raw.connect(&roomsync::storage::AuthToken {
        token: "t".into(),
    })
    .await
    .unwrap();
    raw.set("room-z2:legacy", &json!("plain")).await.unwrap();

    let a = peer(&service, "room");
    a.connect().await.unwrap();
    assert_eq!(field(&a, "legacy"), json!("plain"));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn destroy_stops_sync_and_rejects_operations() {
    let service = MemoryKvService::new();
    let a = peer(&service, "room");
    let b = peer(&service, "room");
    a.connect().await.unwrap();
    b.connect().await.unwrap();

    b.destroy().await;
    a.set(json!({ "count": 1 })).await.unwrap();

    assert!(b.state().get("count").is_none());
    assert!(b.set(json!({ "x": 1 })).await.is_err());
}

#[tokio::test]
async fn clear_storage_resets_the_namespace_for_new_peers() {
    let service = MemoryKvService::new();
    let a = peer(&service, "room");
    a.connect().await.unwrap();
    a.set(json!({ "count": 1 })).await.unwrap();
    a.clear_storage().await.unwrap();

    let b = peer(&service, "room");
    b.connect().await.unwrap();
    assert!(b.state().get("count").is_none());
}

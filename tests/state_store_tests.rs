//! Behavior of the in-memory conversation state store.

use std::sync::Arc;
use std::time::Duration;

use faceswap_bot::dialogue::{TaskKind, TaskState};
use faceswap_bot::state_store::{InMemoryStateStore, StateStore};

#[tokio::test]
async fn set_get_take_round_trip() {
    let store = InMemoryStateStore::new(Duration::from_secs(60));

    assert!(store.get(1).await.is_none());

    store.set(1, TaskState::new(TaskKind::PhotoSwap)).await;
    let state = store.get(1).await.expect("state present");
    assert_eq!(state.kind, TaskKind::PhotoSwap);

    let taken = store.take(1).await.expect("take returns state");
    assert_eq!(taken.kind, TaskKind::PhotoSwap);

    // Read-and-delete fires once; the loser of any race observes absence.
    assert!(store.take(1).await.is_none());
    assert!(store.get(1).await.is_none());
}

#[tokio::test]
async fn set_replaces_existing_state() {
    let store = InMemoryStateStore::new(Duration::from_secs(60));

    store.set(1, TaskState::new(TaskKind::PhotoSwap)).await;
    store.set(1, TaskState::new(TaskKind::VideoSwap)).await;

    let state = store.get(1).await.expect("state present");
    assert_eq!(state.kind, TaskKind::VideoSwap);
}

#[tokio::test]
async fn users_are_isolated() {
    let store = InMemoryStateStore::new(Duration::from_secs(60));

    store.set(1, TaskState::new(TaskKind::PhotoSwap)).await;
    store.set(2, TaskState::new(TaskKind::ImageEnhance)).await;

    assert_eq!(store.take(1).await.expect("user 1").kind, TaskKind::PhotoSwap);
    assert_eq!(
        store.get(2).await.expect("user 2 unaffected").kind,
        TaskKind::ImageEnhance
    );
}

#[tokio::test]
async fn entries_expire_after_ttl() {
    let store = InMemoryStateStore::new(Duration::from_millis(30));

    store.set(1, TaskState::new(TaskKind::PhotoSwap)).await;
    assert!(store.get(1).await.is_some());

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(store.get(1).await.is_none(), "expired entry is absent");
    assert!(store.take(1).await.is_none(), "take never returns expired state");
}

#[tokio::test]
async fn set_refreshes_the_ttl() {
    let store = InMemoryStateStore::new(Duration::from_millis(80));

    store.set(1, TaskState::new(TaskKind::PhotoSwap)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.set(1, TaskState::new(TaskKind::PhotoSwap)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(
        store.get(1).await.is_some(),
        "second set pushed expiry out past the original window"
    );
}

#[tokio::test]
async fn sweeper_drops_expired_entries() {
    let store = Arc::new(InMemoryStateStore::new(Duration::from_millis(20)));
    let sweeper = Arc::clone(&store).spawn_sweeper(Duration::from_millis(10));

    store.set(1, TaskState::new(TaskKind::PhotoSwap)).await;
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert!(store.get(1).await.is_none());
    sweeper.abort();
}

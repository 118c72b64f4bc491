// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeSet;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::Value;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::Instant;

use crate::test_utils::{
    MemoryDesignStore, MemorySecurityStore, TestAccess, setup_logging, test_access,
};
use crate::{
    AccessDesign, AccessError, AccessEvent, Config, DEFAULT_DESIGN_ID, Design, OperationError,
    SaveError, Security, SecurityLevel, Transform, UserContext,
};

fn level_names(design: &Design) -> Vec<&str> {
    design.levels.iter().map(|level| level.name.as_str()).collect()
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|item| item.to_string()).collect()
}

/// Persisted design document with the given levels.
fn document(levels: &[&str]) -> Value {
    let mut transform = Transform::default();
    transform.add_levels(levels, None).unwrap();
    transform.to_design()
}

async fn stored_design(store: &MemoryDesignStore) -> Design {
    let document = store
        .document(DEFAULT_DESIGN_ID)
        .await
        .expect("design document exists");
    Design::parse(&document)
}

/// Waits until a spawned save took the pending operations.
async fn flush_started(access: &TestAccess) {
    while !access.transform().unwrap().operations().is_empty() {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn changes_are_visible_before_saving() {
    setup_logging();
    let (access, store, _) = test_access(false);

    access
        .transform()
        .unwrap()
        .add_levels(["read", "write", "admin"], None)
        .unwrap()
        .set_name_level("alice", Some("write"))
        .unwrap();

    let alice = UserContext::from("alice");
    assert_eq!(access.get_level(&alice).unwrap(), Some("write".to_string()));
    assert!(access.has_level(&alice, "read").unwrap());
    assert!(!access.has_level(&alice, "admin").unwrap());
    assert!(store.document(DEFAULT_DESIGN_ID).await.is_none());
    assert!(!access.saving());
}

#[tokio::test]
async fn save_writes_design() {
    setup_logging();
    let (access, store, security) = test_access(false);

    access
        .transform()
        .unwrap()
        .add_levels(["read", "admin"], None)
        .unwrap()
        .set_role_level("staff", Some("read"))
        .unwrap()
        .set_filter("by_type", Some("function(doc) { return true; }"))
        .unwrap();

    access.save().await.unwrap();

    assert_eq!(store.writes().await, 1);
    assert!(access.transform().unwrap().operations().is_empty());

    let design = stored_design(&store).await;
    assert_eq!(level_names(&design), vec!["read", "admin"]);
    assert_eq!(design.levels[0].security.roles, set(&["staff"]));
    assert!(design.filters.contains_key("by_type"));
    assert_eq!(&design, access.transform().unwrap().design());

    // Local stores don't enforce access.
    assert_eq!(security.persisted().await, 0);
}

#[tokio::test]
async fn save_under_configured_id() {
    let store = MemoryDesignStore::new();
    let config = Config::default().with_design_id("_design/custom");
    let access = AccessDesign::new(store.clone(), MemorySecurityStore::new(), config);

    access.transform().unwrap().add_level("read", None).unwrap();
    access.save().await.unwrap();

    assert!(store.document("_design/custom").await.is_some());
    assert!(store.document(DEFAULT_DESIGN_ID).await.is_none());
}

#[tokio::test]
async fn nothing_to_save() {
    let (access, store, _) = test_access(false);

    access.save().await.unwrap();
    assert_eq!(store.writes().await, 0);
    assert!(store.document(DEFAULT_DESIGN_ID).await.is_none());
}

#[tokio::test]
async fn unchanged_design_is_not_written() {
    let store = MemoryDesignStore::new();
    store.insert(DEFAULT_DESIGN_ID, document(&["read"])).await;

    let access = AccessDesign::open(store.clone(), MemorySecurityStore::new(), Config::default())
        .await
        .unwrap();

    access
        .transform()
        .unwrap()
        .set_private()
        .unwrap()
        .set_public()
        .unwrap();
    access.save().await.unwrap();

    assert_eq!(store.writes().await, 0);
    assert!(access.transform().unwrap().operations().is_empty());
}

#[tokio::test]
async fn failed_save_keeps_operations_pending() {
    setup_logging();
    let (access, store, _) = test_access(false);

    access
        .transform()
        .unwrap()
        .add_level("read", None)
        .unwrap()
        .set_name_level("alice", Some("read"))
        .unwrap();

    store.fail_next_writes(1).await;
    assert_matches!(access.save().await, Err(SaveError::Store(_)));

    // Local state is as if the save never happened.
    assert_eq!(access.transform().unwrap().operations().len(), 2);
    assert_eq!(
        access.get_level(&"alice".into()).unwrap(),
        Some("read".to_string())
    );
    assert_eq!(store.writes().await, 0);
    assert!(!access.saving());

    // Retrying writes the same intent exactly once.
    access.save().await.unwrap();
    assert_eq!(store.writes().await, 1);
    assert!(access.transform().unwrap().operations().is_empty());

    let design = stored_design(&store).await;
    assert_eq!(level_names(&design), vec!["read"]);
    assert_eq!(design.levels[0].security.names, set(&["alice"]));
}

#[tokio::test]
async fn failed_save_retries_order_dependent_operations() {
    let store = MemoryDesignStore::new();
    store
        .insert(DEFAULT_DESIGN_ID, document(&["bottom", "top"]))
        .await;

    let access = AccessDesign::open(store.clone(), MemorySecurityStore::new(), Config::default())
        .await
        .unwrap();

    // Only applies in this order: "top" must exist to place "mid" in front of it.
    access
        .transform()
        .unwrap()
        .add_level("mid", Some("top"))
        .unwrap()
        .remove_level("top")
        .unwrap();
    assert_eq!(
        level_names(access.transform().unwrap().design()),
        vec!["bottom", "mid"]
    );

    store.fail_next_writes(1).await;
    assert_matches!(access.save().await, Err(SaveError::Store(_)));

    assert_eq!(access.transform().unwrap().operations().len(), 2);
    assert_eq!(
        level_names(access.transform().unwrap().design()),
        vec!["bottom", "mid"]
    );

    access.save().await.unwrap();
    assert_eq!(level_names(&stored_design(&store).await), vec!["bottom", "mid"]);
    assert_eq!(
        level_names(access.transform().unwrap().design()),
        vec!["bottom", "mid"]
    );
    assert!(access.transform().unwrap().operations().is_empty());
}

#[tokio::test]
async fn failed_save_requeues_in_front_of_new_operations() {
    let (access, store, _) = test_access(false);

    access.transform().unwrap().add_level("read", None).unwrap();

    store.hold_writes();
    let handle = access.save();
    flush_started(&access).await;

    access.transform().unwrap().add_level("write", None).unwrap();

    store.fail_next_writes(1).await;
    store.release_writes();
    assert_matches!(handle.await, Err(SaveError::Store(_)));

    {
        let transform = access.transform().unwrap();
        assert_eq!(transform.operations().len(), 2);
        assert_eq!(level_names(transform.design()), vec!["read", "write"]);
    }

    access.save().await.unwrap();
    assert_eq!(level_names(&stored_design(&store).await), vec!["read", "write"]);
}

#[tokio::test]
async fn concurrent_saves_share_one_flush() {
    setup_logging();
    let (access, store, _) = test_access(false);

    access.transform().unwrap().add_level("read", None).unwrap();

    store.hold_writes();
    let first = access.save();
    flush_started(&access).await;
    assert!(access.saving());

    // Arrives while the flush is running and waits for the next one.
    access.transform().unwrap().add_level("write", None).unwrap();
    let second = access.save();

    store.release_writes();
    first.await.unwrap();
    second.await.unwrap();

    assert!(!access.saving());
    assert_eq!(store.writes().await, 1);
    assert_eq!(level_names(&stored_design(&store).await), vec!["read"]);

    {
        let transform = access.transform().unwrap();
        assert_eq!(transform.operations().len(), 1);
        assert_eq!(level_names(transform.design()), vec!["read", "write"]);
    }

    access.save().await.unwrap();
    assert_eq!(store.writes().await, 2);
    assert_eq!(level_names(&stored_design(&store).await), vec!["read", "write"]);
}

#[tokio::test(start_paused = true)]
async fn timer_armed_while_saving_starts_next_save() {
    let (access, store, _) = test_access(false);

    access.transform().unwrap().add_level("read", None).unwrap();

    store.hold_writes();
    let first = access.save();
    flush_started(&access).await;

    access.transform().unwrap().add_level("write", None).unwrap();
    let delayed = access.delayed_save(Duration::from_millis(100));

    store.release_writes();
    first.await.unwrap();

    // The handle joined the running save, its timer is still armed.
    assert_matches!(delayed.outcome(), Some(Ok(())));
    assert_eq!(store.writes().await, 1);
    assert_eq!(access.transform().unwrap().operations().len(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(store.writes().await, 2);
    assert!(access.transform().unwrap().operations().is_empty());
    assert!(!access.saving());
    assert_eq!(level_names(&stored_design(&store).await), vec!["read", "write"]);
}

#[tokio::test]
async fn write_conflicts_are_retried_by_the_store() {
    let (access, store, _) = test_access(false);
    store.conflict_next_writes(2).await;

    access
        .transform()
        .unwrap()
        .add_levels(["read", "write"], None)
        .unwrap();
    access.save().await.unwrap();

    assert_eq!(store.writes().await, 1);
    assert_eq!(level_names(&stored_design(&store).await), vec!["read", "write"]);
}

#[tokio::test(start_paused = true)]
async fn delayed_saves_share_one_timer() {
    let (access, store, _) = test_access(false);
    let start = Instant::now();

    access.transform().unwrap().add_level("read", None).unwrap();
    let first = access.delayed_save(Duration::from_millis(100));

    tokio::time::sleep(Duration::from_millis(50)).await;
    access.transform().unwrap().add_level("write", None).unwrap();
    let second = access.delayed_save(Duration::from_millis(100));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.writes().await, 0);
    assert!(first.outcome().is_none());

    first.await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(start.elapsed() < Duration::from_millis(150));
    assert_matches!(second.outcome(), Some(Ok(())));

    assert_eq!(store.writes().await, 1);
    assert_eq!(level_names(&stored_design(&store).await), vec!["read", "write"]);
}

#[tokio::test(start_paused = true)]
async fn save_cancels_timer() {
    let (access, store, _) = test_access(false);
    let start = Instant::now();

    access.transform().unwrap().add_level("read", None).unwrap();
    let delayed = access.delayed_save(Duration::from_secs(10));
    let now = access.save();

    now.await.unwrap();
    assert_matches!(delayed.outcome(), Some(Ok(())));
    assert!(start.elapsed() < Duration::from_secs(10));

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(store.writes().await, 1);
    assert!(!access.saving());
}

#[tokio::test(start_paused = true)]
async fn scheduled_save_uses_configured_delay() {
    let store = MemoryDesignStore::new();
    let config = Config::default().with_save_delay(Duration::from_secs(2));
    let access = AccessDesign::new(store.clone(), MemorySecurityStore::new(), config);
    let start = Instant::now();

    access.transform().unwrap().add_level("read", None).unwrap();
    access.schedule_save().await.unwrap();

    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(store.writes().await, 1);
}

#[tokio::test]
async fn private_design_mirrors_members() {
    setup_logging();
    let (access, store, security) = test_access(true);
    assert!(access.is_remote());

    let mut admins = SecurityLevel::new();
    admins.names.insert("root".to_string());
    security
        .set_security(Security {
            admins,
            members: SecurityLevel::new(),
        })
        .await;

    access
        .transform()
        .unwrap()
        .add_levels(["read", "admin"], None)
        .unwrap()
        .set_name_level("alice", Some("admin"))
        .unwrap()
        .set_role_level("staff", Some("read"))
        .unwrap()
        .set_private()
        .unwrap();
    access.save().await.unwrap();

    let mirror = security.security().await;
    assert_eq!(mirror.members.names, set(&["alice"]));
    assert_eq!(mirror.members.roles, set(&["staff"]));
    assert_eq!(mirror.admins.names, set(&["root"]));
    assert_eq!(security.persisted().await, 1);
    assert!(stored_design(&store).await.private);

    // New members of a private design are let in.
    access
        .transform()
        .unwrap()
        .set_name_level("bob", Some("read"))
        .unwrap();
    access.save().await.unwrap();
    assert_eq!(security.security().await.members.names, set(&["alice", "bob"]));

    // Going public clears the mirror.
    access.transform().unwrap().set_public().unwrap();
    access.save().await.unwrap();

    let mirror = security.security().await;
    assert!(mirror.members.is_empty());
    assert_eq!(mirror.admins.names, set(&["root"]));
    assert!(!stored_design(&store).await.private);
    assert!(access.is_public().unwrap());
}

#[tokio::test]
async fn unchanged_mirror_is_not_written() {
    let (access, _, security) = test_access(true);

    access
        .transform()
        .unwrap()
        .add_level("read", None)
        .unwrap()
        .set_name_level("alice", Some("read"))
        .unwrap();
    access.save().await.unwrap();

    assert_eq!(security.persisted().await, 0);
}

#[tokio::test]
async fn failed_mirror_update_is_retried() {
    let (access, store, security) = test_access(true);
    security.fail_next_persists(1).await;

    access
        .transform()
        .unwrap()
        .add_level("read", None)
        .unwrap()
        .set_name_level("alice", Some("read"))
        .unwrap()
        .set_private()
        .unwrap();
    assert_matches!(access.save().await, Err(SaveError::Security(_)));

    // The design got written, the mirror did not.
    assert_eq!(store.writes().await, 1);
    assert_eq!(security.persisted().await, 0);
    assert_eq!(access.transform().unwrap().operations().len(), 3);

    access.save().await.unwrap();
    assert_eq!(store.writes().await, 1);
    assert_eq!(security.persisted().await, 1);
    assert_eq!(security.security().await.members.names, set(&["alice"]));
}

#[tokio::test]
async fn failed_mirror_read_aborts_save() {
    let (access, store, security) = test_access(true);
    security.fail_next_fetches(1).await;

    access.transform().unwrap().set_private().unwrap();
    assert_matches!(access.save().await, Err(SaveError::Security(_)));
    assert_eq!(store.writes().await, 0);
    assert_eq!(access.transform().unwrap().operations().len(), 1);
}

#[tokio::test]
async fn open_without_stored_design() {
    let (access, _, _) = test_access(false);
    access.fetch().await.unwrap();

    assert!(access.levels().unwrap().is_empty());
    assert!(access.is_public().unwrap());
    assert_eq!(access.to_design().unwrap(), Design::default().compile());
}

#[tokio::test]
async fn open_stored_design() {
    let store = MemoryDesignStore::new();
    store
        .insert(DEFAULT_DESIGN_ID, document(&["read", "write"]))
        .await;

    let access = AccessDesign::open(store, MemorySecurityStore::new(), Config::default())
        .await
        .unwrap();

    let summary = access.to_json().unwrap();
    assert!(!summary.private);
    assert_eq!(summary.levels.len(), 2);
    assert_eq!(summary.levels[1].name, "write");
}

#[tokio::test]
async fn failed_fetch_keeps_local_state() {
    let (access, store, _) = test_access(false);
    access.transform().unwrap().add_level("read", None).unwrap();

    store.fail_next_reads(1).await;
    assert_matches!(access.fetch().await, Err(AccessError::Fetch(_)));

    assert_eq!(access.transform().unwrap().operations().len(), 1);
    assert_eq!(access.levels().unwrap().len(), 1);
}

#[tokio::test]
async fn fetch_keeps_operations_which_do_not_apply() {
    let store = MemoryDesignStore::new();
    store.insert(DEFAULT_DESIGN_ID, document(&["read"])).await;

    let access = AccessDesign::open(store.clone(), MemorySecurityStore::new(), Config::default())
        .await
        .unwrap();
    access
        .transform()
        .unwrap()
        .set_name_level("alice", Some("read"))
        .unwrap();

    // Somebody else removed the level in the meantime.
    store.insert(DEFAULT_DESIGN_ID, document(&["write"])).await;

    assert_matches!(
        access.save().await,
        Err(SaveError::Replay(OperationError::MissingMemberLevel { .. }))
    );
    assert_eq!(access.transform().unwrap().operations().len(), 1);

    assert_matches!(
        access.fetch().await,
        Err(AccessError::Replay(OperationError::MissingMemberLevel { .. }))
    );
    assert_eq!(access.transform().unwrap().operations().len(), 1);
    assert_eq!(access.get_level(&"alice".into()).unwrap(), None);
    assert_eq!(level_names(access.transform().unwrap().design()), vec!["write"]);

    // Giving up on the change explicitly.
    assert_eq!(access.transform().unwrap().discard().len(), 1);
    access.fetch().await.unwrap();
    access.save().await.unwrap();
    assert_eq!(level_names(&stored_design(&store).await), vec!["write"]);
}

#[tokio::test]
async fn save_events() {
    let (access, store, _) = test_access(false);
    let mut events = access.subscribe();

    access.transform().unwrap().add_level("read", None).unwrap();
    access.save().await.unwrap();

    assert_matches!(events.try_recv(), Ok(AccessEvent::Applying(_)));
    assert_matches!(events.try_recv(), Ok(AccessEvent::Applied(_)));
    assert_matches!(events.try_recv(), Ok(AccessEvent::Saving));
    assert_matches!(events.try_recv(), Ok(AccessEvent::Saved));
    assert_matches!(events.try_recv(), Err(TryRecvError::Empty));

    access.transform().unwrap().add_level("write", None).unwrap();
    store.fail_next_writes(1).await;
    assert!(access.save().await.is_err());

    assert_matches!(events.try_recv(), Ok(AccessEvent::Applying(_)));
    assert_matches!(events.try_recv(), Ok(AccessEvent::Applied(_)));
    assert_matches!(events.try_recv(), Ok(AccessEvent::Saving));
    assert_matches!(events.try_recv(), Ok(AccessEvent::SaveFailed(_)));
}

#[tokio::test]
async fn clones_share_one_instance() {
    let (access, _, _) = test_access(false);
    let other = access.clone();

    other.transform().unwrap().add_level("read", None).unwrap();
    assert_eq!(access.levels().unwrap().len(), 1);

    other.save().await.unwrap();
    assert!(access.transform().unwrap().operations().is_empty());
}

#[tokio::test]
async fn fork_is_independent() {
    let (access, store, _) = test_access(false);

    access.transform().unwrap().add_level("read", None).unwrap();
    access.save().await.unwrap();
    access.transform().unwrap().add_level("write", None).unwrap();

    let fork = access.fork().unwrap();
    {
        let transform = fork.transform().unwrap();
        assert!(transform.operations().is_empty());
        assert_eq!(level_names(transform.design()), vec!["read", "write"]);
    }

    fork.transform().unwrap().add_level("admin", None).unwrap();
    assert_eq!(access.levels().unwrap().len(), 2);

    // Only the fork's own change is written on top of the stored design.
    fork.save().await.unwrap();
    assert_eq!(level_names(&stored_design(&store).await), vec!["read", "admin"]);

    access.save().await.unwrap();
    assert_eq!(
        level_names(&stored_design(&store).await),
        vec!["read", "admin", "write"]
    );
}

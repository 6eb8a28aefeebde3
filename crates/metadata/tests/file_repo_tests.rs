//! Reference counting, quota ledger and reclaim tests against both backends.

mod common;

use common::fixtures::{FailingHook, RecordingHook, new_file, physical, random_digest, user};
use common::run_metadata_test_both;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use vault_core::ReclaimCredit;
use vault_metadata::MetadataError;
use vault_metadata::repos::{FileRepo, LinkOutcome, PhysicalInsert, UserRepo};

#[tokio::test]
async fn test_shared_content_lifecycle() {
    run_metadata_test_both(|store| async move {
        let alice = user("alice", 1_000);
        let bob = user("bob", 1_000);
        store.create_user(&alice).await.unwrap();
        store.create_user(&bob).await.unwrap();

        let digest = random_digest();
        let phys = physical(&digest, 100);
        let hook = RecordingHook::default();

        let PhysicalInsert::Created(alice_file) = store
            .insert_new_content(&phys, &new_file(alice.id, "a.bin"), &hook)
            .await
            .unwrap()
        else {
            panic!("first insert should create");
        };
        assert_eq!(hook.keys(), vec![phys.storage_key.clone()]);

        let LinkOutcome::Linked(bob_file) = store
            .link_existing_content(phys.id, &new_file(bob.id, "b.bin"), &hook)
            .await
            .unwrap()
        else {
            panic!("link should succeed");
        };
        // Linking live content does not touch the blob.
        assert_eq!(hook.keys().len(), 1);

        let row = store.get_physical_file(phys.id).await.unwrap().unwrap();
        assert_eq!(row.reference_count, 2);

        // Deleting one of two references keeps the content.
        let unlinked = store
            .unlink_user_file(alice_file.id, alice.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unlinked.reference_count, 1);
        let reclaimed = store
            .reclaim_physical_file(phys.id, ReclaimCredit::Reclaimer, &hook)
            .await
            .unwrap();
        assert!(reclaimed.is_none());
        assert!(store.get_physical_file(phys.id).await.unwrap().is_some());

        // Alice stays charged while bob still references the content.
        let a = store.get_user(alice.id).await.unwrap().unwrap();
        assert_eq!(a.storage_used_bytes, 100);

        let unlinked = store
            .unlink_user_file(bob_file.id, bob.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unlinked.reference_count, 0);

        let release = RecordingHook::default();
        let reclaimed = store
            .reclaim_physical_file(phys.id, ReclaimCredit::Originator, &release)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.credited_owner, Some(alice.id));
        assert_eq!(release.keys(), vec![phys.storage_key.clone()]);
        assert!(store.find_physical_file(&digest).await.unwrap().is_none());

        let a = store.get_user(alice.id).await.unwrap().unwrap();
        assert_eq!(a.storage_used_bytes, 0);
    })
    .await;
}

#[tokio::test]
async fn test_reclaim_credits_last_unlinker() {
    run_metadata_test_both(|store| async move {
        let alice = user("alice", 1_000);
        let bob = user("bob", 1_000);
        store.create_user(&alice).await.unwrap();
        store.create_user(&bob).await.unwrap();

        let phys = physical(&random_digest(), 40);
        let hook = RecordingHook::default();
        let PhysicalInsert::Created(first) = store
            .insert_new_content(&phys, &new_file(alice.id, "a"), &hook)
            .await
            .unwrap()
        else {
            panic!("insert should create");
        };
        let LinkOutcome::Linked(second) = store
            .link_existing_content(phys.id, &new_file(bob.id, "b"), &hook)
            .await
            .unwrap()
        else {
            panic!("link should succeed");
        };

        store.unlink_user_file(first.id, alice.id).await.unwrap();
        store.unlink_user_file(second.id, bob.id).await.unwrap();

        let reclaimed = store
            .reclaim_physical_file(phys.id, ReclaimCredit::Reclaimer, &hook)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.credited_owner, Some(bob.id));
        assert_eq!(reclaimed.physical.last_unlinked_by, Some(bob.id));

        // Bob had no usage; the credit floors at zero.
        let b = store.get_user(bob.id).await.unwrap().unwrap();
        assert_eq!(b.storage_used_bytes, 0);
        let a = store.get_user(alice.id).await.unwrap().unwrap();
        assert_eq!(a.storage_used_bytes, 40);
    })
    .await;
}

#[tokio::test]
async fn test_failed_release_keeps_row() {
    run_metadata_test_both(|store| async move {
        let alice = user("alice", 1_000);
        store.create_user(&alice).await.unwrap();

        let phys = physical(&random_digest(), 7);
        let ok = RecordingHook::default();
        let PhysicalInsert::Created(file) = store
            .insert_new_content(&phys, &new_file(alice.id, "a"), &ok)
            .await
            .unwrap()
        else {
            panic!("insert should create");
        };
        store.unlink_user_file(file.id, alice.id).await.unwrap();

        let failing = FailingHook::default();
        let err = store
            .reclaim_physical_file(phys.id, ReclaimCredit::Reclaimer, &failing)
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Hook(_)));
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);

        // Row and usage survive for the next reclaim attempt.
        let row = store.get_physical_file(phys.id).await.unwrap().unwrap();
        assert_eq!(row.reference_count, 0);
        let pending = store.list_unreferenced_physical_files(None, 10).await.unwrap();
        assert!(pending.iter().any(|p| p.id == phys.id));
        let a = store.get_user(alice.id).await.unwrap().unwrap();
        assert_eq!(a.storage_used_bytes, 7);

        store
            .reclaim_physical_file(phys.id, ReclaimCredit::Reclaimer, &ok)
            .await
            .unwrap()
            .unwrap();
        let a = store.get_user(alice.id).await.unwrap().unwrap();
        assert_eq!(a.storage_used_bytes, 0);
    })
    .await;
}

#[tokio::test]
async fn test_link_revives_zero_reference_content() {
    run_metadata_test_both(|store| async move {
        let alice = user("alice", 1_000);
        store.create_user(&alice).await.unwrap();

        let phys = physical(&random_digest(), 3);
        let hook = RecordingHook::default();
        let PhysicalInsert::Created(file) = store
            .insert_new_content(&phys, &new_file(alice.id, "a"), &hook)
            .await
            .unwrap()
        else {
            panic!("insert should create");
        };
        store.unlink_user_file(file.id, alice.id).await.unwrap();

        let revive = RecordingHook::default();
        let outcome = store
            .link_existing_content(phys.id, &new_file(alice.id, "again"), &revive)
            .await
            .unwrap();
        assert!(matches!(outcome, LinkOutcome::Linked(_)));
        assert_eq!(revive.keys(), vec![phys.storage_key.clone()]);

        // Revived content is no longer reclaimable.
        let reclaimed = store
            .reclaim_physical_file(phys.id, ReclaimCredit::Reclaimer, &hook)
            .await
            .unwrap();
        assert!(reclaimed.is_none());
    })
    .await;
}

#[tokio::test]
async fn test_failed_revive_rolls_back_link() {
    run_metadata_test_both(|store| async move {
        let alice = user("alice", 1_000);
        store.create_user(&alice).await.unwrap();

        let phys = physical(&random_digest(), 3);
        let hook = RecordingHook::default();
        let PhysicalInsert::Created(file) = store
            .insert_new_content(&phys, &new_file(alice.id, "a"), &hook)
            .await
            .unwrap()
        else {
            panic!("insert should create");
        };
        store.unlink_user_file(file.id, alice.id).await.unwrap();

        let err = store
            .link_existing_content(phys.id, &new_file(alice.id, "b"), &FailingHook::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Hook(_)));

        let row = store.get_physical_file(phys.id).await.unwrap().unwrap();
        assert_eq!(row.reference_count, 0);
        assert!(store.list_user_files(alice.id).await.unwrap().is_empty());
    })
    .await;
}

#[tokio::test]
async fn test_link_after_reclaim_vanishes() {
    run_metadata_test_both(|store| async move {
        let alice = user("alice", 1_000);
        store.create_user(&alice).await.unwrap();

        let phys = physical(&random_digest(), 3);
        let hook = RecordingHook::default();
        let PhysicalInsert::Created(file) = store
            .insert_new_content(&phys, &new_file(alice.id, "a"), &hook)
            .await
            .unwrap()
        else {
            panic!("insert should create");
        };
        store.unlink_user_file(file.id, alice.id).await.unwrap();
        store
            .reclaim_physical_file(phys.id, ReclaimCredit::Reclaimer, &hook)
            .await
            .unwrap()
            .unwrap();

        let outcome = store
            .link_existing_content(phys.id, &new_file(alice.id, "b"), &hook)
            .await
            .unwrap();
        assert!(matches!(outcome, LinkOutcome::Vanished));
    })
    .await;
}

#[tokio::test]
async fn test_failed_ensure_rolls_back_insert() {
    run_metadata_test_both(|store| async move {
        let alice = user("alice", 1_000);
        store.create_user(&alice).await.unwrap();

        let phys = physical(&random_digest(), 11);
        let err = store
            .insert_new_content(&phys, &new_file(alice.id, "a"), &FailingHook::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Hook(_)));

        assert!(store.find_physical_file(&phys.digest).await.unwrap().is_none());
        let a = store.get_user(alice.id).await.unwrap().unwrap();
        assert_eq!(a.storage_used_bytes, 0);
    })
    .await;
}

#[tokio::test]
async fn test_quota_is_enforced_inside_transaction() {
    run_metadata_test_both(|store| async move {
        let alice = user("alice", 150);
        store.create_user(&alice).await.unwrap();
        let hook = RecordingHook::default();

        let first = store
            .insert_new_content(&physical(&random_digest(), 100), &new_file(alice.id, "a"), &hook)
            .await
            .unwrap();
        assert!(matches!(first, PhysicalInsert::Created(_)));

        let second_phys = physical(&random_digest(), 100);
        let second = store
            .insert_new_content(&second_phys, &new_file(alice.id, "b"), &hook)
            .await
            .unwrap();
        assert!(matches!(second, PhysicalInsert::QuotaExceeded));
        assert!(
            store
                .find_physical_file(&second_phys.digest)
                .await
                .unwrap()
                .is_none()
        );

        // Exactly filling the quota is allowed.
        let third = store
            .insert_new_content(&physical(&random_digest(), 50), &new_file(alice.id, "c"), &hook)
            .await
            .unwrap();
        assert!(matches!(third, PhysicalInsert::Created(_)));
        let a = store.get_user(alice.id).await.unwrap().unwrap();
        assert_eq!(a.storage_used_bytes, 150);
        assert_eq!(a.remaining_bytes(), 0);
    })
    .await;
}

#[tokio::test]
async fn test_concurrent_first_uploads_create_one_row() {
    run_metadata_test_both(|store| async move {
        const UPLOADERS: usize = 8;
        let digest = random_digest();
        let size = 64;

        let mut owners = Vec::new();
        for i in 0..UPLOADERS {
            let u = user(&format!("u{i}"), 1_000);
            store.create_user(&u).await.unwrap();
            owners.push(u.id);
        }

        let mut handles = Vec::new();
        for owner in owners.clone() {
            let store = Arc::clone(&store);
            let digest = digest.clone();
            handles.push(tokio::spawn(async move {
                let hook = RecordingHook::default();
                loop {
                    if let Some(existing) = store.find_physical_file(&digest).await.unwrap() {
                        match store
                            .link_existing_content(existing.id, &new_file(owner, "f"), &hook)
                            .await
                            .unwrap()
                        {
                            LinkOutcome::Linked(_) => return false,
                            LinkOutcome::Vanished => continue,
                        }
                    }
                    match store
                        .insert_new_content(&physical(&digest, size), &new_file(owner, "f"), &hook)
                        .await
                        .unwrap()
                    {
                        PhysicalInsert::Created(_) => return true,
                        PhysicalInsert::DigestTaken => continue,
                        PhysicalInsert::QuotaExceeded => panic!("quota is ample"),
                    }
                }
            }));
        }

        let mut creators = 0;
        for handle in handles {
            if handle.await.unwrap() {
                creators += 1;
            }
        }
        assert_eq!(creators, 1);

        let row = store.find_physical_file(&digest).await.unwrap().unwrap();
        assert_eq!(row.reference_count, UPLOADERS as i64);

        let origin = row.origin_owner_id.expect("creator recorded");
        let mut charged = 0;
        for owner in owners {
            let u = store.get_user(owner).await.unwrap().unwrap();
            let expected = if owner == origin { size } else { 0 };
            assert_eq!(u.storage_used_bytes, expected);
            charged += u.storage_used_bytes;
            assert_eq!(store.list_user_files(owner).await.unwrap().len(), 1);
        }
        assert_eq!(charged, size);
    })
    .await;
}

#[tokio::test]
async fn test_orphan_release_skips_recorded_digests() {
    run_metadata_test_both(|store| async move {
        let alice = user("alice", 1_000);
        store.create_user(&alice).await.unwrap();

        let phys = physical(&random_digest(), 10);
        let hook = RecordingHook::default();
        store
            .insert_new_content(&phys, &new_file(alice.id, "a"), &hook)
            .await
            .unwrap();

        let release = RecordingHook::default();
        let released = store
            .release_orphan_blob(&phys.digest, &phys.storage_key, &release)
            .await
            .unwrap();
        assert!(!released);
        assert!(release.keys().is_empty());
        assert!(store.get_physical_file(phys.id).await.unwrap().is_some());
    })
    .await;
}

#[tokio::test]
async fn test_orphan_release_leaves_no_claim_behind() {
    run_metadata_test_both(|store| async move {
        let orphan = physical(&random_digest(), 0);

        let release = RecordingHook::default();
        let released = store
            .release_orphan_blob(&orphan.digest, &orphan.storage_key, &release)
            .await
            .unwrap();
        assert!(released);
        assert_eq!(release.keys(), vec![orphan.storage_key.clone()]);
        assert!(store.find_physical_file(&orphan.digest).await.unwrap().is_none());

        // A failed delete rolls the claim back as well.
        let failing = FailingHook::default();
        let err = store
            .release_orphan_blob(&orphan.digest, &orphan.storage_key, &failing)
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Hook(_)));
        assert!(store.find_physical_file(&orphan.digest).await.unwrap().is_none());
        assert!(
            store
                .list_unreferenced_physical_files(None, 10)
                .await
                .unwrap()
                .is_empty()
        );

        // The digest is free for a real upload afterwards.
        let alice = user("alice", 1_000);
        store.create_user(&alice).await.unwrap();
        let phys = physical(&orphan.digest, 10);
        let inserted = store
            .insert_new_content(&phys, &new_file(alice.id, "a"), &release)
            .await
            .unwrap();
        assert!(matches!(inserted, PhysicalInsert::Created(_)));
    })
    .await;
}

#[tokio::test]
async fn test_unreferenced_listing_pages_with_cursor() {
    run_metadata_test_both(|store| async move {
        let alice = user("alice", 1_000);
        store.create_user(&alice).await.unwrap();

        let hook = RecordingHook::default();
        let mut expected = Vec::new();
        for name in ["a", "b", "c"] {
            let phys = physical(&random_digest(), 1);
            let PhysicalInsert::Created(file) = store
                .insert_new_content(&phys, &new_file(alice.id, name), &hook)
                .await
                .unwrap()
            else {
                panic!("insert should create");
            };
            store.unlink_user_file(file.id, alice.id).await.unwrap();
            expected.push(phys.id);
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = store
                .list_unreferenced_physical_files(cursor.as_ref(), 1)
                .await
                .unwrap();
            let Some(last) = page.last().cloned() else {
                break;
            };
            assert_eq!(page.len(), 1);
            seen.push(last.id);
            cursor = Some(last);
        }

        seen.sort();
        expected.sort();
        assert_eq!(seen, expected);
    })
    .await;
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Startup reconciliation tests: source selection, restore, deadlines and
//! corruption handling.

mod common;

use std::sync::Arc;
use std::time::Duration;

use algoforge_core::destination::{BackupDestination, DestinationKind};
use algoforge_core::error::StoreError;
use algoforge_core::reconcile::{ReconcileOutcome, fetch_latest};
use algoforge_core::models::UpdatedBy;

use common::{
    FailingDestination, HangingDestination, InMemoryDestination, SnapshotBuilder, TestStore, at,
    publish_latest, row,
};
use serde_json::json;

const DEADLINE: Duration = Duration::from_secs(30);

#[tokio::test]
async fn test_newest_of_three_sources_wins() {
    let store = TestStore::new().await;
    store.seed_algorithms(10).await;
    store.ledger.record_restored(3, 10, Some(at(3))).await.unwrap();

    let remote = InMemoryDestination::remote();
    let local = InMemoryDestination::local();
    publish_latest(remote.as_ref(), &SnapshotBuilder::new(7).algorithms(15, "remote").build()).await;
    publish_latest(local.as_ref(), &SnapshotBuilder::new(5).algorithms(12, "local").build()).await;

    let outcome = store
        .reconciler(Some(remote.clone()), local.clone(), DEADLINE)
        .reconcile()
        .await
        .unwrap();

    let ReconcileOutcome::Restored(summary) = outcome else {
        panic!("expected a restore, got {outcome:?}");
    };
    assert_eq!(summary.source, DestinationKind::RemotePrimary);
    assert_eq!(summary.version, 7);
    assert!(summary.is_consistent());
    assert_eq!(summary.failed_rows(), 0);

    let state = store.ledger.current().await.unwrap();
    assert_eq!((state.version, state.record_count), (7, 15));
    assert_eq!(store.count("versions").await, 15);
    assert_eq!(store.count("jobs").await, 15);

    let entry = store.ledger.latest_entry().await.unwrap().unwrap();
    assert_eq!(entry.updated_by, UpdatedBy::Restore.as_str());
}

#[tokio::test]
async fn test_first_run_without_backups_starts_empty() {
    let store = TestStore::new().await;

    let outcome = store
        .reconciler(Some(InMemoryDestination::remote()), InMemoryDestination::local(), DEADLINE)
        .reconcile()
        .await
        .unwrap();

    assert!(matches!(outcome, ReconcileOutcome::FirstRun));
    let state = store.ledger.current().await.unwrap();
    assert_eq!((state.version, state.record_count), (0, 0));
}

#[tokio::test]
async fn test_current_store_kept_when_newest() {
    let store = TestStore::new().await;
    store.seed_algorithms(4).await;
    store.ledger.record_restored(8, 4, Some(at(8))).await.unwrap();

    let remote = InMemoryDestination::remote();
    publish_latest(remote.as_ref(), &SnapshotBuilder::new(7).algorithms(20, "remote").build()).await;

    let outcome = store
        .reconciler(Some(remote), InMemoryDestination::local(), DEADLINE)
        .reconcile()
        .await
        .unwrap();

    assert!(matches!(outcome, ReconcileOutcome::CurrentIsNewest(s) if s.version == 8));
    assert_eq!(store.count("algorithms").await, 4);
    assert_eq!(store.ledger.current().await.unwrap().version, 8);
}

#[tokio::test]
async fn test_equal_version_later_timestamp_wins() {
    let store = TestStore::new().await;
    store.seed_algorithms(2).await;
    store.ledger.record_restored(5, 2, Some(at(10))).await.unwrap();

    let remote = InMemoryDestination::remote();
    let local = InMemoryDestination::local();
    publish_latest(
        remote.as_ref(),
        &SnapshotBuilder::new(5).updated_at(at(5)).algorithms(3, "remote").build(),
    )
    .await;
    publish_latest(
        local.as_ref(),
        &SnapshotBuilder::new(5).updated_at(at(20)).algorithms(6, "local").build(),
    )
    .await;

    let outcome = store
        .reconciler(Some(remote), local, DEADLINE)
        .reconcile()
        .await
        .unwrap();

    let ReconcileOutcome::Restored(summary) = outcome else {
        panic!("expected a restore, got {outcome:?}");
    };
    assert_eq!(summary.source, DestinationKind::LocalFallback);
    assert_eq!(store.count("algorithms").await, 6);
}

#[tokio::test]
async fn test_empty_store_restores_newer_of_both_backups() {
    let store = TestStore::new().await;

    let remote = InMemoryDestination::remote();
    let local = InMemoryDestination::local();
    publish_latest(remote.as_ref(), &SnapshotBuilder::new(4).algorithms(4, "remote").build()).await;
    publish_latest(local.as_ref(), &SnapshotBuilder::new(6).algorithms(6, "local").build()).await;

    let outcome = store
        .reconciler(Some(remote), local, DEADLINE)
        .reconcile()
        .await
        .unwrap();

    let ReconcileOutcome::Restored(summary) = outcome else {
        panic!("expected a restore, got {outcome:?}");
    };
    assert_eq!(summary.source, DestinationKind::LocalFallback);
    assert_eq!(store.ledger.current().await.unwrap().version, 6);
}

#[tokio::test]
async fn test_empty_store_with_newer_ledger_is_not_overwritten() {
    let store = TestStore::new().await;
    store.ledger.record_restored(9, 0, Some(at(9))).await.unwrap();

    let local = InMemoryDestination::local();
    publish_latest(local.as_ref(), &SnapshotBuilder::new(4).algorithms(4, "old").build()).await;

    let outcome = store.reconciler(None, local, DEADLINE).reconcile().await.unwrap();

    assert!(matches!(outcome, ReconcileOutcome::EmptyStore(s) if s.version == 9));
    assert_eq!(store.count("algorithms").await, 0);
}

#[tokio::test]
async fn test_unreachable_remote_falls_back_to_local() {
    let store = TestStore::new().await;

    let local = InMemoryDestination::local();
    publish_latest(local.as_ref(), &SnapshotBuilder::new(3).algorithms(3, "local").build()).await;

    let outcome = store
        .reconciler(Some(FailingDestination::remote()), local, DEADLINE)
        .reconcile()
        .await
        .unwrap();

    assert!(outcome.restored());
    assert_eq!(store.ledger.current().await.unwrap().version, 3);
}

#[tokio::test]
async fn test_hanging_remote_times_out_without_touching_store() {
    let store = TestStore::new().await;
    store.seed_algorithms(3).await;
    store.ledger.record_restored(2, 3, Some(at(2))).await.unwrap();

    let outcome = store
        .reconciler(
            Some(HangingDestination::remote()),
            InMemoryDestination::local(),
            Duration::from_millis(100),
        )
        .reconcile()
        .await
        .unwrap();

    assert!(matches!(outcome, ReconcileOutcome::TimedOut { .. }));
    assert_eq!(store.count("algorithms").await, 3);
    assert_eq!(store.ledger.current().await.unwrap().version, 2);
}

#[tokio::test]
async fn test_deadline_during_restore_rolls_back() {
    let store = TestStore::new().await;
    store.seed_algorithms(2).await;
    store.ledger.record_restored(1, 2, Some(at(1))).await.unwrap();

    let remote = InMemoryDestination::remote();
    publish_latest(remote.as_ref(), &SnapshotBuilder::new(50).algorithms(3000, "big").build()).await;

    let outcome = store
        .reconciler(Some(remote), InMemoryDestination::local(), Duration::from_millis(1))
        .reconcile()
        .await
        .unwrap();

    assert!(matches!(outcome, ReconcileOutcome::TimedOut { .. }));
    assert_eq!(store.count("algorithms").await, 2);
    assert_eq!(store.count("versions").await, 0);
    assert_eq!(store.ledger.current().await.unwrap().version, 1);
}

#[tokio::test]
async fn test_failing_rows_are_skipped_and_reported() {
    let store = TestStore::new().await;

    let local = InMemoryDestination::local();
    let snapshot = SnapshotBuilder::new(2)
        .algorithms(2, "ok")
        .with_row(
            "versions",
            row(json!({
                "id": "orphan-v1",
                "algorithm_id": "does-not-exist",
                "version_number": 1,
                "minio_path": null,
                "source_code_file": null,
                "commit_message": null,
                "created_at": at(0).to_rfc3339(),
            })),
        )
        .build();
    publish_latest(local.as_ref(), &snapshot).await;

    let outcome = store.reconciler(None, local, DEADLINE).reconcile().await.unwrap();

    let ReconcileOutcome::Restored(summary) = outcome else {
        panic!("expected a restore, got {outcome:?}");
    };
    assert_eq!(summary.failed_rows(), 1);
    let versions = summary.tables.iter().find(|t| t.table == "versions").unwrap();
    assert_eq!((versions.restored, versions.failed), (2, 1));

    assert_eq!(summary.mismatches.len(), 1);
    assert_eq!(summary.mismatches[0].table, "versions");
    assert_eq!((summary.mismatches[0].expected, summary.mismatches[0].actual), (3, 2));
    assert_eq!(store.count("algorithms").await, 2);
}

#[tokio::test]
async fn test_restoring_same_snapshot_twice_is_idempotent() {
    let store = TestStore::new().await;

    let local = InMemoryDestination::local();
    publish_latest(local.as_ref(), &SnapshotBuilder::new(4).algorithms(5, "same").build()).await;

    let reconciler = store.reconciler(None, local.clone(), DEADLINE);
    let candidate = fetch_latest(local.as_ref()).await.unwrap();

    reconciler.restore(&candidate).await.unwrap().unwrap();
    let first = store.rows("algorithms").await;
    let first_state = store.ledger.current().await.unwrap();

    reconciler.restore(&candidate).await.unwrap().unwrap();
    let second = store.rows("algorithms").await;
    let second_state = store.ledger.current().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first_state.version, second_state.version);
    assert_eq!(first_state.record_count, second_state.record_count);
}

#[tokio::test]
async fn test_restored_rows_match_snapshot() {
    let store = TestStore::new().await;

    let snapshot = SnapshotBuilder::new(3).algorithms(3, "exact").build();
    let local = InMemoryDestination::local();
    publish_latest(local.as_ref(), &snapshot).await;

    store.reconciler(None, local, DEADLINE).reconcile().await.unwrap();

    for table in ["algorithms", "versions", "jobs"] {
        let mut expected = snapshot.rows(table).to_vec();
        expected.sort_by_key(|r| r.get("id").and_then(|v| v.as_str()).map(str::to_owned));
        assert_eq!(store.rows(table).await, expected, "table {table}");
    }
}

#[tokio::test]
async fn test_undecodable_backup_is_ignored() {
    let store = TestStore::new().await;

    let remote = InMemoryDestination::remote();
    remote.insert("latest.json", b"{ not json");
    let local = InMemoryDestination::local();
    publish_latest(local.as_ref(), &SnapshotBuilder::new(2).algorithms(1, "local").build()).await;

    let outcome = store
        .reconciler(Some(remote), local, DEADLINE)
        .reconcile()
        .await
        .unwrap();

    let ReconcileOutcome::Restored(summary) = outcome else {
        panic!("expected a restore, got {outcome:?}");
    };
    assert_eq!(summary.source, DestinationKind::LocalFallback);
}

#[tokio::test]
async fn test_newest_timestamped_document_used_without_latest() {
    let local = InMemoryDestination::local();
    let older = SnapshotBuilder::new(1).algorithms(1, "older").build();
    let newer = SnapshotBuilder::new(2).algorithms(2, "newer").build();
    local.insert("backup-20250601-100000.json", &older.encode().unwrap());
    local.insert("backup-20250602-100000.json", &newer.encode().unwrap());

    let candidate = fetch_latest(local.as_ref() as &dyn BackupDestination).await.unwrap();
    assert_eq!(candidate.name, "backup-20250602-100000.json");
    assert_eq!(candidate.state().version, 2);
}

#[tokio::test]
async fn test_unreadable_store_without_backup_is_fatal() {
    let store = TestStore::new().await;
    sqlx::query("DROP TABLE database_metadata")
        .execute(store.provider.pool())
        .await
        .unwrap();
    sqlx::query("CREATE TABLE database_metadata (garbage BLOB)")
        .execute(store.provider.pool())
        .await
        .unwrap();

    let err = store
        .reconciler(None, InMemoryDestination::local(), DEADLINE)
        .reconcile()
        .await
        .unwrap_err();

    let StoreError::Corruption { details } = err else {
        panic!("expected corruption, got {err:?}");
    };
    assert!(details.contains("recover_store_file"));
}

#[tokio::test]
async fn test_restore_holds_maintenance_gate() {
    let store = TestStore::new().await;
    let local = InMemoryDestination::local();
    publish_latest(local.as_ref(), &SnapshotBuilder::new(2).algorithms(2, "gate").build()).await;

    let gate = store.provider.maintenance_gate();
    let held = gate.clone().read_owned().await;

    let reconciler = Arc::new(store.reconciler(None, local, DEADLINE));
    let task = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move { reconciler.reconcile().await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished(), "restore must wait for the maintenance gate");
    assert_eq!(store.count("algorithms").await, 0);

    drop(held);
    let outcome = task.await.unwrap().unwrap();
    assert!(outcome.restored());
}

#[tokio::test]
async fn test_failed_ledger_write_leaves_store_untouched() {
    let store = TestStore::new().await;
    store.seed_algorithms(2).await;
    store.ledger.record_restored(1, 2, Some(at(1))).await.unwrap();
    let original = store.rows("algorithms").await;

    sqlx::query(
        "CREATE TRIGGER reject_restore_entry BEFORE INSERT ON database_metadata \
         WHEN NEW.updated_by = 'restore' \
         BEGIN SELECT RAISE(ABORT, 'ledger write failed'); END",
    )
    .execute(store.provider.pool())
    .await
    .unwrap();

    let local = InMemoryDestination::local();
    publish_latest(local.as_ref(), &SnapshotBuilder::new(5).algorithms(7, "local").build()).await;

    let outcome = store
        .reconciler(None, local, DEADLINE)
        .reconcile()
        .await
        .unwrap();

    let ReconcileOutcome::RestoreFailed { source, reason } = outcome else {
        panic!("expected a failed restore, got {outcome:?}");
    };
    assert_eq!(source, DestinationKind::LocalFallback);
    assert!(reason.contains("ledger write failed"), "reason: {reason}");

    assert_eq!(store.rows("algorithms").await, original);
    assert_eq!(store.count("versions").await, 0);
    assert_eq!(store.count("jobs").await, 0);
    let state = store.ledger.current().await.unwrap();
    assert_eq!((state.version, state.record_count), (1, 2));
}

#[tokio::test]
async fn test_restore_entry_commits_with_data() {
    let store = TestStore::new().await;
    let local = InMemoryDestination::local();
    publish_latest(local.as_ref(), &SnapshotBuilder::new(4).algorithms(3, "tx").build()).await;

    let outcome = store
        .reconciler(None, local, DEADLINE)
        .reconcile()
        .await
        .unwrap();
    assert!(outcome.restored());

    let history = store.ledger.history().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version, 4);
    assert_eq!(history[0].record_count, 3);
    assert_eq!(history[0].updated_by, UpdatedBy::Restore.as_str());
}

#[tokio::test]
async fn test_truncated_latest_falls_back_to_timestamped_document() {
    let local = InMemoryDestination::local();
    local.insert("latest.json", b"{ truncated");
    let valid = SnapshotBuilder::new(3).algorithms(2, "stamped").build();
    local.insert("backup-20250601-100000.json", &valid.encode().unwrap());

    let candidate = fetch_latest(local.as_ref() as &dyn BackupDestination).await.unwrap();
    assert_eq!(candidate.name, "backup-20250601-100000.json");
    assert_eq!(candidate.state().version, 3);
}

#[tokio::test]
async fn test_undecodable_timestamped_documents_are_skipped() {
    let local = InMemoryDestination::local();
    let older = SnapshotBuilder::new(2).algorithms(1, "older").build();
    local.insert("backup-20250601-100000.json", &older.encode().unwrap());
    local.insert("backup-20250602-100000.json", b"{\"format_version\": 1, \"meta");
    local.insert("latest.json", b"");

    let candidate = fetch_latest(local.as_ref() as &dyn BackupDestination).await.unwrap();
    assert_eq!(candidate.name, "backup-20250601-100000.json");
    assert_eq!(candidate.state().version, 2);
}

#[tokio::test]
async fn test_empty_store_restores_past_truncated_latest() {
    let store = TestStore::new().await;
    let local = InMemoryDestination::local();
    local.insert("latest.json", b"{ truncated");
    let valid = SnapshotBuilder::new(3).algorithms(2, "stamped").build();
    local.insert("backup-20250601-100000.json", &valid.encode().unwrap());

    let outcome = store
        .reconciler(Some(FailingDestination::remote()), local, DEADLINE)
        .reconcile()
        .await
        .unwrap();

    let ReconcileOutcome::Restored(summary) = outcome else {
        panic!("expected a restore, got {outcome:?}");
    };
    assert_eq!(summary.name, "backup-20250601-100000.json");
    assert_eq!(store.ledger.current().await.unwrap().version, 3);
    assert_eq!(store.count("algorithms").await, 2);
}

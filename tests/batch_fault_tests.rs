mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tender_lifecycle::batch::{BackoffPolicy, BatchSettings, CopyOutcome};
use tender_lifecycle::lifecycle::{EngineSettings, TransitionEngine};
use tender_lifecycle::{
    ContractRecord, MemoryStageStore, Migrator, Predicate, Registry, RunOptions, Stage, StageStore, Transition,
    TransitionReport,
};

fn options() -> RunOptions {
    RunOptions {
        today: Some(today()),
        ..RunOptions::default()
    }
}

/// Commission-review rows due for `Unclear`, one per id.
async fn stalled_store(ids: impl IntoIterator<Item = i64>) -> MemoryStageStore {
    let store = MemoryStageStore::new();
    store.ensure_stage_tables(Registry::Fz44).await.unwrap();
    store
        .seed_many(
            fz44(Stage::CommissionReview),
            ids.into_iter().map(|id| ContractRecord::new(id).end_date(days_ago(90))),
        )
        .unwrap();
    store
}

fn to_unclear() -> Transition {
    Transition::new(Stage::CommissionReview, Stage::Unclear, Predicate::StalledInCommission)
}

#[tokio::test]
async fn row_already_in_target_is_counted_and_source_removed() {
    let store = stalled_store([1, 2]).await;
    let earlier = ContractRecord::new(1).end_date(days_ago(90)).field("note", "copied earlier");
    store.seed(fz44(Stage::Unclear), earlier.clone()).unwrap();

    let mut migrator = Migrator::in_memory(store.clone(), &config());
    let report = migrator.run(options()).await;
    assert!(report.success);

    let pass = report
        .transition(Registry::Fz44, Stage::CommissionReview, Stage::Unclear)
        .unwrap();
    assert_eq!(pass.inserted, 1);
    assert_eq!(pass.already_present, 1);
    assert_eq!(pass.migrated, 2);
    assert_eq!(pass.deleted, 2);
    assert!(pass.errors.is_empty());

    // The target's copy wins.
    assert_eq!(store.get(fz44(Stage::Unclear), 1).unwrap(), Some(earlier));
    assert_each_once(&store, Registry::Fz44, [1, 2]).await;
}

#[tokio::test]
async fn concurrent_copies_of_one_row() {
    let store = stalled_store([7]).await;
    let t = to_unclear();
    let timeout = Duration::from_secs(5);

    let mut first = store.begin(timeout).await.unwrap();
    let outcome = first
        .copy_row(Registry::Fz44, t.from, t.to, 7, &t.predicate, today())
        .await
        .unwrap();
    assert_eq!(outcome, CopyOutcome::Inserted);

    let second_store = store.clone();
    let second = tokio::spawn(async move {
        let mut tx = second_store.begin(timeout).await.unwrap();
        let outcome = tx
            .copy_row(Registry::Fz44, t.from, t.to, 7, &t.predicate, today())
            .await
            .unwrap();
        let deleted = tx.delete_rows(fz44(Stage::CommissionReview), &[7]).await.unwrap();
        tx.commit().await.unwrap();
        (outcome, deleted)
    });

    // Let the second copy block on the first one's uncommitted row.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished());

    first.relax_integrity().await.unwrap();
    assert_eq!(first.delete_rows(fz44(Stage::CommissionReview), &[7]).await.unwrap(), 1);
    first.restore_integrity().await.unwrap();
    first.commit().await.unwrap();

    let (outcome, deleted) = second.await.unwrap();
    assert_eq!(outcome, CopyOutcome::AlreadyPresent);
    assert_eq!(deleted, 0);
    assert_each_once(&store, Registry::Fz44, [7]).await;
    assert_eq!(store.locate(Registry::Fz44, 7).await.unwrap(), Some(Stage::Unclear));
}

#[tokio::test]
async fn rejected_rows_stay_put_without_stalling_the_pass() {
    let store = stalled_store([1, 2, 3, 4]).await;
    store
        .seed(
            fz44(Stage::CommissionReview),
            ContractRecord::new(5).end_date(days_ago(90)).field("amount", -10.0),
        )
        .unwrap();
    store
        .add_check(
            fz44(Stage::Unclear),
            "amount_not_negative",
            Arc::new(|record: &ContractRecord| {
                !matches!(record.fields.get("amount"), Some(tender_lifecycle::Value::Float(v)) if *v < 0.0)
            }),
        )
        .unwrap();

    let config = config().candidate_limit(2).sub_batch_size(1);
    let mut migrator = Migrator::in_memory(store.clone(), &config);
    let report = migrator.run(options()).await;
    assert!(report.success);

    let pass = report
        .transition(Registry::Fz44, Stage::CommissionReview, Stage::Unclear)
        .unwrap();
    assert_eq!(pass.rejected, 1);
    assert_eq!(pass.migrated, 4);
    assert_eq!(pass.failed_sub_batches, 0);
    assert_eq!(pass.errors.len(), 1);
    assert!(pass.errors[0].starts_with("id 5 rejected"), "{}", pass.errors[0]);
    assert!(pass.errors[0].contains("amount_not_negative"), "{}", pass.errors[0]);
    assert_eq!(store.locate(Registry::Fz44, 5).await.unwrap(), Some(Stage::CommissionReview));

    // Still rejected next time, still not fatal.
    let again = migrator.run(options()).await;
    assert!(again.success);
    assert_eq!(
        again
            .transition(Registry::Fz44, Stage::CommissionReview, Stage::Unclear)
            .unwrap()
            .rejected,
        1
    );
}

#[tokio::test]
async fn slow_sub_batch_is_rolled_back_and_skipped() {
    let store = stalled_store(1..=4).await;
    store.slow_copy(3, Duration::from_millis(300)).unwrap();

    let config = config()
        .sub_batch_size(1)
        .with_statement_timeout(Duration::from_millis(50));
    let mut migrator = Migrator::in_memory(store.clone(), &config);
    let report = migrator.run(options()).await;
    assert!(report.success);

    let pass = report
        .transition(Registry::Fz44, Stage::CommissionReview, Stage::Unclear)
        .unwrap();
    assert_eq!(pass.migrated, 3);
    assert_eq!(pass.failed_sub_batches, 1);
    assert_eq!(pass.timed_out_sub_batches, 1);
    assert_eq!(pass.skipped_ids, 1);
    assert_eq!(pass.errors.len(), 1);

    assert_eq!(store.locate(Registry::Fz44, 3).await.unwrap(), Some(Stage::CommissionReview));
    assert_eq!(store.open_transactions().unwrap(), 0);
    assert_each_once(&store, Registry::Fz44, 1..=4).await;
}

#[tokio::test]
async fn lost_connection_aborts_with_partial_counters() {
    let store = stalled_store(1..=10).await;
    // Enough statements for the first sub-batches, not for the pass.
    store.disconnect_after(20).unwrap();

    let mut migrator = Migrator::in_memory(store.clone(), &config());
    let report = migrator.run(options()).await;

    assert!(!report.success);
    assert!(report.error.as_deref().unwrap_or_default().contains("connection"));
    let migrated = report.migrated();
    assert!(migrated > 0 && migrated < 10, "migrated {}", migrated);
    // The run stopped at the first registry.
    assert!(report.registry(Registry::Fz223).is_none());

    store.reconnect();
    assert_eq!(store.open_transactions().unwrap(), 0);
    assert_eq!(store.row_count(fz44(Stage::Unclear)).unwrap() as u64, migrated);
    assert_each_once(&store, Registry::Fz44, 1..=10).await;
}

#[tokio::test]
async fn unreachable_store_fails_the_run_before_any_pass() {
    let store = stalled_store([1]).await;
    store.go_offline();

    let mut migrator = Migrator::in_memory(store.clone(), &config());
    let report = migrator.run(options()).await;

    assert!(!report.success);
    assert!(report.registries.is_empty());
    assert!(report.finished_at.is_some());
}

#[tokio::test]
async fn contended_target_is_throttled() {
    let store = stalled_store(1..=4).await;
    // Rows the blocker will hold locks on in the target.
    store
        .seed_many(fz44(Stage::Unclear), (100..103).map(ContractRecord::new))
        .unwrap();
    let mut blocker = store.begin(Duration::from_secs(5)).await.unwrap();
    blocker.relax_integrity().await.unwrap();
    blocker.delete_rows(fz44(Stage::Unclear), &[100, 101, 102]).await.unwrap();
    assert_eq!(store.lock_count(fz44(Stage::Unclear)).await.unwrap(), 3);

    let settings = EngineSettings {
        batch: BatchSettings {
            sub_batch_size: 2,
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                jitter: 0.0,
                lock_threshold: 2,
            },
            ..BatchSettings::default()
        },
        ..EngineSettings::default()
    };
    let mut engine = TransitionEngine::new(Arc::new(store.clone()), settings);
    let mut report = TransitionReport::new(Stage::CommissionReview, Stage::Unclear);
    engine
        .run_transition(Registry::Fz44, &to_unclear(), today(), &mut report)
        .await
        .unwrap();

    assert_eq!(report.throttled, 2);
    assert_eq!(report.migrated, 4);

    blocker.rollback().await.unwrap();
    assert_eq!(store.row_count(fz44(Stage::Unclear)).unwrap(), 7);
}

#[tokio::test]
async fn unavailable_lock_statistics_do_not_block_migration() {
    let store = stalled_store(1..=3).await;
    store.fail_lock_counts(true).unwrap();

    let mut migrator = Migrator::in_memory(store.clone(), &config());
    let report = migrator.run(options()).await;

    assert!(report.success);
    let pass = report
        .transition(Registry::Fz44, Stage::CommissionReview, Stage::Unclear)
        .unwrap();
    assert_eq!(pass.migrated, 3);
    assert_eq!(pass.throttled, 0);
}

#[tokio::test]
async fn keyset_cursor_visits_every_candidate_once() {
    let store = stalled_store(1..=23).await;
    let settings = EngineSettings {
        candidate_limit: 5,
        batch: BatchSettings {
            sub_batch_size: 3,
            ..BatchSettings::default()
        },
        ..EngineSettings::default()
    };
    let mut engine = TransitionEngine::new(Arc::new(store.clone()), settings);
    let mut report = TransitionReport::new(Stage::CommissionReview, Stage::Unclear);
    engine
        .run_transition(Registry::Fz44, &to_unclear(), today(), &mut report)
        .await
        .unwrap();

    assert_eq!(report.candidates, 23);
    assert_eq!(report.migrated, 23);
    // Five fetches of at most five ids, each split into sub-batches of three.
    assert_eq!(report.sub_batches, 2 * 4 + 1);
    assert_eq!(store.row_count(fz44(Stage::CommissionReview)).unwrap(), 0);
}

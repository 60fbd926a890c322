mod common;

use common::*;
use tender_lifecycle::{ContractRecord, MemoryStageStore, Migrator, Registry, RunOptions, Stage};

fn options() -> RunOptions {
    RunOptions {
        today: Some(today()),
        ..RunOptions::default()
    }
}

#[tokio::test]
async fn stalled_commission_review_becomes_unclear() {
    let store = MemoryStageStore::new();
    store.ensure_stage_tables_now(Registry::Fz44).await;
    store
        .seed(fz44(Stage::CommissionReview), ContractRecord::new(1).end_date(days_ago(61)))
        .unwrap();
    // Exactly on the boundary: not yet stale.
    store
        .seed(fz44(Stage::CommissionReview), ContractRecord::new(2).end_date(days_ago(60)))
        .unwrap();

    let mut migrator = Migrator::in_memory(store.clone(), &config());
    let report = migrator.run(options()).await;

    assert!(report.success, "{:?}", report.error);
    assert!(store.get(fz44(Stage::Unclear), 1).unwrap().is_some());
    assert!(store.get(fz44(Stage::CommissionReview), 1).unwrap().is_none());
    assert!(store.get(fz44(Stage::CommissionReview), 2).unwrap().is_some());

    let pass = report
        .transition(Registry::Fz44, Stage::CommissionReview, Stage::Unclear)
        .unwrap();
    assert_eq!(pass.migrated, 1);
    assert_eq!(pass.deleted, 1);
    assert!(pass.is_clean());
}

#[tokio::test]
async fn finished_delivery_completes_after_grace() {
    let store = MemoryStageStore::new();
    store
        .seed(fz44(Stage::Active), ContractRecord::new(10).delivery_end_date(days_ago(91)))
        .unwrap();
    store
        .seed(fz44(Stage::Active), ContractRecord::new(11).delivery_end_date(days_ago(90)))
        .unwrap();

    let mut migrator = Migrator::in_memory(store.clone(), &config());
    let report = migrator.run(options()).await;

    assert!(report.success);
    assert_eq!(store.locate_now(Registry::Fz44, 10).await, Some(Stage::Completed));
    assert_eq!(store.locate_now(Registry::Fz44, 11).await, Some(Stage::Active));
    assert_eq!(
        report
            .transition(Registry::Fz44, Stage::Active, Stage::Completed)
            .unwrap()
            .migrated,
        1
    );
}

#[tokio::test]
async fn awarded_takes_priority_over_unclear() {
    let store = MemoryStageStore::new();
    store.ensure_stage_tables_now(Registry::Fz44).await;
    store
        .seed(
            fz44(Stage::CommissionReview),
            ContractRecord::new(3)
                .end_date(days_ago(100))
                .delivery_start_date(days_ago(20)),
        )
        .unwrap();

    let mut migrator = Migrator::in_memory(store.clone(), &config());
    let report = migrator.run(options()).await;

    assert!(report.success);
    assert_eq!(store.locate_now(Registry::Fz44, 3).await, Some(Stage::Awarded));
    let unclear = report
        .transition(Registry::Fz44, Stage::CommissionReview, Stage::Unclear)
        .unwrap();
    assert_eq!(unclear.candidates, 0);
}

#[tokio::test]
async fn one_run_walks_every_applicable_edge() {
    let store = MemoryStageStore::new();
    store
        .seed_many(
            fz44(Stage::Active),
            [
                // closes tomorrow
                ContractRecord::new(1).end_date(days_ahead(1)),
                // closes next week
                ContractRecord::new(2).end_date(days_ahead(7)),
                // long closed, never delivered
                ContractRecord::new(3).end_date(days_ago(61)),
                // closed and delivering
                ContractRecord::new(4)
                    .end_date(days_ago(30))
                    .delivery_start_date(days_ago(5)),
                // no dates at all
                ContractRecord::new(5),
                // abandoned
                ContractRecord::new(6).end_date(days_ago(200)),
            ],
        )
        .unwrap();

    let mut migrator = Migrator::in_memory(store.clone(), &config());
    let report = migrator.run(options()).await;
    assert!(report.success);

    let expected = [
        (1, Stage::CommissionReview),
        (2, Stage::Active),
        (3, Stage::Unclear),
        (4, Stage::Awarded),
        (5, Stage::Bad),
        (6, Stage::Unknown),
    ];
    for (id, stage) in expected {
        assert_eq!(store.locate_now(Registry::Fz44, id).await, Some(stage), "contract {}", id);
    }
    assert_each_once(&store, Registry::Fz44, 1..=6).await;
}

#[tokio::test]
async fn fz223_has_no_dead_end_stages() {
    let store = MemoryStageStore::new();
    store
        .seed_many(
            fz223(Stage::Active),
            [
                ContractRecord::new(1),
                ContractRecord::new(2).end_date(days_ago(200)),
            ],
        )
        .unwrap();

    let mut migrator = Migrator::in_memory(store.clone(), &config().only_registry(Registry::Fz223));
    let report = migrator.run(options()).await;

    assert!(report.success);
    assert_eq!(report.registries.len(), 1);
    assert_eq!(report.registry(Registry::Fz223).unwrap().tables_created.len(), 4);
    assert_eq!(store.locate_now(Registry::Fz223, 1).await, Some(Stage::Active));
    // Stale but still goes through review, there is no Unknown table.
    assert_eq!(store.locate_now(Registry::Fz223, 2).await, Some(Stage::Unclear));
}

#[tokio::test]
async fn second_run_same_day_changes_nothing() {
    let store = MemoryStageStore::new();
    let records = (1..=25).map(|id| {
        let record = ContractRecord::new(id).field("title", format!("lot {}", id));
        match id % 5 {
            0 => record.end_date(days_ago(70)),
            1 => record.end_date(days_ahead(30)),
            2 => record.delivery_end_date(days_ago(120)),
            3 => record.end_date(days_ago(10)).delivery_start_date(days_ago(2)),
            _ => record,
        }
    });
    store.seed_many(fz44(Stage::Active), records).unwrap();

    let mut migrator = Migrator::in_memory(store.clone(), &config());
    let first = migrator.run(options()).await;
    assert!(first.success);
    assert!(first.migrated() > 0);
    let after_first = census(&store, Registry::Fz44).await.unwrap();

    let second = migrator.run(options()).await;
    assert!(second.success);
    assert_eq!(second.migrated(), 0);
    assert_eq!(second.deleted(), 0);
    assert_eq!(census(&store, Registry::Fz44).await.unwrap(), after_first);
    assert_each_once(&store, Registry::Fz44, 1..=25).await;
}

#[tokio::test]
async fn copied_rows_keep_every_column() {
    let store = MemoryStageStore::new();
    let original = ContractRecord::new(42)
        .end_date(days_ago(3))
        .field("customer", "City Hospital No. 4")
        .field("amount", 1_250_000.75)
        .field("lots", 3i64)
        .field("signed", days_ago(40));
    store.seed(fz44(Stage::Active), original.clone()).unwrap();

    let mut migrator = Migrator::in_memory(store.clone(), &config());
    assert!(migrator.run(options()).await.success);

    assert_eq!(store.get(fz44(Stage::CommissionReview), 42).unwrap(), Some(original));
}

#[tokio::test]
async fn plan_counts_without_moving() {
    let store = MemoryStageStore::new();
    store
        .seed_many(
            fz44(Stage::Active),
            [
                ContractRecord::new(1).end_date(days_ago(1)),
                ContractRecord::new(2).end_date(days_ago(2)),
                ContractRecord::new(3),
            ],
        )
        .unwrap();
    store.ensure_stage_tables_now(Registry::Fz44).await;

    let migrator = Migrator::in_memory(store.clone(), &config().only_registry(Registry::Fz44));
    let planned = migrator.plan(today()).await.unwrap();

    assert_eq!(planned.len(), 9);
    let count = |from: Stage, to: Stage| {
        planned
            .iter()
            .find(|p| p.from == from && p.to == to)
            .map(|p| p.candidates)
            .unwrap()
    };
    assert_eq!(count(Stage::Active, Stage::CommissionReview), 2);
    assert_eq!(count(Stage::Active, Stage::Bad), 1);
    assert_eq!(store.row_count(fz44(Stage::Active)).unwrap(), 3);
}

#[tokio::test]
async fn locate_follows_a_contract_across_runs() {
    let store = MemoryStageStore::new();
    store
        .seed(fz44(Stage::Active), ContractRecord::new(8).end_date(days_ahead(1)))
        .unwrap();
    let mut migrator = Migrator::in_memory(store.clone(), &config());

    assert_eq!(migrator.locate(Registry::Fz44, 8).await.unwrap(), Some(Stage::Active));
    assert!(migrator.run(options()).await.success);
    assert_eq!(
        migrator.locate(Registry::Fz44, 8).await.unwrap(),
        Some(Stage::CommissionReview)
    );
    assert_eq!(migrator.locate(Registry::Fz223, 8).await.unwrap(), None);
}

/// Test-only shorthands over the trait methods.
trait StoreExt {
    async fn ensure_stage_tables_now(&self, registry: Registry);
    async fn locate_now(&self, registry: Registry, id: i64) -> Option<Stage>;
}

impl StoreExt for MemoryStageStore {
    async fn ensure_stage_tables_now(&self, registry: Registry) {
        tender_lifecycle::StageStore::ensure_stage_tables(self, registry)
            .await
            .unwrap();
    }

    async fn locate_now(&self, registry: Registry, id: i64) -> Option<Stage> {
        tender_lifecycle::StageStore::locate(self, registry, id).await.unwrap()
    }
}

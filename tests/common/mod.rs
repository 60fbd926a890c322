#![allow(dead_code)]

use chrono::{Duration, NaiveDate};
use std::collections::BTreeMap;
use tender_lifecycle::{ContractId, MemoryStageStore, MigratorConfig, Registry, Result, Stage, StageStore, TableId};

/// A Wednesday, so the weekly snapshot day never coincides with it.
pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 18).unwrap()
}

pub fn days_ago(days: i64) -> NaiveDate {
    today() - Duration::days(days)
}

pub fn days_ahead(days: i64) -> NaiveDate {
    today() + Duration::days(days)
}

pub fn table(registry: Registry, stage: Stage) -> TableId {
    TableId::new(registry, stage).unwrap()
}

pub fn fz44(stage: Stage) -> TableId {
    table(Registry::Fz44, stage)
}

pub fn fz223(stage: Stage) -> TableId {
    table(Registry::Fz223, stage)
}

/// Config for in-memory runs: no snapshots, small sub-batches.
pub fn config() -> MigratorConfig {
    MigratorConfig::default().without_backup().sub_batch_size(2)
}

/// Every committed id of `registry` with the stages holding it.
pub async fn census(store: &MemoryStageStore, registry: Registry) -> Result<BTreeMap<ContractId, Vec<Stage>>> {
    let mut seen: BTreeMap<ContractId, Vec<Stage>> = BTreeMap::new();
    for table in TableId::all(registry) {
        if !store.has_table(table)? {
            continue;
        }
        for id in store.list_ids(table).await? {
            seen.entry(id).or_default().push(table.stage());
        }
    }
    Ok(seen)
}

/// Asserts each of `ids` is held by exactly one stage table.
pub async fn assert_each_once(store: &MemoryStageStore, registry: Registry, ids: impl IntoIterator<Item = ContractId>) {
    let seen = census(store, registry).await.unwrap();
    for id in ids {
        match seen.get(&id) {
            Some(stages) if stages.len() == 1 => {}
            Some(stages) => panic!("contract {} held by {:?}", id, stages),
            None => panic!("contract {} lost", id),
        }
    }
}

pub mod memory;
pub mod postgres;
pub mod snapshot;
pub mod stage_store;
pub mod table;

pub use memory::{MemoryStageStore, MemoryTransaction, ReferentialAction};
pub use postgres::PgStageStore;
pub use snapshot::{MemorySnapshot, SnapshotFile};
pub use stage_store::{StageStore, StageTransaction};
pub use table::StageTable;

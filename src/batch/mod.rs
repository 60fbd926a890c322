pub mod backoff;
pub mod coordinator;
pub mod guard;
pub mod integrity;

pub use backoff::{BackoffPolicy, Throttle};
pub use coordinator::{BatchCoordinator, BatchSettings};
pub use guard::{CopyOutcome, DuplicateGuard};
pub use integrity::IntegrityRelaxation;

pub mod migrator;

pub use migrator::{Migrator, RunOptions};

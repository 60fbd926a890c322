pub mod error;
pub mod types;
pub mod value;

pub use error::{MigrationError, Result};
pub use types::{ContractId, ContractRecord, DocumentLink, Registry, Stage, TableId};
pub use value::Value;

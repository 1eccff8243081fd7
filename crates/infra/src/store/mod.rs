//! Persistence layer: the four ledger tables behind one trait.

mod in_memory;
mod postgres;
mod r#trait;

pub use in_memory::InMemoryDispensaryStore;
pub use postgres::PostgresDispensaryStore;
pub use r#trait::{
    DiscardCommit, DispensaryStore, DispenseCommit, DispenseReceipt, StagingCommit, StoreError,
    StoreResult,
};

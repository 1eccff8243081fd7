//! `rxcustody-infra` — storage and orchestration.
//!
//! This crate composes the pure domain crates into the three operations the
//! application layer calls: stage, dispense, discard. It owns the
//! [`store::DispensaryStore`] trait with its in-memory and Postgres
//! implementations, the engines that drive atomic commits against it, and
//! the injected [`directory::PatientDirectory`] port.

pub mod config;
pub mod directory;
pub mod engine;
pub mod store;

pub use config::store_from_env;
pub use directory::{InMemoryPatientDirectory, PatientDirectory, PatientRecord};
pub use engine::{
    DiscardEngine, DiscardOutcome, Dispensary, DispenseEngine, DispenseOutcome, EngineError,
    StageOutcome, StageRequest, StagingEngine,
};
pub use store::{
    DiscardCommit, DispensaryStore, DispenseCommit, DispenseReceipt, InMemoryDispensaryStore,
    PostgresDispensaryStore, StagingCommit, StoreError, StoreResult,
};

//! The three operations the application layer calls.
//!
//! Each engine follows the same pipeline: load current state, decide purely
//! in the domain crates, then apply every write through one atomic store
//! commit that re-verifies record versions under its lock. A commit that
//! loses a version race is retried from a fresh load, bounded by
//! [`MAX_COMMIT_ATTEMPTS`]; the status precondition then reports what
//! actually happened ("already dispensed") instead of a bare conflict.

mod discard;
mod dispense;
mod staging;

pub use discard::{DiscardEngine, DiscardOutcome};
pub use dispense::{DispenseEngine, DispenseOutcome};
pub use staging::{StageOutcome, StageRequest, StagingEngine};

use thiserror::Error;

use rxcustody_core::{DomainError, UserId};
use rxcustody_dispensing::StagedDoseId;

use crate::directory::PatientDirectory;
use crate::store::{DispensaryStore, StoreError};

/// How many version-conflict races an engine absorbs before giving up.
pub(crate) const MAX_COMMIT_ATTEMPTS: u32 = 3;

/// Engine-level error surfaced to the application layer.
///
/// Business-rule failures (`Validation`, `InsufficientInventory`,
/// `NotFound`, `InvalidState`) are detected before any mutation and carry
/// an operationally specific message. `Timeout` and `Store` are transient;
/// retrying the whole operation is safe because failed commits write
/// nothing.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient inventory: {0}")]
    InsufficientInventory(String),

    #[error("not found")]
    NotFound,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("timed out under contention: {0}")]
    Timeout(String),

    #[error("store failure: {0}")]
    Store(StoreError),
}

impl From<DomainError> for EngineError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => EngineError::Validation(msg),
            DomainError::InsufficientVolume(msg) => EngineError::InsufficientInventory(msg),
            DomainError::NoEligibleVial(msg) => EngineError::InsufficientInventory(msg),
            DomainError::NotFound => EngineError::NotFound,
            DomainError::InvalidState(msg) => EngineError::InvalidState(msg),
            DomainError::InvalidId(msg) => EngineError::Validation(msg),
            DomainError::Conflict(msg) => EngineError::Timeout(msg),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(value: StoreError) -> Self {
        match value {
            // A conflict that reaches the caller means retries were already
            // exhausted inside the engine.
            StoreError::Conflict(msg) => EngineError::Timeout(msg),
            StoreError::Timeout(msg) => EngineError::Timeout(msg),
            other => EngineError::Store(other),
        }
    }
}

/// The dispensary surface handed to the (excluded) application layer:
/// stage, dispense, discard over one store and one patient directory.
pub struct Dispensary<S, D> {
    staging: StagingEngine<S, D>,
    dispense: DispenseEngine<S>,
    discard: DiscardEngine<S>,
}

impl<S, D> Dispensary<S, D>
where
    S: DispensaryStore + Clone,
    D: PatientDirectory,
{
    pub fn new(store: S, directory: D) -> Self {
        Self {
            staging: StagingEngine::new(store.clone(), directory),
            dispense: DispenseEngine::new(store.clone()),
            discard: DiscardEngine::new(store),
        }
    }

    pub async fn stage(
        &self,
        request: StageRequest,
        actor: UserId,
    ) -> Result<StageOutcome, EngineError> {
        self.staging.stage(request, actor).await
    }

    pub async fn dispense(
        &self,
        staged_dose_id: StagedDoseId,
        prescriber: Option<String>,
        signature_note: Option<String>,
        actor: UserId,
    ) -> Result<DispenseOutcome, EngineError> {
        self.dispense
            .dispense(staged_dose_id, prescriber, signature_note, actor)
            .await
    }

    pub async fn discard(
        &self,
        staged_dose_id: StagedDoseId,
        actor: UserId,
    ) -> Result<DiscardOutcome, EngineError> {
        self.discard.discard(staged_dose_id, actor).await
    }
}

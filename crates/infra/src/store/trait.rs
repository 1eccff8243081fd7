use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;
use thiserror::Error;

use rxcustody_audit::{DeaTransaction, DeaTransactionId};
use rxcustody_core::Volume;
use rxcustody_dispensing::{Dispense, DispenseId, StagedDose, StagedDoseId};
use rxcustody_vials::{DrugFilter, Vial, VialId};

/// Store operation error.
///
/// These are **infrastructure errors** (locking, persistence, row decode)
/// as opposed to domain errors (validation, invariants). `Conflict` and
/// `Timeout` are transient: the caller may safely retry, since a failed
/// commit writes nothing.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A version check failed at commit time: another writer got there
    /// first. Reload and retry.
    #[error("write conflict: {0}")]
    Conflict(String),

    /// A row lock could not be acquired within the store's timeout.
    #[error("lock acquisition timed out: {0}")]
    Timeout(String),

    /// A referenced row does not exist.
    #[error("missing row: {0}")]
    MissingRow(String),

    /// The backing store failed (connection, constraint, poisoned lock).
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// A stored row could not be decoded into its domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// All writes of a successful staging, applied atomically.
///
/// Each record carries the version the engine read; the store rejects the
/// commit with `Conflict` if any stored version has moved on, and bumps
/// versions itself on success.
#[derive(Debug, Clone)]
pub struct StagingCommit {
    /// The reserved vial state (remaining already decremented).
    pub vial: Vial,
    /// The staging-time audit entry (insert-once).
    pub transaction: DeaTransaction,
    /// The new reservation, status `Staged`.
    pub staged_dose: StagedDose,
}

/// All writes of a successful dispense, applied atomically.
#[derive(Debug, Clone)]
pub struct DispenseCommit {
    /// The staged dose transitioned to `Dispensed`.
    pub staged_dose: StagedDose,
    /// The new administration record.
    pub dispense: Dispense,
    /// Finalization audit entry for controlled substances; upserted keyed
    /// by its `dispense_id` with fill-null-only merge semantics.
    pub finalization: Option<DeaTransaction>,
    /// Annotation appended to the staging-time entry, when one exists.
    pub supersede: Option<(DeaTransactionId, String)>,
}

/// What a dispense commit actually wrote.
#[derive(Debug, Clone, Copy)]
pub struct DispenseReceipt {
    /// Id of the finalization entry (the pre-existing row when the upsert
    /// merged instead of inserting). `None` for non-controlled dispenses.
    pub dea_transaction_id: Option<DeaTransactionId>,
}

/// All writes of a successful discard, applied atomically.
#[derive(Debug, Clone)]
pub struct DiscardCommit {
    /// The staged dose transitioned to `Discarded`.
    pub staged_dose: StagedDose,
    /// The restored vial state; `None` when the dose carried no vial
    /// reference (the volume restoration is skipped, not failed).
    pub vial: Option<Vial>,
    /// Void annotation for the staging-time entry, when one exists.
    pub void: Option<(DeaTransactionId, String)>,
}

/// The four ledger tables (vials, staged_doses, dispenses,
/// dea_transactions) behind one interface.
///
/// ## Commit semantics
///
/// The three `commit_*` operations are the only multi-row writers. Each
/// must be atomic (all rows or none) and must re-verify, under its own
/// lock, that every carried record version still matches the stored row
/// (single-writer-at-a-time per vial and per staged dose). A failed commit
/// leaves no partial writes.
///
/// ## Audit discipline
///
/// `dea_transactions` rows are insert-once. The only post-creation writes
/// are note appends and the per-dispense fill-null-only finalization merge;
/// no delete or quantity-mutation operation exists.
#[async_trait]
pub trait DispensaryStore: Send + Sync {
    /// Receive an acquired vial into the ledger.
    async fn insert_vial(&self, vial: Vial) -> StoreResult<()>;

    async fn vial(&self, id: VialId) -> StoreResult<Option<Vial>>;

    async fn vials(&self) -> StoreResult<Vec<Vial>>;

    /// One active vial matching the filter with `remaining >= minimum`,
    /// ranked by soonest expiration then lowest clinic vial number.
    async fn select_eligible_vial(
        &self,
        filter: &DrugFilter,
        minimum: Volume,
        as_of: NaiveDate,
    ) -> StoreResult<Option<Vial>>;

    async fn staged_dose(&self, id: StagedDoseId) -> StoreResult<Option<StagedDose>>;

    async fn staged_doses_for_vial(&self, vial_id: VialId) -> StoreResult<Vec<StagedDose>>;

    async fn dispense_record(&self, id: DispenseId) -> StoreResult<Option<Dispense>>;

    async fn dispenses_for_vial(&self, vial_id: VialId) -> StoreResult<Vec<Dispense>>;

    async fn dea_transaction(&self, id: DeaTransactionId) -> StoreResult<Option<DeaTransaction>>;

    /// Audit-review listing, ordered by recorded time.
    async fn dea_transactions_for_vial(&self, vial_id: VialId)
        -> StoreResult<Vec<DeaTransaction>>;

    /// Insert-only audit write; fails `Conflict` on id reuse.
    async fn record_dea_transaction(&self, transaction: DeaTransaction) -> StoreResult<()>;

    /// Append a note line to an existing entry. The only standalone
    /// mutation the audit table supports.
    async fn annotate_dea_transaction(&self, id: DeaTransactionId, note: &str) -> StoreResult<()>;

    async fn commit_staging(&self, commit: StagingCommit) -> StoreResult<()>;

    async fn commit_dispense(&self, commit: DispenseCommit) -> StoreResult<DispenseReceipt>;

    async fn commit_discard(&self, commit: DiscardCommit) -> StoreResult<()>;
}

#[async_trait]
impl<S> DispensaryStore for Arc<S>
where
    S: DispensaryStore + ?Sized,
{
    async fn insert_vial(&self, vial: Vial) -> StoreResult<()> {
        (**self).insert_vial(vial).await
    }

    async fn vial(&self, id: VialId) -> StoreResult<Option<Vial>> {
        (**self).vial(id).await
    }

    async fn vials(&self) -> StoreResult<Vec<Vial>> {
        (**self).vials().await
    }

    async fn select_eligible_vial(
        &self,
        filter: &DrugFilter,
        minimum: Volume,
        as_of: NaiveDate,
    ) -> StoreResult<Option<Vial>> {
        (**self).select_eligible_vial(filter, minimum, as_of).await
    }

    async fn staged_dose(&self, id: StagedDoseId) -> StoreResult<Option<StagedDose>> {
        (**self).staged_dose(id).await
    }

    async fn staged_doses_for_vial(&self, vial_id: VialId) -> StoreResult<Vec<StagedDose>> {
        (**self).staged_doses_for_vial(vial_id).await
    }

    async fn dispense_record(&self, id: DispenseId) -> StoreResult<Option<Dispense>> {
        (**self).dispense_record(id).await
    }

    async fn dispenses_for_vial(&self, vial_id: VialId) -> StoreResult<Vec<Dispense>> {
        (**self).dispenses_for_vial(vial_id).await
    }

    async fn dea_transaction(&self, id: DeaTransactionId) -> StoreResult<Option<DeaTransaction>> {
        (**self).dea_transaction(id).await
    }

    async fn dea_transactions_for_vial(
        &self,
        vial_id: VialId,
    ) -> StoreResult<Vec<DeaTransaction>> {
        (**self).dea_transactions_for_vial(vial_id).await
    }

    async fn record_dea_transaction(&self, transaction: DeaTransaction) -> StoreResult<()> {
        (**self).record_dea_transaction(transaction).await
    }

    async fn annotate_dea_transaction(&self, id: DeaTransactionId, note: &str) -> StoreResult<()> {
        (**self).annotate_dea_transaction(id, note).await
    }

    async fn commit_staging(&self, commit: StagingCommit) -> StoreResult<()> {
        (**self).commit_staging(commit).await
    }

    async fn commit_dispense(&self, commit: DispenseCommit) -> StoreResult<DispenseReceipt> {
        (**self).commit_dispense(commit).await
    }

    async fn commit_discard(&self, commit: DiscardCommit) -> StoreResult<()> {
        (**self).commit_discard(commit).await
    }
}

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::NaiveDate;

use rxcustody_audit::{DeaTransaction, DeaTransactionId};
use rxcustody_core::{ExpectedVersion, Volume};
use rxcustody_dispensing::{Dispense, DispenseId, StagedDose, StagedDoseId};
use rxcustody_vials::{select_eligible, DrugFilter, Vial, VialId};

use super::r#trait::{
    DiscardCommit, DispensaryStore, DispenseCommit, DispenseReceipt, StagingCommit, StoreError,
    StoreResult,
};

#[derive(Debug, Default)]
struct Tables {
    vials: HashMap<VialId, Vial>,
    staged_doses: HashMap<StagedDoseId, StagedDose>,
    dispenses: HashMap<DispenseId, Dispense>,
    dea_transactions: HashMap<DeaTransactionId, DeaTransaction>,
}

/// In-memory dispensary store.
///
/// Intended for tests/dev. One `RwLock` over all four tables: every commit
/// holds the write guard across its precondition re-checks and writes,
/// which is what makes the multi-row commits atomic and serializes writers
/// per vial and per staged dose.
#[derive(Debug, Default)]
pub struct InMemoryDispensaryStore {
    tables: RwLock<Tables>,
}

impl InMemoryDispensaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_version(what: &str, expected: u64, actual: u64) -> StoreResult<()> {
        if ExpectedVersion::Exact(expected).matches(actual) {
            Ok(())
        } else {
            Err(StoreError::Conflict(format!(
                "{what}: expected version {expected}, found {actual}"
            )))
        }
    }

    fn check_vial_bounds(vial: &Vial) -> StoreResult<()> {
        // Defense in depth: the domain ops already enforce the bounds, but
        // a commit must never be able to persist a row outside them.
        if vial.remaining < Volume::ZERO || vial.remaining > vial.capacity {
            return Err(StoreError::Corrupt(format!(
                "vial {}: remaining {} outside [0, {}]",
                vial.id, vial.remaining, vial.capacity
            )));
        }
        Ok(())
    }
}

fn poisoned(_: impl core::fmt::Debug) -> StoreError {
    StoreError::Persistence("lock poisoned".to_string())
}

#[async_trait::async_trait]
impl DispensaryStore for InMemoryDispensaryStore {
    async fn insert_vial(&self, vial: Vial) -> StoreResult<()> {
        Self::check_vial_bounds(&vial)?;
        let mut tables = self.tables.write().map_err(poisoned)?;
        if tables.vials.contains_key(&vial.id) {
            return Err(StoreError::Conflict(format!(
                "vial {} already exists",
                vial.id
            )));
        }
        tables.vials.insert(vial.id, vial);
        Ok(())
    }

    async fn vial(&self, id: VialId) -> StoreResult<Option<Vial>> {
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(tables.vials.get(&id).cloned())
    }

    async fn vials(&self) -> StoreResult<Vec<Vial>> {
        let tables = self.tables.read().map_err(poisoned)?;
        let mut vials: Vec<_> = tables.vials.values().cloned().collect();
        vials.sort_by_key(|v| (v.external_id, v.id));
        Ok(vials)
    }

    async fn select_eligible_vial(
        &self,
        filter: &DrugFilter,
        minimum: Volume,
        as_of: NaiveDate,
    ) -> StoreResult<Option<Vial>> {
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(select_eligible(tables.vials.values(), filter, minimum, as_of).cloned())
    }

    async fn staged_dose(&self, id: StagedDoseId) -> StoreResult<Option<StagedDose>> {
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(tables.staged_doses.get(&id).cloned())
    }

    async fn staged_doses_for_vial(&self, vial_id: VialId) -> StoreResult<Vec<StagedDose>> {
        let tables = self.tables.read().map_err(poisoned)?;
        let mut doses: Vec<_> = tables
            .staged_doses
            .values()
            .filter(|d| d.vial_id == Some(vial_id))
            .cloned()
            .collect();
        doses.sort_by_key(|d| (d.staged_at, d.id.0));
        Ok(doses)
    }

    async fn dispense_record(&self, id: DispenseId) -> StoreResult<Option<Dispense>> {
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(tables.dispenses.get(&id).cloned())
    }

    async fn dispenses_for_vial(&self, vial_id: VialId) -> StoreResult<Vec<Dispense>> {
        let tables = self.tables.read().map_err(poisoned)?;
        let mut records: Vec<_> = tables
            .dispenses
            .values()
            .filter(|d| d.vial_id == Some(vial_id))
            .cloned()
            .collect();
        records.sort_by_key(|d| (d.dispensed_at, d.id.0));
        Ok(records)
    }

    async fn dea_transaction(&self, id: DeaTransactionId) -> StoreResult<Option<DeaTransaction>> {
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(tables.dea_transactions.get(&id).cloned())
    }

    async fn dea_transactions_for_vial(
        &self,
        vial_id: VialId,
    ) -> StoreResult<Vec<DeaTransaction>> {
        let tables = self.tables.read().map_err(poisoned)?;
        let mut entries: Vec<_> = tables
            .dea_transactions
            .values()
            .filter(|t| t.vial_id == vial_id)
            .cloned()
            .collect();
        entries.sort_by_key(|t| (t.recorded_at, t.id.0));
        Ok(entries)
    }

    async fn record_dea_transaction(&self, transaction: DeaTransaction) -> StoreResult<()> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        if tables.dea_transactions.contains_key(&transaction.id) {
            return Err(StoreError::Conflict(format!(
                "dea transaction {} already exists",
                transaction.id
            )));
        }
        tables.dea_transactions.insert(transaction.id, transaction);
        Ok(())
    }

    async fn annotate_dea_transaction(&self, id: DeaTransactionId, note: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        let entry = tables
            .dea_transactions
            .get_mut(&id)
            .ok_or_else(|| StoreError::MissingRow(format!("dea transaction {id}")))?;
        entry.annotate(note);
        Ok(())
    }

    async fn commit_staging(&self, commit: StagingCommit) -> StoreResult<()> {
        Self::check_vial_bounds(&commit.vial)?;

        let mut tables = self.tables.write().map_err(poisoned)?;

        let stored = tables
            .vials
            .get(&commit.vial.id)
            .ok_or_else(|| StoreError::MissingRow(format!("vial {}", commit.vial.id)))?;
        Self::check_version("vial", commit.vial.version, stored.version)?;

        if tables
            .dea_transactions
            .contains_key(&commit.transaction.id)
        {
            return Err(StoreError::Conflict(format!(
                "dea transaction {} already exists",
                commit.transaction.id
            )));
        }
        if tables.staged_doses.contains_key(&commit.staged_dose.id) {
            return Err(StoreError::Conflict(format!(
                "staged dose {} already exists",
                commit.staged_dose.id
            )));
        }

        let mut vial = commit.vial;
        vial.version += 1;
        tables.vials.insert(vial.id, vial);
        tables
            .dea_transactions
            .insert(commit.transaction.id, commit.transaction);
        tables
            .staged_doses
            .insert(commit.staged_dose.id, commit.staged_dose);
        Ok(())
    }

    async fn commit_dispense(&self, commit: DispenseCommit) -> StoreResult<DispenseReceipt> {
        let mut tables = self.tables.write().map_err(poisoned)?;

        let stored = tables
            .staged_doses
            .get(&commit.staged_dose.id)
            .ok_or_else(|| StoreError::MissingRow(format!("staged dose {}", commit.staged_dose.id)))?;
        Self::check_version("staged dose", commit.staged_dose.version, stored.version)?;

        if tables.dispenses.contains_key(&commit.dispense.id) {
            return Err(StoreError::Conflict(format!(
                "dispense {} already exists",
                commit.dispense.id
            )));
        }

        // Finalization entry: idempotent upsert keyed per dispense.
        let dea_transaction_id = match commit.finalization {
            Some(candidate) => {
                let existing = tables
                    .dea_transactions
                    .values()
                    .find(|t| t.dispense_id == Some(commit.dispense.id.0))
                    .map(|t| t.id);
                match existing {
                    Some(id) => {
                        if let Some(entry) = tables.dea_transactions.get_mut(&id) {
                            entry.merge_finalization(&candidate);
                        }
                        Some(id)
                    }
                    None => {
                        let id = candidate.id;
                        tables.dea_transactions.insert(id, candidate);
                        Some(id)
                    }
                }
            }
            None => None,
        };

        if let Some((staging_id, note)) = commit.supersede {
            match tables.dea_transactions.get_mut(&staging_id) {
                Some(entry) => entry.annotate(&note),
                None => tracing::warn!(
                    transaction = %staging_id,
                    "staging transaction missing; supersede annotation skipped"
                ),
            }
        }

        tables.dispenses.insert(commit.dispense.id, commit.dispense);
        let mut dose = commit.staged_dose;
        dose.version += 1;
        tables.staged_doses.insert(dose.id, dose);

        Ok(DispenseReceipt { dea_transaction_id })
    }

    async fn commit_discard(&self, commit: DiscardCommit) -> StoreResult<()> {
        if let Some(vial) = &commit.vial {
            Self::check_vial_bounds(vial)?;
        }

        let mut tables = self.tables.write().map_err(poisoned)?;

        let stored = tables
            .staged_doses
            .get(&commit.staged_dose.id)
            .ok_or_else(|| StoreError::MissingRow(format!("staged dose {}", commit.staged_dose.id)))?;
        Self::check_version("staged dose", commit.staged_dose.version, stored.version)?;

        if let Some(vial) = &commit.vial {
            let stored_vial = tables
                .vials
                .get(&vial.id)
                .ok_or_else(|| StoreError::MissingRow(format!("vial {}", vial.id)))?;
            Self::check_version("vial", vial.version, stored_vial.version)?;
        }

        if let Some(vial) = commit.vial {
            let mut vial = vial;
            vial.version += 1;
            tables.vials.insert(vial.id, vial);
        }

        if let Some((staging_id, note)) = commit.void {
            match tables.dea_transactions.get_mut(&staging_id) {
                Some(entry) => entry.annotate(&note),
                None => tracing::warn!(
                    transaction = %staging_id,
                    "staging transaction missing; void annotation skipped"
                ),
            }
        }

        let mut dose = commit.staged_dose;
        dose.version += 1;
        tables.staged_doses.insert(dose.id, dose);
        Ok(())
    }
}

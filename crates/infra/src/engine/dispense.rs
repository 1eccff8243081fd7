use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use rxcustody_audit::{
    dispense_note, superseded_note, DeaTransaction, DeaTransactionId, PatientSnapshot,
    TransactionSource,
};
use rxcustody_core::{UserId, Volume};
use rxcustody_dispensing::{Dispense, DispenseId, StagedDose, StagedDoseId};

use crate::store::{DispensaryStore, DispenseCommit, StoreError};

use super::{EngineError, MAX_COMMIT_ATTEMPTS};

/// What a successful dispense finalized.
#[derive(Debug, Clone)]
pub struct DispenseOutcome {
    pub dispense_id: DispenseId,
    /// Finalization audit entry; `None` for non-controlled substances.
    pub dea_transaction_id: Option<DeaTransactionId>,
    pub total_dispensed: Volume,
    pub total_waste: Volume,
}

/// Finalizes a staged dose into an administration record.
///
/// The vial is never touched here: its volume was committed at staging
/// time. Only the staged dose flips state, the dispense row is inserted,
/// and the audit trail gains its finalization entry + supersede annotation.
pub struct DispenseEngine<S> {
    store: S,
}

impl<S> DispenseEngine<S>
where
    S: DispensaryStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn dispense(
        &self,
        staged_dose_id: StagedDoseId,
        prescriber: Option<String>,
        signature_note: Option<String>,
        actor: UserId,
    ) -> Result<DispenseOutcome, EngineError> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let mut dose = self
                .store
                .staged_dose(staged_dose_id)
                .await?
                .ok_or(EngineError::NotFound)?;
            // Single-writer gate: only a currently-staged dose may move.
            dose.ensure_staged()?;

            let now = Utc::now();
            // Totals come from the staged dose's own stored fields; the
            // caller never supplies quantities.
            let dispense = Dispense::from_staged(&dose, prescriber.clone(), actor, now)?;
            dose.mark_dispensed(dispense.id)?;

            let finalization = self
                .build_finalization(&dose, &dispense, signature_note.as_deref(), actor, now)
                .await?;
            let supersede = dose
                .dea_transaction_id
                .map(|id| (id, superseded_note(dispense.id.0)));

            let dispense_id = dispense.id;
            let total_dispensed = dispense.total_volume;
            let total_waste = dispense.total_waste;

            match self
                .store
                .commit_dispense(DispenseCommit {
                    staged_dose: dose,
                    dispense,
                    finalization,
                    supersede,
                })
                .await
            {
                Ok(receipt) => {
                    info!(
                        staged_dose = %staged_dose_id,
                        dispense = %dispense_id,
                        total = %total_dispensed,
                        waste = %total_waste,
                        actor = %actor,
                        "staged dose dispensed"
                    );
                    return Ok(DispenseOutcome {
                        dispense_id,
                        dea_transaction_id: receipt.dea_transaction_id,
                        total_dispensed,
                        total_waste,
                    });
                }
                Err(StoreError::Conflict(reason)) => {
                    // Reload: if another writer finished this dose, the
                    // status gate reports the terminal state next pass.
                    debug!(attempt, %reason, "dispense commit lost a write race; reloading");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::Timeout(
            "dispense kept losing staged dose write races".to_string(),
        ))
    }

    /// Build the controlled-substance finalization entry, or `None` when
    /// the substance is not controlled.
    async fn build_finalization(
        &self,
        dose: &StagedDose,
        dispense: &Dispense,
        signature_note: Option<&str>,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<DeaTransaction>, EngineError> {
        let Some(vial_id) = dose.vial_id else {
            warn!(
                staged_dose = %dose.id,
                "staged dose has no vial reference; DEA finalization entry skipped"
            );
            return Ok(None);
        };

        let (controlled, drug_name) = match self.store.vial(vial_id).await? {
            Some(vial) => (vial.controlled, vial.drug_name),
            None => {
                // The reference exists but the row is gone. Record anyway
                // from the label snapshot; a regulatory entry is never
                // silently skipped.
                warn!(
                    vial = %vial_id,
                    staged_dose = %dose.id,
                    "vial row missing; recording finalization from the label snapshot"
                );
                (true, dose.vial_label.clone().unwrap_or_default())
            }
        };
        if !controlled {
            return Ok(None);
        }

        let patient = PatientSnapshot {
            patient_id: dose.patient_id,
            name: dose.patient_name.clone(),
            address: None,
            phone: None,
        };
        // Quantity covers the full amount removed from inventory for this
        // dose, waste included, matching the staging entry.
        let mut entry = DeaTransaction::new(
            TransactionSource::Dispense,
            Some(dispense.id.0),
            vial_id,
            patient,
            drug_name.clone(),
            dose.total_volume,
            dose.unit_count,
            now,
            actor,
            dispense_note(&drug_name, dose.unit_count),
        );
        if let Some(signature) = signature_note {
            entry.annotate(&format!("Signature: {signature}"));
        }
        Ok(Some(entry))
    }
}

use chrono::{NaiveDate, Utc};
use tracing::{debug, info};

use rxcustody_audit::{
    staging_note, DeaTransaction, DeaTransactionId, PatientSnapshot, TransactionSource,
};
use rxcustody_core::{DomainError, PatientId, UserId, Volume};
use rxcustody_dispensing::{DoseSpec, StageParams, StagedDose, StagedDoseId};
use rxcustody_vials::{DrugFilter, VialId};

use crate::directory::PatientDirectory;
use crate::store::{DispensaryStore, StagingCommit, StoreError};

use super::{EngineError, MAX_COMMIT_ATTEMPTS};

/// Inputs for staging a dose ahead of administration.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub patient_id: Option<PatientId>,
    pub patient_name: Option<String>,
    pub dose_volume: Volume,
    pub waste_volume: Volume,
    pub unit_count: u32,
    pub drug_filter: DrugFilter,
    pub staged_for: NaiveDate,
    pub notes: Option<String>,
}

/// What a successful staging reserved.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub staged_dose_id: StagedDoseId,
    pub dea_transaction_id: DeaTransactionId,
    pub vial_id: VialId,
    pub vial_label: String,
    pub total_reserved: Volume,
    pub remaining_in_vial: Volume,
}

/// Reserves volume from an eligible vial, writes the staging audit entry,
/// and creates the staged-dose record, all in one atomic commit.
pub struct StagingEngine<S, D> {
    store: S,
    directory: D,
}

impl<S, D> StagingEngine<S, D>
where
    S: DispensaryStore,
    D: PatientDirectory,
{
    pub fn new(store: S, directory: D) -> Self {
        Self { store, directory }
    }

    /// Snapshot the patient at write time: directory fields when the id
    /// resolves, the caller-supplied name otherwise.
    fn snapshot_patient(&self, request: &StageRequest) -> PatientSnapshot {
        match request.patient_id {
            Some(patient_id) => match self.directory.lookup(patient_id) {
                Some(record) => record.snapshot(),
                None => PatientSnapshot {
                    patient_id: Some(patient_id),
                    name: request.patient_name.clone(),
                    ..PatientSnapshot::default()
                },
            },
            None => match &request.patient_name {
                Some(name) => PatientSnapshot::named(name.clone()),
                None => PatientSnapshot::default(),
            },
        }
    }

    pub async fn stage(
        &self,
        request: StageRequest,
        actor: UserId,
    ) -> Result<StageOutcome, EngineError> {
        let spec = DoseSpec {
            dose_volume: request.dose_volume,
            waste_volume: request.waste_volume,
            unit_count: request.unit_count,
        };
        let total = spec.total_volume()?;
        let patient = self.snapshot_patient(&request);

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let vial = self
                .store
                .select_eligible_vial(&request.drug_filter, total, request.staged_for)
                .await?;
            let Some(mut vial) = vial else {
                return Err(DomainError::no_eligible_vial(format!(
                    "no single vial of {} has {} available",
                    request.drug_filter, total
                ))
                .into());
            };
            vial.reserve(total)?;

            let now = Utc::now();
            let transaction = DeaTransaction::new(
                TransactionSource::PrefillStaging,
                None,
                vial.id,
                patient.clone(),
                vial.drug_name.clone(),
                total,
                spec.unit_count,
                now,
                actor,
                staging_note(&vial.drug_name, spec.unit_count, request.staged_for),
            );

            let staged_dose = StagedDose::stage(StageParams {
                patient_id: request.patient_id,
                patient_name: patient.name.clone().or_else(|| request.patient_name.clone()),
                spec,
                vial_id: vial.id,
                vial_label: vial.label.clone(),
                staged_for: request.staged_for,
                dea_transaction_id: transaction.id,
                notes: request.notes.clone(),
                staged_by: actor,
                staged_at: now,
            })?;

            let outcome = StageOutcome {
                staged_dose_id: staged_dose.id,
                dea_transaction_id: transaction.id,
                vial_id: vial.id,
                vial_label: vial.label.clone(),
                total_reserved: total,
                remaining_in_vial: vial.remaining,
            };

            match self
                .store
                .commit_staging(StagingCommit {
                    vial,
                    transaction,
                    staged_dose,
                })
                .await
            {
                Ok(()) => {
                    info!(
                        staged_dose = %outcome.staged_dose_id,
                        vial = %outcome.vial_id,
                        total = %outcome.total_reserved,
                        actor = %actor,
                        "dose staged"
                    );
                    return Ok(outcome);
                }
                Err(StoreError::Conflict(reason)) => {
                    debug!(attempt, %reason, "staging commit lost a vial write race; reselecting");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::Timeout(
            "staging kept losing vial write races".to_string(),
        ))
    }
}

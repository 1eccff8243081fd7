use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use rxcustody_audit::DeaTransactionId;
use rxcustody_core::{DomainError, DomainResult, Entity, PatientId, RecordId, UserId, Versioned, Volume};
use rxcustody_vials::VialId;

use crate::dispense::DispenseId;

/// Staged-dose identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StagedDoseId(pub RecordId);

impl StagedDoseId {
    pub fn new(id: RecordId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for StagedDoseId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Prefill lifecycle status.
///
/// One-way: `Staged` moves to exactly one of `Dispensed` or `Discarded`
/// and never reverses or repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoseStatus {
    Staged,
    Dispensed,
    Discarded,
}

impl core::fmt::Display for DoseStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            DoseStatus::Staged => "staged",
            DoseStatus::Dispensed => "dispensed",
            DoseStatus::Discarded => "discarded",
        };
        f.write_str(s)
    }
}

/// Per-unit dose arithmetic.
///
/// `total_volume` is what staging reserves; it splits into the
/// administered share (`dispensed_volume`) and the waste share
/// (`waste_total`) at finalization time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoseSpec {
    pub dose_volume: Volume,
    pub waste_volume: Volume,
    pub unit_count: u32,
}

impl DoseSpec {
    pub fn validate(&self) -> DomainResult<()> {
        if !self.dose_volume.is_positive() {
            return Err(DomainError::validation("dose volume must be positive"));
        }
        if self.waste_volume.is_negative() {
            return Err(DomainError::validation("waste volume cannot be negative"));
        }
        if self.unit_count < 1 {
            return Err(DomainError::validation("unit count must be at least 1"));
        }
        Ok(())
    }

    /// (dose + waste) x count: the volume a staging reserves.
    pub fn total_volume(&self) -> DomainResult<Volume> {
        self.validate()?;
        self.dose_volume
            .checked_add(self.waste_volume)
            .and_then(|per_unit| per_unit.checked_mul(self.unit_count))
            .ok_or_else(|| DomainError::validation("total volume overflows"))
    }

    /// dose x count: the volume actually administered.
    pub fn dispensed_volume(&self) -> DomainResult<Volume> {
        self.validate()?;
        self.dose_volume
            .checked_mul(self.unit_count)
            .ok_or_else(|| DomainError::validation("dispensed volume overflows"))
    }

    /// waste x count.
    pub fn waste_total(&self) -> DomainResult<Volume> {
        self.validate()?;
        self.waste_volume
            .checked_mul(self.unit_count)
            .ok_or_else(|| DomainError::validation("waste volume overflows"))
    }
}

/// Inputs for creating a staged dose. Only the staging engine builds this.
#[derive(Debug, Clone)]
pub struct StageParams {
    pub patient_id: Option<PatientId>,
    pub patient_name: Option<String>,
    pub spec: DoseSpec,
    pub vial_id: VialId,
    pub vial_label: String,
    pub staged_for: NaiveDate,
    pub dea_transaction_id: DeaTransactionId,
    pub notes: Option<String>,
    pub staged_by: UserId,
    pub staged_at: DateTime<Utc>,
}

/// A volume reservation against a vial for a future administration.
///
/// The vial reference and staging-transaction link are always set by the
/// staging engine; they stay `Option` in the schema so rows imported from
/// earlier systems remain representable (the discard path tolerates the
/// gap with a logged warning).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedDose {
    pub id: StagedDoseId,
    pub patient_id: Option<PatientId>,
    pub patient_name: Option<String>,
    pub dose_volume: Volume,
    pub waste_volume: Volume,
    pub unit_count: u32,
    /// (dose + waste) x count, fixed at creation.
    pub total_volume: Volume,
    pub vial_id: Option<VialId>,
    pub vial_label: Option<String>,
    pub staged_for: NaiveDate,
    pub status: DoseStatus,
    pub dea_transaction_id: Option<DeaTransactionId>,
    pub dispense_id: Option<DispenseId>,
    pub notes: Option<String>,
    pub staged_by: UserId,
    pub staged_at: DateTime<Utc>,
    /// Store write counter (optimistic concurrency).
    pub version: u64,
}

impl StagedDose {
    /// Create a staged reservation. Fails on invalid dose arithmetic; the
    /// total volume is computed here and never recomputed from caller
    /// input afterwards.
    pub fn stage(params: StageParams) -> DomainResult<Self> {
        let total_volume = params.spec.total_volume()?;
        Ok(Self {
            id: StagedDoseId::new(RecordId::new()),
            patient_id: params.patient_id,
            patient_name: params.patient_name,
            dose_volume: params.spec.dose_volume,
            waste_volume: params.spec.waste_volume,
            unit_count: params.spec.unit_count,
            total_volume,
            vial_id: Some(params.vial_id),
            vial_label: Some(params.vial_label),
            staged_for: params.staged_for,
            status: DoseStatus::Staged,
            dea_transaction_id: Some(params.dea_transaction_id),
            dispense_id: None,
            notes: params.notes,
            staged_by: params.staged_by,
            staged_at: params.staged_at,
            version: 0,
        })
    }

    /// Rebuild the dose arithmetic from this record's own stored fields.
    pub fn spec(&self) -> DoseSpec {
        DoseSpec {
            dose_volume: self.dose_volume,
            waste_volume: self.waste_volume,
            unit_count: self.unit_count,
        }
    }

    /// Precondition gate shared by dispense and discard: the single-writer
    /// check that makes the transition terminal.
    pub fn ensure_staged(&self) -> DomainResult<()> {
        match self.status {
            DoseStatus::Staged => Ok(()),
            DoseStatus::Dispensed => Err(DomainError::invalid_state("prefill already dispensed")),
            DoseStatus::Discarded => Err(DomainError::invalid_state("prefill already discarded")),
        }
    }

    /// Terminal transition: staged -> dispensed.
    pub fn mark_dispensed(&mut self, dispense_id: DispenseId) -> DomainResult<()> {
        self.ensure_staged()?;
        self.status = DoseStatus::Dispensed;
        self.dispense_id = Some(dispense_id);
        Ok(())
    }

    /// Terminal transition: staged -> discarded.
    pub fn mark_discarded(&mut self) -> DomainResult<()> {
        self.ensure_staged()?;
        self.status = DoseStatus::Discarded;
        Ok(())
    }
}

impl Entity for StagedDose {
    type Id = StagedDoseId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Versioned for StagedDose {
    fn version(&self) -> u64 {
        self.version
    }
}

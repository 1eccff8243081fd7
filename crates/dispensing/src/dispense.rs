use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rxcustody_core::{DomainResult, Entity, PatientId, RecordId, UserId, Volume};
use rxcustody_vials::VialId;

use crate::dose::StagedDose;

/// Dispense identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispenseId(pub RecordId);

impl DispenseId {
    pub fn new(id: RecordId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for DispenseId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Signature workflow state. Dispenses are created `Awaiting`; the signing
/// flow itself lives outside this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureStatus {
    Awaiting,
    Signed,
}

/// The finalized record of medication actually administered.
///
/// Immutable once written (except the out-of-scope signature flow). The
/// source vial's volume was already committed at staging time, so a
/// dispense never mutates inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispense {
    pub id: DispenseId,
    pub vial_id: Option<VialId>,
    pub patient_id: Option<PatientId>,
    /// dose x count: the administered share of the staged reservation.
    pub total_volume: Volume,
    /// waste x count.
    pub total_waste: Volume,
    pub unit_count: u32,
    pub dose_per_unit: Volume,
    pub signature: SignatureStatus,
    pub prescriber: Option<String>,
    pub dispensed_by: UserId,
    pub dispensed_at: DateTime<Utc>,
}

impl Dispense {
    /// Build the administration record from the staged dose's own stored
    /// fields. Totals are recomputed here; caller-supplied quantities are
    /// never trusted.
    pub fn from_staged(
        dose: &StagedDose,
        prescriber: Option<String>,
        dispensed_by: UserId,
        dispensed_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let spec = dose.spec();
        Ok(Self {
            id: DispenseId::new(RecordId::new()),
            vial_id: dose.vial_id,
            patient_id: dose.patient_id,
            total_volume: spec.dispensed_volume()?,
            total_waste: spec.waste_total()?,
            unit_count: dose.unit_count,
            dose_per_unit: dose.dose_volume,
            signature: SignatureStatus::Awaiting,
            prescriber,
            dispensed_by,
            dispensed_at,
        })
    }
}

impl Entity for Dispense {
    type Id = DispenseId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dose::{DoseSpec, StageParams};
    use chrono::NaiveDate;
    use rxcustody_audit::DeaTransactionId;

    #[test]
    fn from_staged_recomputes_totals_from_stored_fields() {
        let dose = StagedDose::stage(StageParams {
            patient_id: None,
            patient_name: Some("Jordan Doe".to_string()),
            spec: DoseSpec {
                dose_volume: Volume::from_hundredths(100),
                waste_volume: Volume::from_hundredths(10),
                unit_count: 3,
            },
            vial_id: VialId::new(RecordId::new()),
            vial_label: "V-001".to_string(),
            staged_for: NaiveDate::from_ymd_opt(2026, 8, 10).unwrap(),
            dea_transaction_id: DeaTransactionId::new(RecordId::new()),
            notes: None,
            staged_by: UserId::new(),
            staged_at: Utc::now(),
        })
        .unwrap();

        let dispense =
            Dispense::from_staged(&dose, Some("Dr. Reyes".to_string()), UserId::new(), Utc::now())
                .unwrap();

        assert_eq!(dispense.total_volume, Volume::from_hundredths(300));
        assert_eq!(dispense.total_waste, Volume::from_hundredths(30));
        assert_eq!(dispense.unit_count, 3);
        assert_eq!(dispense.dose_per_unit, Volume::from_hundredths(100));
        assert_eq!(dispense.signature, SignatureStatus::Awaiting);
        assert_eq!(dispense.vial_id, dose.vial_id);
    }
}

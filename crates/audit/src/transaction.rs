use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use rxcustody_core::{Entity, PatientId, RecordId, UserId, ValueObject, Volume};
use rxcustody_vials::VialId;

/// DEA transaction identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeaTransactionId(pub RecordId);

impl DeaTransactionId {
    pub fn new(id: RecordId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for DeaTransactionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Which flow wrote the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionSource {
    PrefillStaging,
    Dispense,
}

/// Patient identity copied into the audit trail at write time.
///
/// A copied value, never a live reference: the regulatory record must
/// reflect truth at transaction time even if the patient record later
/// changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientSnapshot {
    pub patient_id: Option<PatientId>,
    pub name: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
}

impl PatientSnapshot {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Copy fields from `other` into any field that is still unset.
    /// Populated fields are never overwritten.
    pub fn fill_missing_from(&mut self, other: &PatientSnapshot) {
        if self.patient_id.is_none() {
            self.patient_id = other.patient_id;
        }
        if self.name.is_none() {
            self.name.clone_from(&other.name);
        }
        if self.address.is_none() {
            self.address.clone_from(&other.address);
        }
        if self.phone.is_none() {
            self.phone.clone_from(&other.phone);
        }
    }
}

impl ValueObject for PatientSnapshot {}

/// Narrative for a staging-time entry.
pub fn staging_note(drug_name: &str, units: u32, staged_for: NaiveDate) -> String {
    format!("STAGED PREFILL for {staged_for}: {units} unit(s) of {drug_name}")
}

/// Narrative for a finalization-time entry.
pub fn dispense_note(drug_name: &str, units: u32) -> String {
    format!("DISPENSED: {units} unit(s) of {drug_name}")
}

/// Annotation marking a staging entry replaced by a finalized dispense.
pub fn superseded_note(dispense_id: RecordId) -> String {
    format!("[SUPERSEDED by dispense {dispense_id}]")
}

/// Annotation marking a staging entry cancelled by a discard.
pub const VOIDED_NOTE: &str = "[VOIDED - Prefill removed]";

/// One regulatory audit-log entry for a quantity movement.
///
/// Insert-once. After creation only [`DeaTransaction::annotate`] (notes
/// append) and [`DeaTransaction::merge_finalization`] (fill-null-only
/// upsert for re-finalized dispenses) may touch a stored row. There is no
/// delete and no quantity mutation anywhere in the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeaTransaction {
    pub id: DeaTransactionId,
    /// Links a finalization entry to its dispense row; `None` for pure
    /// staging entries. Also the idempotency key for the finalization
    /// upsert.
    pub dispense_id: Option<RecordId>,
    pub vial_id: VialId,
    pub patient: PatientSnapshot,
    pub drug_name: String,
    pub quantity: Volume,
    pub units: u32,
    pub recorded_at: DateTime<Utc>,
    /// Append-only audit narrative.
    pub notes: String,
    pub source: TransactionSource,
    pub recorded_by: UserId,
}

impl DeaTransaction {
    pub fn new(
        source: TransactionSource,
        dispense_id: Option<RecordId>,
        vial_id: VialId,
        patient: PatientSnapshot,
        drug_name: impl Into<String>,
        quantity: Volume,
        units: u32,
        recorded_at: DateTime<Utc>,
        recorded_by: UserId,
        note: impl Into<String>,
    ) -> Self {
        Self {
            id: DeaTransactionId::new(RecordId::new()),
            dispense_id,
            vial_id,
            patient,
            drug_name: drug_name.into(),
            quantity,
            units,
            recorded_at,
            notes: note.into(),
            source,
            recorded_by,
        }
    }

    /// Append a line to the narrative. The existing text is never edited;
    /// this is the only way lifecycle state reaches the audit trail.
    pub fn annotate(&mut self, note: &str) {
        if self.notes.is_empty() {
            self.notes.push_str(note);
        } else {
            self.notes.push('\n');
            self.notes.push_str(note);
        }
    }

    /// Idempotent per-dispense finalization merge.
    ///
    /// A re-finalized dispense updates quantity/units/timestamp and fills
    /// snapshot fields that are still empty; populated fields and the
    /// narrative are left untouched.
    pub fn merge_finalization(&mut self, incoming: &DeaTransaction) {
        self.quantity = incoming.quantity;
        self.units = incoming.units;
        self.recorded_at = incoming.recorded_at;
        self.patient.fill_missing_from(&incoming.patient);
        if self.drug_name.is_empty() {
            self.drug_name.clone_from(&incoming.drug_name);
        }
    }
}

impl Entity for DeaTransaction {
    type Id = DeaTransactionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

//! Injected patient-directory port.
//!
//! Patient records live outside this core. The staging engine only needs a
//! read-only lookup to copy name/address/phone into the audit trail at
//! write time.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use rxcustody_audit::PatientSnapshot;
use rxcustody_core::PatientId;

/// The directory fields this core consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub id: PatientId,
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
}

impl PatientRecord {
    /// Copy the record into an audit-trail snapshot.
    pub fn snapshot(&self) -> PatientSnapshot {
        PatientSnapshot {
            patient_id: Some(self.id),
            name: Some(self.name.clone()),
            address: self.address.clone(),
            phone: self.phone.clone(),
        }
    }
}

/// Read-only patient lookup, injected by the application layer.
pub trait PatientDirectory: Send + Sync {
    fn lookup(&self, id: PatientId) -> Option<PatientRecord>;
}

impl<D> PatientDirectory for Arc<D>
where
    D: PatientDirectory + ?Sized,
{
    fn lookup(&self, id: PatientId) -> Option<PatientRecord> {
        (**self).lookup(id)
    }
}

/// In-memory directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryPatientDirectory {
    records: RwLock<HashMap<PatientId, PatientRecord>>,
}

impl InMemoryPatientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, record: PatientRecord) {
        if let Ok(mut records) = self.records.write() {
            records.insert(record.id, record);
        }
    }
}

impl PatientDirectory for InMemoryPatientDirectory {
    fn lookup(&self, id: PatientId) -> Option<PatientRecord> {
        self.records.read().ok()?.get(&id).cloned()
    }
}

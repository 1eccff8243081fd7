use std::sync::Arc;

use chrono::{NaiveDate, Utc};

use rxcustody_core::{UserId, Volume};
use rxcustody_infra::{
    Dispensary, InMemoryDispensaryStore, InMemoryPatientDirectory, StageRequest,
};
use rxcustody_vials::{DrugFilter, Vial, VialId};

pub const DRUG: &str = "Ketamine 100mg/mL";

pub type TestDispensary = Dispensary<Arc<InMemoryDispensaryStore>, Arc<InMemoryPatientDirectory>>;

pub fn staged_for() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 8, 10).unwrap()
}

pub fn actor() -> UserId {
    UserId::new()
}

pub fn test_dispensary() -> (
    Arc<InMemoryDispensaryStore>,
    Arc<InMemoryPatientDirectory>,
    TestDispensary,
) {
    let store = Arc::new(InMemoryDispensaryStore::new());
    let directory = Arc::new(InMemoryPatientDirectory::new());
    let dispensary = Dispensary::new(store.clone(), directory.clone());
    (store, directory, dispensary)
}

pub async fn seed_vial(
    store: &InMemoryDispensaryStore,
    external_id: i64,
    capacity_hundredths: i64,
    remaining_hundredths: i64,
) -> VialId {
    use rxcustody_infra::DispensaryStore;

    let mut vial = Vial::receive(
        external_id,
        format!("V-{external_id:03}"),
        DRUG,
        true,
        Volume::from_hundredths(capacity_hundredths),
        NaiveDate::from_ymd_opt(2027, 1, 31).unwrap(),
        Utc::now(),
    )
    .unwrap();
    vial.remaining = Volume::from_hundredths(remaining_hundredths);
    let id = vial.id;
    store.insert_vial(vial).await.unwrap();
    id
}

/// Scenario A/B numbers: dose 1.0 mL, waste 0.1 mL, 3 units (total 3.3 mL).
pub fn scenario_request() -> StageRequest {
    StageRequest {
        patient_id: None,
        patient_name: Some("Jordan Doe".to_string()),
        dose_volume: Volume::from_hundredths(100),
        waste_volume: Volume::from_hundredths(10),
        unit_count: 3,
        drug_filter: DrugFilter::new(DRUG),
        staged_for: staged_for(),
        notes: None,
    }
}

//! End-to-end engine flows over the in-memory store.

mod common;

use chrono::Utc;

use common::{actor, scenario_request, seed_vial, staged_for, test_dispensary, DRUG};
use rxcustody_audit::{DeaTransaction, PatientSnapshot, TransactionSource, VOIDED_NOTE};
use rxcustody_core::{PatientId, Volume};
use rxcustody_dispensing::{
    Dispense, DoseSpec, DoseStatus, SignatureStatus, StageParams, StagedDose,
};
use rxcustody_infra::{DispensaryStore, DispenseCommit, EngineError, PatientRecord, StagingCommit};

#[tokio::test]
async fn scenario_a_stage_then_dispense() {
    let (store, _directory, dispensary) = test_dispensary();
    let vial_id = seed_vial(&store, 1, 1000, 1000).await;
    let actor = actor();

    // Stage: reserve (1.0 + 0.1) x 3 = 3.3 mL.
    let staged = dispensary.stage(scenario_request(), actor).await.unwrap();
    assert_eq!(staged.vial_id, vial_id);
    assert_eq!(staged.total_reserved, Volume::from_hundredths(330));
    assert_eq!(staged.remaining_in_vial, Volume::from_hundredths(670));

    let vial = store.vial(vial_id).await.unwrap().unwrap();
    assert_eq!(vial.remaining, Volume::from_hundredths(670));

    let dose = store.staged_dose(staged.staged_dose_id).await.unwrap().unwrap();
    assert_eq!(dose.status, DoseStatus::Staged);
    assert_eq!(dose.total_volume, Volume::from_hundredths(330));

    let staging_entry = store
        .dea_transaction(staged.dea_transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(staging_entry.source, TransactionSource::PrefillStaging);
    assert_eq!(staging_entry.quantity, Volume::from_hundredths(330));
    assert!(staging_entry.notes.starts_with("STAGED PREFILL"));

    // Dispense: totals recomputed from the staged dose itself.
    let dispensed = dispensary
        .dispense(staged.staged_dose_id, Some("Dr. Reyes".to_string()), None, actor)
        .await
        .unwrap();
    assert_eq!(dispensed.total_dispensed, Volume::from_hundredths(300));
    assert_eq!(dispensed.total_waste, Volume::from_hundredths(30));

    let dose = store.staged_dose(staged.staged_dose_id).await.unwrap().unwrap();
    assert_eq!(dose.status, DoseStatus::Dispensed);
    assert_eq!(dose.dispense_id, Some(dispensed.dispense_id));

    // No further vial mutation: volume was committed at staging.
    let vial = store.vial(vial_id).await.unwrap().unwrap();
    assert_eq!(vial.remaining, Volume::from_hundredths(670));

    let record = store
        .dispense_record(dispensed.dispense_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.signature, SignatureStatus::Awaiting);
    assert_eq!(record.prescriber.as_deref(), Some("Dr. Reyes"));

    // Staging entry superseded, finalization entry linked to the dispense.
    let staging_entry = store
        .dea_transaction(staged.dea_transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert!(staging_entry
        .notes
        .contains(&format!("[SUPERSEDED by dispense {}]", dispensed.dispense_id)));

    let finalization_id = dispensed.dea_transaction_id.expect("controlled substance");
    let finalization = store.dea_transaction(finalization_id).await.unwrap().unwrap();
    assert_eq!(finalization.source, TransactionSource::Dispense);
    assert_eq!(finalization.dispense_id, Some(dispensed.dispense_id.0));
    assert_eq!(finalization.quantity, Volume::from_hundredths(330));
}

#[tokio::test]
async fn scenario_b_stage_then_discard_restores_volume() {
    let (store, _directory, dispensary) = test_dispensary();
    let vial_id = seed_vial(&store, 1, 1000, 1000).await;
    let actor = actor();

    let staged = dispensary.stage(scenario_request(), actor).await.unwrap();
    assert_eq!(staged.remaining_in_vial, Volume::from_hundredths(670));

    let discarded = dispensary.discard(staged.staged_dose_id, actor).await.unwrap();
    assert_eq!(discarded.restored, Volume::from_hundredths(330));
    assert!(!discarded.capped);

    // Exactly the pre-staging remaining again.
    let vial = store.vial(vial_id).await.unwrap().unwrap();
    assert_eq!(vial.remaining, Volume::from_hundredths(1000));

    let dose = store.staged_dose(staged.staged_dose_id).await.unwrap().unwrap();
    assert_eq!(dose.status, DoseStatus::Discarded);

    let staging_entry = store
        .dea_transaction(staged.dea_transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert!(staging_entry.notes.ends_with(VOIDED_NOTE));
    assert!(staging_entry.notes.starts_with("STAGED PREFILL"));
}

#[tokio::test]
async fn scenario_c_discard_with_over_restore_caps_at_capacity() {
    let (store, _directory, dispensary) = test_dispensary();
    let vial_id = seed_vial(&store, 1, 1000, 200).await;
    let actor = actor();

    // Hand-commit an anomalous reservation (9.0 mL staged against a vial
    // holding 2.0 of 10.0), the kind of row an imported legacy system can
    // leave behind.
    let vial = store.vial(vial_id).await.unwrap().unwrap();
    let spec = DoseSpec {
        dose_volume: Volume::from_hundredths(300),
        waste_volume: Volume::ZERO,
        unit_count: 3,
    };
    let transaction = DeaTransaction::new(
        TransactionSource::PrefillStaging,
        None,
        vial_id,
        PatientSnapshot::named("Jordan Doe"),
        DRUG,
        Volume::from_hundredths(900),
        3,
        Utc::now(),
        actor,
        "STAGED PREFILL (imported)",
    );
    let staged_dose = StagedDose::stage(StageParams {
        patient_id: None,
        patient_name: Some("Jordan Doe".to_string()),
        spec,
        vial_id,
        vial_label: vial.label.clone(),
        staged_for: staged_for(),
        dea_transaction_id: transaction.id,
        notes: None,
        staged_by: actor,
        staged_at: Utc::now(),
    })
    .unwrap();
    let dose_id = staged_dose.id;
    store
        .commit_staging(StagingCommit {
            vial,
            transaction,
            staged_dose,
        })
        .await
        .unwrap();

    let discarded = dispensary.discard(dose_id, actor).await.unwrap();
    assert!(discarded.capped);
    assert_eq!(discarded.restored, Volume::from_hundredths(800));

    // Capped at 10.0, not 11.0.
    let vial = store.vial(vial_id).await.unwrap().unwrap();
    assert_eq!(vial.remaining, Volume::from_hundredths(1000));
}

#[tokio::test]
async fn dispensing_twice_returns_invalid_state_with_zero_writes() {
    let (store, _directory, dispensary) = test_dispensary();
    let vial_id = seed_vial(&store, 1, 1000, 1000).await;
    let actor = actor();

    let staged = dispensary.stage(scenario_request(), actor).await.unwrap();
    dispensary
        .dispense(staged.staged_dose_id, None, None, actor)
        .await
        .unwrap();

    let err = dispensary
        .dispense(staged.staged_dose_id, None, None, actor)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(ref msg) if msg.contains("already dispensed")));

    // Zero writes: still exactly one dispense, vial untouched.
    assert_eq!(store.dispenses_for_vial(vial_id).await.unwrap().len(), 1);
    let vial = store.vial(vial_id).await.unwrap().unwrap();
    assert_eq!(vial.remaining, Volume::from_hundredths(670));
}

#[tokio::test]
async fn discarding_a_dispensed_dose_is_rejected() {
    let (store, _directory, dispensary) = test_dispensary();
    let vial_id = seed_vial(&store, 1, 1000, 1000).await;
    let actor = actor();

    let staged = dispensary.stage(scenario_request(), actor).await.unwrap();
    dispensary
        .dispense(staged.staged_dose_id, None, None, actor)
        .await
        .unwrap();

    let err = dispensary
        .discard(staged.staged_dose_id, actor)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(ref msg) if msg.contains("already dispensed")));

    // No restoration happened.
    let vial = store.vial(vial_id).await.unwrap().unwrap();
    assert_eq!(vial.remaining, Volume::from_hundredths(670));
}

#[tokio::test]
async fn unknown_ids_return_not_found() {
    let (_store, _directory, dispensary) = test_dispensary();
    let actor = actor();
    let missing = rxcustody_dispensing::StagedDoseId::new(rxcustody_core::RecordId::new());

    assert!(matches!(
        dispensary.dispense(missing, None, None, actor).await.unwrap_err(),
        EngineError::NotFound
    ));
    assert!(matches!(
        dispensary.discard(missing, actor).await.unwrap_err(),
        EngineError::NotFound
    ));
}

#[tokio::test]
async fn staging_never_splits_a_request_across_vials() {
    let (store, _directory, dispensary) = test_dispensary();
    // 4.0 + 4.0 mL across two vials cannot serve a 5.0 mL request.
    let a = seed_vial(&store, 1, 1000, 400).await;
    let b = seed_vial(&store, 2, 1000, 400).await;

    let mut request = scenario_request();
    request.dose_volume = Volume::from_hundredths(250);
    request.waste_volume = Volume::ZERO;
    request.unit_count = 2;

    let err = dispensary.stage(request, actor()).await.unwrap_err();
    assert!(matches!(err, EngineError::InsufficientInventory(_)));

    // Zero writes: both vials untouched, nothing staged.
    for vial_id in [a, b] {
        let vial = store.vial(vial_id).await.unwrap().unwrap();
        assert_eq!(vial.remaining, Volume::from_hundredths(400));
        assert!(store.staged_doses_for_vial(vial_id).await.unwrap().is_empty());
        assert!(store.dea_transactions_for_vial(vial_id).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn staging_validates_inputs_before_any_mutation() {
    let (store, _directory, dispensary) = test_dispensary();
    let vial_id = seed_vial(&store, 1, 1000, 1000).await;

    let mut request = scenario_request();
    request.dose_volume = Volume::ZERO;
    let err = dispensary.stage(request, actor()).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let mut request = scenario_request();
    request.unit_count = 0;
    let err = dispensary.stage(request, actor()).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let vial = store.vial(vial_id).await.unwrap().unwrap();
    assert_eq!(vial.remaining, Volume::from_hundredths(1000));
}

#[tokio::test]
async fn staging_prefers_soonest_expiring_vial() {
    let (store, _directory, dispensary) = test_dispensary();
    let _later = seed_vial(&store, 7, 1000, 1000).await;
    let sooner = {
        // Same drug, earlier expiration.
        use rxcustody_vials::Vial;
        let mut vial = Vial::receive(
            3,
            "V-003",
            DRUG,
            true,
            Volume::from_hundredths(1000),
            chrono::NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
            Utc::now(),
        )
        .unwrap();
        vial.remaining = Volume::from_hundredths(1000);
        let id = vial.id;
        store.insert_vial(vial).await.unwrap();
        id
    };

    let staged = dispensary.stage(scenario_request(), actor()).await.unwrap();
    assert_eq!(staged.vial_id, sooner);
}

#[tokio::test]
async fn patient_snapshot_is_copied_at_staging_time() {
    let (store, directory, dispensary) = test_dispensary();
    seed_vial(&store, 1, 1000, 1000).await;

    let patient_id = PatientId::new();
    directory.upsert(PatientRecord {
        id: patient_id,
        name: "Jordan Doe".to_string(),
        address: Some("12 Main St".to_string()),
        phone: Some("555-0100".to_string()),
    });

    let mut request = scenario_request();
    request.patient_id = Some(patient_id);
    request.patient_name = None;
    let staged = dispensary.stage(request, actor()).await.unwrap();

    // The directory record changes later; the audit snapshot must not.
    directory.upsert(PatientRecord {
        id: patient_id,
        name: "Renamed Patient".to_string(),
        address: None,
        phone: None,
    });

    let entry = store
        .dea_transaction(staged.dea_transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.patient.patient_id, Some(patient_id));
    assert_eq!(entry.patient.name.as_deref(), Some("Jordan Doe"));
    assert_eq!(entry.patient.address.as_deref(), Some("12 Main St"));
    assert_eq!(entry.patient.phone.as_deref(), Some("555-0100"));
}

#[tokio::test]
async fn closed_system_invariant_holds_across_mixed_flows() {
    let (store, _directory, dispensary) = test_dispensary();
    let vial_id = seed_vial(&store, 1, 1000, 1000).await;
    let actor = actor();

    // Three reservations: keep one staged, dispense one, discard one.
    let _kept = dispensary.stage(scenario_request(), actor).await.unwrap();
    let to_dispense = dispensary.stage(scenario_request(), actor).await.unwrap();
    let to_discard = dispensary.stage(scenario_request(), actor).await.unwrap();

    dispensary
        .dispense(to_dispense.staged_dose_id, None, None, actor)
        .await
        .unwrap();
    dispensary.discard(to_discard.staged_dose_id, actor).await.unwrap();

    let vial = store.vial(vial_id).await.unwrap().unwrap();
    let staged_total: i64 = store
        .staged_doses_for_vial(vial_id)
        .await
        .unwrap()
        .iter()
        .filter(|d| d.status == DoseStatus::Staged)
        .map(|d| d.total_volume.hundredths())
        .sum();
    let finalized_total: i64 = store
        .dispenses_for_vial(vial_id)
        .await
        .unwrap()
        .iter()
        .map(|d| d.total_volume.hundredths() + d.total_waste.hundredths())
        .sum();

    assert_eq!(
        vial.remaining.hundredths() + staged_total + finalized_total,
        vial.capacity.hundredths()
    );
}

#[tokio::test]
async fn finalization_upsert_fills_only_missing_fields() {
    let (store, _directory, dispensary) = test_dispensary();
    let vial_id = seed_vial(&store, 1, 1000, 1000).await;
    let actor = actor();

    let staged = dispensary.stage(scenario_request(), actor).await.unwrap();

    // Pre-existing finalization row keyed by the dispense id, as a
    // half-finished earlier attempt would leave it.
    let mut dose = store.staged_dose(staged.staged_dose_id).await.unwrap().unwrap();
    let dispense = Dispense::from_staged(&dose, None, actor, Utc::now()).unwrap();
    dose.mark_dispensed(dispense.id).unwrap();

    let earlier = DeaTransaction::new(
        TransactionSource::Dispense,
        Some(dispense.id.0),
        vial_id,
        PatientSnapshot::named("Original Name"),
        DRUG,
        Volume::from_hundredths(100),
        1,
        Utc::now(),
        actor,
        "DISPENSED: earlier attempt",
    );
    let earlier_id = earlier.id;
    store.record_dea_transaction(earlier.clone()).await.unwrap();

    let candidate = DeaTransaction::new(
        TransactionSource::Dispense,
        Some(dispense.id.0),
        vial_id,
        PatientSnapshot {
            patient_id: None,
            name: Some("SHOULD NOT WIN".to_string()),
            address: Some("12 Main St".to_string()),
            phone: None,
        },
        DRUG,
        Volume::from_hundredths(330),
        3,
        Utc::now(),
        actor,
        "DISPENSED: 3 unit(s)",
    );

    let receipt = store
        .commit_dispense(DispenseCommit {
            staged_dose: dose,
            dispense,
            finalization: Some(candidate),
            supersede: None,
        })
        .await
        .unwrap();

    // Merged into the existing row, not inserted again.
    assert_eq!(receipt.dea_transaction_id, Some(earlier_id));
    let merged = store.dea_transaction(earlier_id).await.unwrap().unwrap();
    assert_eq!(merged.quantity, Volume::from_hundredths(330));
    assert_eq!(merged.units, 3);
    assert_eq!(merged.patient.name.as_deref(), Some("Original Name"));
    assert_eq!(merged.patient.address.as_deref(), Some("12 Main St"));
    assert_eq!(merged.notes, "DISPENSED: earlier attempt");
}

#[tokio::test]
async fn annotate_appends_and_rejects_unknown_rows() {
    let (store, _directory, dispensary) = test_dispensary();
    seed_vial(&store, 1, 1000, 1000).await;

    let staged = dispensary.stage(scenario_request(), actor()).await.unwrap();
    store
        .annotate_dea_transaction(staged.dea_transaction_id, "Reviewed during monthly audit")
        .await
        .unwrap();

    let entry = store
        .dea_transaction(staged.dea_transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert!(entry.notes.ends_with("Reviewed during monthly audit"));
    assert!(entry.notes.starts_with("STAGED PREFILL"));

    let missing = rxcustody_audit::DeaTransactionId::new(rxcustody_core::RecordId::new());
    assert!(store
        .annotate_dea_transaction(missing, "nope")
        .await
        .is_err());
}

//! Races on one staged dose and one vial: exactly one writer wins.

mod common;

use std::sync::Arc;

use common::{actor, scenario_request, seed_vial, test_dispensary};
use rxcustody_core::Volume;
use rxcustody_dispensing::DoseStatus;
use rxcustody_infra::{DispensaryStore, EngineError};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_discards_restore_exactly_once() {
    let (store, _directory, dispensary) = test_dispensary();
    let vial_id = seed_vial(&store, 1, 1000, 1000).await;
    let actor = actor();

    let staged = dispensary.stage(scenario_request(), actor).await.unwrap();
    let dispensary = Arc::new(dispensary);

    let a = {
        let dispensary = dispensary.clone();
        let id = staged.staged_dose_id;
        tokio::spawn(async move { dispensary.discard(id, actor).await })
    };
    let b = {
        let dispensary = dispensary.clone();
        let id = staged.staged_dose_id;
        tokio::spawn(async move { dispensary.discard(id, actor).await })
    };

    let results = [a.await.unwrap(), b.await.unwrap()];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one discard must win");
    let loser = results
        .iter()
        .find_map(|r| r.as_ref().err())
        .expect("one discard must lose");
    assert!(
        matches!(loser, EngineError::InvalidState(msg) if msg.contains("already discarded")),
        "loser saw: {loser}"
    );

    // Exactly one restoration: back to the pre-staging level, not above.
    let vial = store.vial(vial_id).await.unwrap().unwrap();
    assert_eq!(vial.remaining, Volume::from_hundredths(1000));

    // Exactly one void annotation on the staging entry.
    let entry = store
        .dea_transaction(staged.dea_transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        entry.notes.matches("[VOIDED").count(),
        1,
        "staging entry must be voided exactly once"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispense_and_discard_yield_one_winner() {
    let (store, _directory, dispensary) = test_dispensary();
    let vial_id = seed_vial(&store, 1, 1000, 1000).await;
    let actor = actor();

    let staged = dispensary.stage(scenario_request(), actor).await.unwrap();
    let dispensary = Arc::new(dispensary);

    let dispense = {
        let dispensary = dispensary.clone();
        let id = staged.staged_dose_id;
        tokio::spawn(async move { dispensary.dispense(id, None, None, actor).await })
    };
    let discard = {
        let dispensary = dispensary.clone();
        let id = staged.staged_dose_id;
        tokio::spawn(async move { dispensary.discard(id, actor).await })
    };

    let dispense_result = dispense.await.unwrap();
    let discard_result = discard.await.unwrap();
    assert!(
        dispense_result.is_ok() ^ discard_result.is_ok(),
        "exactly one transition must win"
    );

    let dose = store.staged_dose(staged.staged_dose_id).await.unwrap().unwrap();
    let vial = store.vial(vial_id).await.unwrap().unwrap();
    match (&dispense_result, &discard_result) {
        (Ok(_), Err(e)) => {
            assert_eq!(dose.status, DoseStatus::Dispensed);
            // Volume stays committed when the dispense won.
            assert_eq!(vial.remaining, Volume::from_hundredths(670));
            assert!(matches!(e, EngineError::InvalidState(_)));
        }
        (Err(e), Ok(_)) => {
            assert_eq!(dose.status, DoseStatus::Discarded);
            assert_eq!(vial.remaining, Volume::from_hundredths(1000));
            assert!(matches!(e, EngineError::InvalidState(_)));
        }
        _ => unreachable!("xor above guarantees one winner"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_stagings_never_over_allocate_a_vial() {
    let (store, _directory, dispensary) = test_dispensary();
    // Room for one 3.3 mL reservation, not two.
    let vial_id = seed_vial(&store, 1, 1000, 400).await;
    let actor = actor();
    let dispensary = Arc::new(dispensary);

    let a = {
        let dispensary = dispensary.clone();
        tokio::spawn(async move { dispensary.stage(scenario_request(), actor).await })
    };
    let b = {
        let dispensary = dispensary.clone();
        tokio::spawn(async move { dispensary.stage(scenario_request(), actor).await })
    };

    let results = [a.await.unwrap(), b.await.unwrap()];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one staging must win");
    let loser = results
        .iter()
        .find_map(|r| r.as_ref().err())
        .expect("one staging must lose");
    assert!(matches!(loser, EngineError::InsufficientInventory(_)));

    // Never below zero, and exactly one reservation on the books.
    let vial = store.vial(vial_id).await.unwrap().unwrap();
    assert_eq!(vial.remaining, Volume::from_hundredths(70));
    assert_eq!(store.staged_doses_for_vial(vial_id).await.unwrap().len(), 1);
}

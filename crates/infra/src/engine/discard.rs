use tracing::{debug, info, warn};

use rxcustody_audit::VOIDED_NOTE;
use rxcustody_core::{UserId, Volume};
use rxcustody_dispensing::StagedDoseId;

use crate::store::{DiscardCommit, DispensaryStore, StoreError};

use super::{EngineError, MAX_COMMIT_ATTEMPTS};

/// What a successful discard restored.
#[derive(Debug, Clone)]
pub struct DiscardOutcome {
    pub staged_dose_id: StagedDoseId,
    /// Volume returned to the vial (zero when the dose carried no vial
    /// reference).
    pub restored: Volume,
    /// True when the restore clipped at vial capacity.
    pub capped: bool,
}

/// Cancels an un-dispensed staged dose: restores vial volume (capped),
/// voids the staging audit entry, and marks the dose discarded.
pub struct DiscardEngine<S> {
    store: S,
}

impl<S> DiscardEngine<S>
where
    S: DispensaryStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn discard(
        &self,
        staged_dose_id: StagedDoseId,
        actor: UserId,
    ) -> Result<DiscardOutcome, EngineError> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let mut dose = self
                .store
                .staged_dose(staged_dose_id)
                .await?
                .ok_or(EngineError::NotFound)?;
            dose.ensure_staged()?;

            let mut restored = Volume::ZERO;
            let mut capped = false;
            let vial = match dose.vial_id {
                Some(vial_id) => match self.store.vial(vial_id).await? {
                    Some(mut vial) => {
                        let outcome = vial.restore(dose.total_volume)?;
                        if outcome.capped() {
                            // Anomaly, not a failure: more volume came back
                            // than the vial has room for. Keep it visible
                            // for audit review.
                            warn!(
                                vial = %vial.id,
                                requested = %dose.total_volume,
                                clipped = %outcome.clipped,
                                "over-restore clipped at vial capacity"
                            );
                        }
                        restored = outcome.restored;
                        capped = outcome.capped();
                        Some(vial)
                    }
                    None => {
                        warn!(
                            vial = %vial_id,
                            staged_dose = %dose.id,
                            "vial row missing; volume restoration skipped"
                        );
                        None
                    }
                },
                None => {
                    // Data-quality gap tolerated: proceed without
                    // restoration, but never silently.
                    warn!(
                        staged_dose = %dose.id,
                        "staged dose has no vial reference; volume restoration skipped"
                    );
                    None
                }
            };

            dose.mark_discarded()?;
            let void = dose
                .dea_transaction_id
                .map(|id| (id, VOIDED_NOTE.to_string()));

            match self
                .store
                .commit_discard(DiscardCommit {
                    staged_dose: dose,
                    vial,
                    void,
                })
                .await
            {
                Ok(()) => {
                    info!(
                        staged_dose = %staged_dose_id,
                        restored = %restored,
                        actor = %actor,
                        "staged dose discarded"
                    );
                    return Ok(DiscardOutcome {
                        staged_dose_id,
                        restored,
                        capped,
                    });
                }
                Err(StoreError::Conflict(reason)) => {
                    debug!(attempt, %reason, "discard commit lost a write race; reloading");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::Timeout(
            "discard kept losing staged dose write races".to_string(),
        ))
    }
}

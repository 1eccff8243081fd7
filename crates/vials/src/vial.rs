use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use rxcustody_core::{DomainError, DomainResult, Entity, RecordId, Versioned, Volume};

/// Vial identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VialId(pub RecordId);

impl VialId {
    pub fn new(id: RecordId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for VialId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Vial lifecycle status. Only `Active` vials are eligible for staging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VialStatus {
    Active,
    Retired,
}

/// Drug-identity filter used when selecting a vial for a staging request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrugFilter {
    pub drug_name: String,
}

impl DrugFilter {
    pub fn new(drug_name: impl Into<String>) -> Self {
        Self {
            drug_name: drug_name.into(),
        }
    }

    pub fn matches(&self, vial: &Vial) -> bool {
        vial.drug_name.eq_ignore_ascii_case(&self.drug_name)
    }
}

impl core::fmt::Display for DrugFilter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.drug_name)
    }
}

/// What a capped-at-capacity restore actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreOutcome {
    /// Volume added back to the vial.
    pub restored: Volume,
    /// Volume that could not be restored because capacity was reached.
    pub clipped: Volume,
}

impl RestoreOutcome {
    /// True when the restore hit the capacity cap (an anomaly to log,
    /// never a hard failure).
    pub fn capped(&self) -> bool {
        self.clipped.is_positive()
    }
}

/// A physical multi-dose vial.
///
/// Invariant: `Volume::ZERO <= remaining <= capacity`. `remaining` is
/// mutated only through [`Vial::reserve`] and [`Vial::restore`]; the store
/// re-verifies both bounds under its row lock before committing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vial {
    pub id: VialId,
    /// Clinic-visible vial number; the selection tie-breaker.
    pub external_id: i64,
    pub label: String,
    pub drug_name: String,
    /// Controlled-substance flag; drives DEA finalization entries.
    pub controlled: bool,
    pub capacity: Volume,
    pub remaining: Volume,
    pub status: VialStatus,
    pub expiration: NaiveDate,
    pub received_at: DateTime<Utc>,
    /// Store write counter (optimistic concurrency).
    pub version: u64,
}

impl Vial {
    /// Receive an acquired vial into the ledger, full and active.
    pub fn receive(
        external_id: i64,
        label: impl Into<String>,
        drug_name: impl Into<String>,
        controlled: bool,
        capacity: Volume,
        expiration: NaiveDate,
        received_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if !capacity.is_positive() {
            return Err(DomainError::validation("vial capacity must be positive"));
        }
        Ok(Self {
            id: VialId::new(RecordId::new()),
            external_id,
            label: label.into(),
            drug_name: drug_name.into(),
            controlled,
            capacity,
            remaining: capacity,
            status: VialStatus::Active,
            expiration,
            received_at,
            version: 0,
        })
    }

    /// Reserve `amount` out of the remaining volume.
    ///
    /// Fails `InsufficientVolume` when the request exceeds what is left;
    /// the vial is untouched on failure.
    pub fn reserve(&mut self, amount: Volume) -> DomainResult<()> {
        if !amount.is_positive() {
            return Err(DomainError::validation(
                "reservation amount must be positive",
            ));
        }
        if amount > self.remaining {
            return Err(DomainError::insufficient_volume(format!(
                "vial {}: requested {} exceeds remaining {}",
                self.label, amount, self.remaining
            )));
        }
        self.remaining = Volume::from_hundredths(self.remaining.hundredths() - amount.hundredths());
        Ok(())
    }

    /// Restore `amount`, capped at capacity.
    ///
    /// An over-restore is clipped and reported, not rejected: the physical
    /// liquid went back in the vial either way, and the anomaly belongs in
    /// the logs for audit review.
    pub fn restore(&mut self, amount: Volume) -> DomainResult<RestoreOutcome> {
        if amount.is_negative() {
            return Err(DomainError::validation("restore amount cannot be negative"));
        }
        let headroom =
            Volume::from_hundredths(self.capacity.hundredths() - self.remaining.hundredths());
        let restored = amount.min(headroom);
        let clipped = Volume::from_hundredths(amount.hundredths() - restored.hundredths());
        self.remaining =
            Volume::from_hundredths(self.remaining.hundredths() + restored.hundredths());
        Ok(RestoreOutcome { restored, clipped })
    }

    /// Retire the vial (expired stock, breakage, recall). Retired vials are
    /// never selected for staging.
    pub fn retire(&mut self) {
        self.status = VialStatus::Retired;
    }

    /// Whether this vial can serve a staging request of `minimum` volume.
    pub fn is_eligible(&self, filter: &DrugFilter, minimum: Volume, as_of: NaiveDate) -> bool {
        self.status == VialStatus::Active
            && filter.matches(self)
            && self.expiration >= as_of
            && self.remaining >= minimum
    }
}

impl Entity for Vial {
    type Id = VialId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Versioned for Vial {
    fn version(&self) -> u64 {
        self.version
    }
}

/// Pick the vial a staging request should draw from.
///
/// Policy: soonest expiration first, then lowest clinic vial number, so
/// stock that would otherwise expire gets used up. A request is never split
/// across vials; callers treat `None` as "no single vial has enough".
pub fn select_eligible<'a, I>(
    vials: I,
    filter: &DrugFilter,
    minimum: Volume,
    as_of: NaiveDate,
) -> Option<&'a Vial>
where
    I: IntoIterator<Item = &'a Vial>,
{
    vials
        .into_iter()
        .filter(|v| v.is_eligible(filter, minimum, as_of))
        .min_by_key(|v| (v.expiration, v.external_id, v.id))
}

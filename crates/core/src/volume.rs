//! Fixed-point liquid volume.
//!
//! All quantities in the ledger are integer counts of hundredths of a
//! milliliter. Integer arithmetic keeps reservation/restore math exact;
//! floating point never enters the domain layer.

use serde::{Deserialize, Serialize};

use crate::value_object::ValueObject;

/// A liquid volume in hundredths of a milliliter.
///
/// `Volume::from_hundredths(330)` is 3.30 mL. The type itself permits
/// negative values so subtraction stays total; validation at the operation
/// boundaries rejects them.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Volume(i64);

impl Volume {
    pub const ZERO: Volume = Volume(0);

    pub const fn from_hundredths(hundredths: i64) -> Self {
        Self(hundredths)
    }

    /// Whole-milliliter convenience constructor.
    pub const fn from_ml(ml: i64) -> Self {
        Self(ml * 100)
    }

    pub const fn hundredths(self) -> i64 {
        self.0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Volume) -> Option<Volume> {
        self.0.checked_add(other.0).map(Volume)
    }

    pub fn checked_sub(self, other: Volume) -> Option<Volume> {
        self.0.checked_sub(other.0).map(Volume)
    }

    /// Multiply by a unit count (e.g. per-unit dose x units staged).
    pub fn checked_mul(self, count: u32) -> Option<Volume> {
        self.0.checked_mul(i64::from(count)).map(Volume)
    }

    pub fn min(self, other: Volume) -> Volume {
        Volume(self.0.min(other.0))
    }
}

impl ValueObject for Volume {}

impl core::fmt::Display for Volume {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02} mL", abs / 100, abs % 100)
    }
}

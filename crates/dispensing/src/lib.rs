//! Staged-dose and dispense domain module.
//!
//! Business rules for the prefill lifecycle: checked dose arithmetic, the
//! one-way `Staged -> {Dispensed | Discarded}` state machine, and the
//! immutable administration record. Pure domain logic; the engines in the
//! infra crate drive these rules inside atomic store commits.

pub mod dispense;
pub mod dose;

pub use dispense::{Dispense, DispenseId, SignatureStatus};
pub use dose::{DoseSpec, DoseStatus, StageParams, StagedDose, StagedDoseId};

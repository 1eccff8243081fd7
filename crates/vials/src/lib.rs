//! Vial Ledger domain module.
//!
//! Authoritative rules for each vial's remaining volume: bounded
//! decrement/restore and the eligibility policy that picks which vial a
//! staging request draws from. Pure domain logic, no IO and no storage; the
//! infra store re-checks these rules under its locks before committing.

pub mod vial;

pub use vial::{select_eligible, DrugFilter, RestoreOutcome, Vial, VialId, VialStatus};

//! DEA Audit Log domain module.
//!
//! Append-mostly regulatory ledger of controlled-substance movements.
//! Entries are insert-once: quantity and identity fields are write-once and
//! nothing is ever deleted. Lifecycle state is reconstructed from `notes`
//! annotations (`[SUPERSEDED ...]`, `[VOIDED ...]`) layered on top of the
//! original narrative, plus the fill-null-only finalization merge.

pub mod transaction;

pub use transaction::{
    dispense_note, staging_note, superseded_note, DeaTransaction, DeaTransactionId,
    PatientSnapshot, TransactionSource, VOIDED_NOTE,
};

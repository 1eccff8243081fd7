//! `rxcustody-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no storage, no IO): the
//! error taxonomy, strongly-typed identifiers, the fixed-point [`Volume`]
//! type, and the optimistic-concurrency primitives shared by every record
//! the store tracks.

pub mod concurrency;
pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;
pub mod volume;

pub use concurrency::{ExpectedVersion, Versioned};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{PatientId, RecordId, UserId};
pub use value_object::ValueObject;
pub use volume::Volume;

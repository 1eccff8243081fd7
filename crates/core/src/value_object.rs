//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attribute values;
/// `Volume` and the audit-trail patient snapshot are the canonical examples
/// here. Two snapshots with the same fields are the same snapshot; there is
/// no identity to track. To "modify" one, build a new value.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

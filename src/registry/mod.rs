//! Entity classification.
//!
//! This module provides:
//! - The declarative field/entity descriptor builders (`descriptor`)
//! - `EntityFieldRegistry`: eager validation, cascade-cycle rejection, and
//!   the classification runtime code reads from (`registry`)

pub mod descriptor;
#[allow(clippy::module_inception)]
pub mod registry;

// Re-export the most commonly used items.
pub use descriptor::{
    EntityDescriptor, FieldDescriptor, FieldRole, GroupMember, HmacPurpose, MigrationWaiver,
};
pub use registry::EntityFieldRegistry;

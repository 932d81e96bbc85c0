//! `eventline-core`: pure building blocks shared by the event and infra crates.
//!
//! This crate contains **no infrastructure concerns**: identifiers, structured
//! validation errors and the domain error model.

pub mod error;
pub mod id;
pub mod validation;

pub use error::{DomainError, DomainResult};
pub use id::EntityId;
pub use validation::{BASE, Validate, ValidationErrors};

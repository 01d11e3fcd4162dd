//! Flat Image Tree (FIT) validation.
//!
//! A [`Schema`] describes the expected shape of an image tree: which properties and subnodes
//! each node may carry, which are required, and how their values must look. A [`Validator`]
//! walks a device tree against it and collects every violation as a [`Finding`].

pub mod elements;
mod error;
mod findings;
pub mod schema;
pub mod validator;

pub use elements::{check_phandle_target, Element, ElementKind, NodeKind, PropertyCheck};
pub use error::{SchemaError, ValidationError};
pub use findings::{Finding, Findings};
pub use schema::{fit_schema, ElementId, Schema, SchemaElement, Variant};
pub use validator::{Expected, Lookup, Validator};

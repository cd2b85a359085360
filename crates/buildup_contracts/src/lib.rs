#![forbid(unsafe_code)]

pub mod common;
pub mod envelope;
pub mod project;
pub mod schedule;

pub use common::{
    validate_text, validate_token, ContractViolation, ReasonCodeId, SchemaVersion, Validate,
    WallTimeMs,
};

#![forbid(unsafe_code)]

pub mod adapter;
pub mod error;
pub mod project_store;
pub mod schedule_store;

pub use error::StoreError;
pub use project_store::{AppliedTransition, ProjectStore};
pub use schedule_store::{ScheduleFilter, ScheduleStore};

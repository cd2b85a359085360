#![forbid(unsafe_code)]

pub mod bus;
pub mod coordinator;
pub mod dedup;
pub mod runtime;

pub use bus::{EventBus, SubscriberFailure, Subscription};
pub use coordinator::{reason_codes, SyncCoordinator};
pub use dedup::{DedupConfig, Deduplicator};
pub use runtime::SyncRuntime;

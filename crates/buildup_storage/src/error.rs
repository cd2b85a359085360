#![forbid(unsafe_code)]

use buildup_contracts::envelope::EnvelopeId;
use buildup_contracts::project::ProjectId;
use buildup_contracts::schedule::{ScheduleId, ScheduleStatus};
use buildup_contracts::ContractViolation;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Malformed input; carries every violated constraint, not just the
    /// first, so producers can fix a submission in one pass.
    Validation { violations: Vec<ContractViolation> },
    NotFound {
        entity: &'static str,
        key: String,
    },
    DuplicateKey {
        entity: &'static str,
        key: String,
    },
    /// A schedule status move outside the allowed lifecycle.
    InvalidStatusTransition {
        schedule_id: ScheduleId,
        from: ScheduleStatus,
    },
    /// A phase transition whose envelope id is already recorded in the
    /// project's phase history. This is the durable idempotency guard,
    /// distinct from the time-bounded deduplicator.
    DuplicateTransition {
        project_id: ProjectId,
        envelope_id: EnvelopeId,
    },
    Contract(ContractViolation),
    Adapter {
        message: String,
    },
}

impl From<ContractViolation> for StoreError {
    fn from(v: ContractViolation) -> Self {
        StoreError::Contract(v)
    }
}

#![forbid(unsafe_code)]

use crate::project::{ActorId, ProjectId, ProjectPhase};
use crate::schedule::{MeetingSequence, PhaseTransitionTrigger, Schedule, ScheduleId};
use crate::{
    validate_text, validate_token, ContractViolation, ReasonCodeId, SchemaVersion, Validate,
    WallTimeMs,
};

pub const ENVELOPE_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Namespaced envelope type strings. The payload enum is the source of truth;
/// these constants exist for subscription keys and diagnostics.
pub mod envelope_types {
    pub const SCHEDULE_CREATED: &str = "schedule.created";
    pub const SCHEDULE_UPDATED: &str = "schedule.updated";
    pub const SCHEDULE_COMPLETED: &str = "schedule.completed";
    pub const SCHEDULE_SYNC_REQUESTED: &str = "schedule.sync_requested";
    pub const PHASE_TRANSITION_COMPLETED: &str = "phase_transition.completed";
    pub const SYNC_ERROR: &str = "sync.error";
    pub const SYNC_NO_OP: &str = "sync.no_op";
    pub const PROJECT_PHASE_CHANGED: &str = "project.phase_changed";
    pub const RULE_MISMATCH: &str = "rule.mismatch";
    pub const SUBSCRIBER_ERROR: &str = "subscriber.error";
}

#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct EnvelopeId(String);

impl EnvelopeId {
    pub fn new(value: impl Into<String>) -> Result<Self, ContractViolation> {
        let value = value.into();
        validate_token("envelope_id", &value, 96)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for EnvelopeId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("envelope_id", &self.0, 96)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SyncOperation {
    CreateMeeting,
    CompleteMeeting,
}

impl SyncOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncOperation::CreateMeeting => "create_meeting",
            SyncOperation::CompleteMeeting => "complete_meeting",
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum EnvelopePayload {
    ScheduleCreated {
        schedule: Schedule,
    },
    ScheduleUpdated {
        schedule: Schedule,
    },
    ScheduleCompleted {
        schedule_id: ScheduleId,
        project_id: Option<ProjectId>,
    },
    /// Request produced by UI actions or background sync jobs. Fields are
    /// optional because producers at the application boundary may emit
    /// incomplete requests; the coordinator validates and reports.
    ScheduleSyncRequested {
        project_id: Option<ProjectId>,
        meeting: Option<MeetingSequence>,
        operation: SyncOperation,
    },
    PhaseTransitionCompleted {
        project_id: ProjectId,
        from_phase: ProjectPhase,
        to_phase: ProjectPhase,
        schedule_id: Option<ScheduleId>,
        envelope_id: EnvelopeId,
        already_applied: bool,
        reason_code: ReasonCodeId,
    },
    SyncError {
        operation: String,
        error: String,
        envelope_id: EnvelopeId,
        project_id: Option<ProjectId>,
        reason_code: ReasonCodeId,
    },
    SyncNoOp {
        envelope_id: EnvelopeId,
        reason: String,
        reason_code: ReasonCodeId,
    },
    ProjectPhaseChanged {
        project_id: ProjectId,
        from_phase: ProjectPhase,
        to_phase: ProjectPhase,
        reason: String,
        changed_by: ActorId,
    },
    /// Diagnostic: a schedule's cached trigger no longer matches the current
    /// rule table. Advisory only; never blocks processing.
    RuleMismatch {
        schedule_id: Option<ScheduleId>,
        cached: PhaseTransitionTrigger,
        recomputed: Option<PhaseTransitionTrigger>,
        envelope_id: EnvelopeId,
    },
    /// Diagnostic: a bus subscriber failed while handling an envelope.
    /// Delivery to remaining subscribers continues regardless.
    SubscriberError {
        failed_envelope_id: EnvelopeId,
        event_type: String,
        message: String,
    },
}

impl EnvelopePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EnvelopePayload::ScheduleCreated { .. } => envelope_types::SCHEDULE_CREATED,
            EnvelopePayload::ScheduleUpdated { .. } => envelope_types::SCHEDULE_UPDATED,
            EnvelopePayload::ScheduleCompleted { .. } => envelope_types::SCHEDULE_COMPLETED,
            EnvelopePayload::ScheduleSyncRequested { .. } => {
                envelope_types::SCHEDULE_SYNC_REQUESTED
            }
            EnvelopePayload::PhaseTransitionCompleted { .. } => {
                envelope_types::PHASE_TRANSITION_COMPLETED
            }
            EnvelopePayload::SyncError { .. } => envelope_types::SYNC_ERROR,
            EnvelopePayload::SyncNoOp { .. } => envelope_types::SYNC_NO_OP,
            EnvelopePayload::ProjectPhaseChanged { .. } => envelope_types::PROJECT_PHASE_CHANGED,
            EnvelopePayload::RuleMismatch { .. } => envelope_types::RULE_MISMATCH,
            EnvelopePayload::SubscriberError { .. } => envelope_types::SUBSCRIBER_ERROR,
        }
    }
}

/// A single published event instance. Transient: nothing retains it past
/// delivery except the deduplicator, which keeps only the id.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    pub schema_version: SchemaVersion,
    pub id: EnvelopeId,
    pub event_type: String,
    pub source: String,
    pub payload: EnvelopePayload,
    pub timestamp: WallTimeMs,
}

impl Envelope {
    pub fn v1(
        id: EnvelopeId,
        source: impl Into<String>,
        payload: EnvelopePayload,
        timestamp: WallTimeMs,
    ) -> Result<Self, ContractViolation> {
        let envelope = Self {
            schema_version: ENVELOPE_CONTRACT_VERSION,
            id,
            event_type: payload.kind().to_string(),
            source: source.into(),
            payload,
            timestamp,
        };
        envelope.validate()?;
        Ok(envelope)
    }
}

impl Validate for Envelope {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != ENVELOPE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "envelope.schema_version",
                reason: "must match ENVELOPE_CONTRACT_VERSION",
            });
        }
        self.id.validate()?;
        validate_text("envelope.event_type", &self.event_type, 64)?;
        if self.event_type != self.payload.kind() {
            return Err(ContractViolation::InvalidValue {
                field: "envelope.event_type",
                reason: "must match payload kind",
            });
        }
        validate_token("envelope.source", &self.source, 64)?;
        if self.timestamp.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "envelope.timestamp",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Seam between envelope producers (the stores, the coordinator) and the
/// delivery mechanism. The event bus implements this; tests substitute a
/// recording sink.
pub trait EnvelopeSink {
    fn publish(&self, envelope: Envelope) -> Result<(), ContractViolation>;
}

#![forbid(unsafe_code)]

use crate::project::{ProjectId, ProjectPhase};
use crate::{validate_text, validate_token, ContractViolation, SchemaVersion, Validate, WallTimeMs};

pub const SCHEDULE_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct ScheduleId(String);

impl ScheduleId {
    pub fn new(value: impl Into<String>) -> Result<Self, ContractViolation> {
        let value = value.into();
        validate_token("schedule_id", &value, 64)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Version of the rule table a cached trigger was computed against.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct RuleVersion(pub u32);

/// Fixed ordinal position of a buildup-project meeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum MeetingSequence {
    PreMeeting,
    Guide1,
    Guide2,
    Guide3,
    Guide4,
    Guide5,
    Closing,
}

impl MeetingSequence {
    pub const ALL: [MeetingSequence; 7] = [
        MeetingSequence::PreMeeting,
        MeetingSequence::Guide1,
        MeetingSequence::Guide2,
        MeetingSequence::Guide3,
        MeetingSequence::Guide4,
        MeetingSequence::Guide5,
        MeetingSequence::Closing,
    ];

    pub fn ordinal(self) -> u8 {
        match self {
            MeetingSequence::PreMeeting => 0,
            MeetingSequence::Guide1 => 1,
            MeetingSequence::Guide2 => 2,
            MeetingSequence::Guide3 => 3,
            MeetingSequence::Guide4 => 4,
            MeetingSequence::Guide5 => 5,
            MeetingSequence::Closing => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MeetingSequence::PreMeeting => "pre_meeting",
            MeetingSequence::Guide1 => "guide_1",
            MeetingSequence::Guide2 => "guide_2",
            MeetingSequence::Guide3 => "guide_3",
            MeetingSequence::Guide4 => "guide_4",
            MeetingSequence::Guide5 => "guide_5",
            MeetingSequence::Closing => "closing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ScheduleStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
    Postponed,
}

impl ScheduleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScheduleStatus::Completed | ScheduleStatus::Cancelled)
    }

    /// Statuses from which the meeting can still be held. Postponed schedules
    /// are parked: they must be rescheduled before they can complete, so no
    /// trigger ever fires from them.
    pub fn is_active(self) -> bool {
        matches!(self, ScheduleStatus::Scheduled | ScheduleStatus::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleStatus::Scheduled => "scheduled",
            ScheduleStatus::InProgress => "in_progress",
            ScheduleStatus::Completed => "completed",
            ScheduleStatus::Cancelled => "cancelled",
            ScheduleStatus::Postponed => "postponed",
        }
    }

    /// Status lifecycle: scheduled -> {in_progress|cancelled|postponed},
    /// in_progress -> {completed|cancelled|postponed}, postponed -> scheduled.
    /// Completed and cancelled are terminal.
    pub fn can_transition_to(self, to: ScheduleStatus) -> bool {
        match self {
            ScheduleStatus::Scheduled => matches!(
                to,
                ScheduleStatus::InProgress | ScheduleStatus::Cancelled | ScheduleStatus::Postponed
            ),
            ScheduleStatus::InProgress => matches!(
                to,
                ScheduleStatus::Completed | ScheduleStatus::Cancelled | ScheduleStatus::Postponed
            ),
            ScheduleStatus::Postponed => matches!(to, ScheduleStatus::Scheduled),
            ScheduleStatus::Completed | ScheduleStatus::Cancelled => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ScheduleKind {
    Buildup,
    General,
}

/// Phase move implied by a meeting sequence, computed from the rule table at
/// schedule-creation time and cached on the entity for audit and replay. The
/// cached value is immutable; re-deriving it from the same rule-table version
/// must produce the same trigger.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PhaseTransitionTrigger {
    pub from_phase: ProjectPhase,
    pub to_phase: ProjectPhase,
    pub automatic: bool,
    pub reason: String,
    pub rule_version: RuleVersion,
}

impl Validate for PhaseTransitionTrigger {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_text("phase_transition_trigger.reason", &self.reason, 256)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Schedule {
    pub schema_version: SchemaVersion,
    pub id: ScheduleId,
    pub kind: ScheduleKind,
    pub title: String,
    pub project_id: Option<ProjectId>,
    pub meeting_sequence: Option<MeetingSequence>,
    pub status: ScheduleStatus,
    pub start_at: WallTimeMs,
    pub end_at: WallTimeMs,
    pub phase_transition_trigger: Option<PhaseTransitionTrigger>,
}

impl Validate for Schedule {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != SCHEDULE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "schedule.schema_version",
                reason: "must match SCHEDULE_CONTRACT_VERSION",
            });
        }
        validate_text("schedule.title", &self.title, 192)?;
        if self.start_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "schedule.start_at",
                reason: "must be > 0",
            });
        }
        if self.end_at.0 < self.start_at.0 {
            return Err(ContractViolation::InvalidValue {
                field: "schedule.end_at",
                reason: "must be >= start_at",
            });
        }
        if self.kind == ScheduleKind::Buildup {
            if self.project_id.is_none() {
                return Err(ContractViolation::InvalidValue {
                    field: "schedule.project_id",
                    reason: "required for buildup schedules",
                });
            }
            if self.meeting_sequence.is_none() {
                return Err(ContractViolation::InvalidValue {
                    field: "schedule.meeting_sequence",
                    reason: "required for buildup schedules",
                });
            }
        }
        if let Some(trigger) = &self.phase_transition_trigger {
            trigger.validate()?;
        }
        Ok(())
    }
}

/// Input for `ScheduleStore::create`. Field-level problems are collected and
/// reported together by the store, so `Validate` is intentionally not
/// implemented here.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleCreateInput {
    pub kind: ScheduleKind,
    pub title: String,
    pub project_id: Option<ProjectId>,
    pub meeting_sequence: Option<MeetingSequence>,
    pub start_at: WallTimeMs,
    pub end_at: WallTimeMs,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchedulePatch {
    pub title: Option<String>,
    pub status: Option<ScheduleStatus>,
    pub start_at: Option<WallTimeMs>,
    pub end_at: Option<WallTimeMs>,
}

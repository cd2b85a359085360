#![forbid(unsafe_code)]

use crate::envelope::EnvelopeId;
use crate::{validate_text, validate_token, ContractViolation, SchemaVersion, Validate, WallTimeMs};

pub const PROJECT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(value: impl Into<String>) -> Result<Self, ContractViolation> {
        let value = value.into();
        validate_token("project_id", &value, 64)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(value: impl Into<String>) -> Result<Self, ContractViolation> {
        let value = value.into();
        validate_token("actor_id", &value, 64)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Fixed seven-stage project lifecycle, strictly ordered by `rank`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum ProjectPhase {
    ContractPending,
    ContractSigned,
    Planning,
    Design,
    Execution,
    Review,
    Completed,
}

impl ProjectPhase {
    pub fn rank(self) -> u8 {
        match self {
            ProjectPhase::ContractPending => 0,
            ProjectPhase::ContractSigned => 1,
            ProjectPhase::Planning => 2,
            ProjectPhase::Design => 3,
            ProjectPhase::Execution => 4,
            ProjectPhase::Review => 5,
            ProjectPhase::Completed => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProjectPhase::ContractPending => "contract_pending",
            ProjectPhase::ContractSigned => "contract_signed",
            ProjectPhase::Planning => "planning",
            ProjectPhase::Design => "design",
            ProjectPhase::Execution => "execution",
            ProjectPhase::Review => "review",
            ProjectPhase::Completed => "completed",
        }
    }
}

/// One append-only phase history row. `envelope_id` is the durable
/// idempotency key: a transition is applied at most once per envelope id.
/// Seed entries written at registration carry no envelope id.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PhaseHistoryEntry {
    pub phase: ProjectPhase,
    pub at: WallTimeMs,
    pub reason: String,
    pub changed_by: ActorId,
    pub envelope_id: Option<EnvelopeId>,
}

impl PhaseHistoryEntry {
    pub fn v1(
        phase: ProjectPhase,
        at: WallTimeMs,
        reason: String,
        changed_by: ActorId,
        envelope_id: Option<EnvelopeId>,
    ) -> Result<Self, ContractViolation> {
        let entry = Self {
            phase,
            at,
            reason,
            changed_by,
            envelope_id,
        };
        entry.validate()?;
        Ok(entry)
    }
}

impl Validate for PhaseHistoryEntry {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_text("phase_history_entry.reason", &self.reason, 256)?;
        if let Some(envelope_id) = &self.envelope_id {
            envelope_id.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Project {
    pub schema_version: SchemaVersion,
    pub id: ProjectId,
    pub phase: ProjectPhase,
    pub phase_history: Vec<PhaseHistoryEntry>,
}

impl Project {
    pub fn v1(
        id: ProjectId,
        phase: ProjectPhase,
        phase_history: Vec<PhaseHistoryEntry>,
    ) -> Result<Self, ContractViolation> {
        let project = Self {
            schema_version: PROJECT_CONTRACT_VERSION,
            id,
            phase,
            phase_history,
        };
        project.validate()?;
        Ok(project)
    }
}

impl Validate for Project {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PROJECT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "project.schema_version",
                reason: "must match PROJECT_CONTRACT_VERSION",
            });
        }
        if self.phase_history.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "project.phase_history",
                reason: "must contain at least the registration entry",
            });
        }
        for entry in &self.phase_history {
            entry.validate()?;
        }
        if let Some(last) = self.phase_history.last() {
            if last.phase != self.phase {
                return Err(ContractViolation::InvalidValue {
                    field: "project.phase",
                    reason: "must equal the phase of the latest history entry",
                });
            }
        }
        Ok(())
    }
}

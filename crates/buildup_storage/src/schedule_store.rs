#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use buildup_contracts::envelope::{Envelope, EnvelopeId, EnvelopePayload, EnvelopeSink};
use buildup_contracts::project::ProjectId;
use buildup_contracts::schedule::{
    MeetingSequence, Schedule, ScheduleCreateInput, ScheduleId, ScheduleKind, SchedulePatch,
    ScheduleStatus, SCHEDULE_CONTRACT_VERSION,
};
use buildup_contracts::{validate_text, ContractViolation, Validate, WallTimeMs};
use buildup_rules::PhaseRuleTable;

use crate::error::StoreError;

pub const SCHEDULE_STORE_SOURCE: &str = "schedule_store";

const SCHEDULE_ID_PREFIX: &str = "sch_";

#[derive(Debug)]
struct ScheduleState {
    schedules: BTreeMap<ScheduleId, Schedule>,
    project_index: BTreeMap<ProjectId, Vec<ScheduleId>>,
    rules: PhaseRuleTable,
    next_schedule_seq: u64,
    next_envelope_seq: u64,
}

impl ScheduleState {
    fn allocate_schedule_id(&mut self) -> Result<ScheduleId, ContractViolation> {
        loop {
            self.next_schedule_seq += 1;
            let candidate =
                ScheduleId::new(format!("{}{:06}", SCHEDULE_ID_PREFIX, self.next_schedule_seq))?;
            if !self.schedules.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
    }

    fn allocate_envelope_id(&mut self, now: WallTimeMs) -> Result<EnvelopeId, ContractViolation> {
        self.next_envelope_seq += 1;
        EnvelopeId::new(format!(
            "{}:evt_{}_{:04}",
            SCHEDULE_STORE_SOURCE, now.0, self.next_envelope_seq
        ))
    }

    fn index_project(&mut self, schedule: &Schedule) {
        if let Some(project_id) = &schedule.project_id {
            self.project_index
                .entry(project_id.clone())
                .or_default()
                .push(schedule.id.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScheduleFilter {
    pub project_id: Option<ProjectId>,
    pub kind: Option<ScheduleKind>,
    pub status: Option<ScheduleStatus>,
    pub meeting_sequence: Option<MeetingSequence>,
}

impl ScheduleFilter {
    fn matches(&self, schedule: &Schedule) -> bool {
        if let Some(project_id) = &self.project_id {
            if schedule.project_id.as_ref() != Some(project_id) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if schedule.kind != kind {
                return false;
            }
        }
        if let Some(status) = self.status {
            if schedule.status != status {
                return false;
            }
        }
        if let Some(meeting) = self.meeting_sequence {
            if schedule.meeting_sequence != Some(meeting) {
                return false;
            }
        }
        true
    }
}

/// Single source of truth for Schedule entities. A cheap cloneable handle:
/// bus subscribers hold read access through their own clone. Every operation
/// scopes its state borrow and publishes only after releasing it, so
/// subscribers reached by the emitted envelope can read the store again.
#[derive(Clone)]
pub struct ScheduleStore {
    state: Rc<RefCell<ScheduleState>>,
    sink: Rc<dyn EnvelopeSink>,
}

impl ScheduleStore {
    pub fn new(rules: PhaseRuleTable, sink: Rc<dyn EnvelopeSink>) -> Self {
        Self {
            state: Rc::new(RefCell::new(ScheduleState {
                schedules: BTreeMap::new(),
                project_index: BTreeMap::new(),
                rules,
                next_schedule_seq: 0,
                next_envelope_seq: 0,
            })),
            sink,
        }
    }

    /// Validates the input (collecting every violated constraint), assigns a
    /// generated id, computes and caches the phase-transition trigger, and
    /// publishes `schedule.created`.
    pub fn create(
        &self,
        input: ScheduleCreateInput,
        now: WallTimeMs,
    ) -> Result<Schedule, StoreError> {
        let violations = collect_create_violations(&input);
        if !violations.is_empty() {
            return Err(StoreError::Validation { violations });
        }

        let (schedule, envelope) = {
            let mut state = self.state.borrow_mut();
            let id = state.allocate_schedule_id()?;
            let trigger = match (input.kind, input.meeting_sequence) {
                (ScheduleKind::Buildup, Some(meeting)) => state.rules.trigger_for(meeting),
                _ => None,
            };
            let schedule = Schedule {
                schema_version: SCHEDULE_CONTRACT_VERSION,
                id: id.clone(),
                kind: input.kind,
                title: input.title,
                project_id: input.project_id,
                meeting_sequence: input.meeting_sequence,
                status: ScheduleStatus::Scheduled,
                start_at: input.start_at,
                end_at: input.end_at,
                phase_transition_trigger: trigger,
            };
            schedule.validate()?;
            state.schedules.insert(id, schedule.clone());
            state.index_project(&schedule);

            let envelope_id = state.allocate_envelope_id(now)?;
            let envelope = Envelope::v1(
                envelope_id,
                SCHEDULE_STORE_SOURCE,
                EnvelopePayload::ScheduleCreated {
                    schedule: schedule.clone(),
                },
                now,
            )?;
            (schedule, envelope)
        };
        self.sink.publish(envelope)?;
        Ok(schedule)
    }

    /// Applies a patch. Status changes must follow the schedule lifecycle;
    /// publishes `schedule.updated`.
    pub fn update(
        &self,
        id: &ScheduleId,
        patch: SchedulePatch,
        now: WallTimeMs,
    ) -> Result<Schedule, StoreError> {
        let (schedule, envelope) = {
            let mut state = self.state.borrow_mut();
            let current = match state.schedules.get(id) {
                Some(schedule) => schedule.clone(),
                None => {
                    return Err(StoreError::NotFound {
                        entity: "schedule",
                        key: id.as_str().to_string(),
                    })
                }
            };

            let mut updated = current.clone();
            if let Some(title) = patch.title {
                updated.title = title;
            }
            if let Some(start_at) = patch.start_at {
                updated.start_at = start_at;
            }
            if let Some(end_at) = patch.end_at {
                updated.end_at = end_at;
            }
            if let Some(status) = patch.status {
                if status != current.status && !current.status.can_transition_to(status) {
                    return Err(StoreError::InvalidStatusTransition {
                        schedule_id: id.clone(),
                        from: current.status,
                    });
                }
                updated.status = status;
            }
            updated.validate()?;
            state.schedules.insert(id.clone(), updated.clone());

            let envelope_id = state.allocate_envelope_id(now)?;
            let envelope = Envelope::v1(
                envelope_id,
                SCHEDULE_STORE_SOURCE,
                EnvelopePayload::ScheduleUpdated {
                    schedule: updated.clone(),
                },
                now,
            )?;
            (updated, envelope)
        };
        self.sink.publish(envelope)?;
        Ok(schedule)
    }

    /// Completion is a distinct operation (and envelope type) because phase
    /// logic keys on it. Only active schedules complete: terminal ones are
    /// done, and a postponed one must be rescheduled first.
    pub fn mark_completed(
        &self,
        id: &ScheduleId,
        now: WallTimeMs,
    ) -> Result<Schedule, StoreError> {
        let (schedule, envelope) = {
            let mut state = self.state.borrow_mut();
            let current = match state.schedules.get_mut(id) {
                Some(schedule) => schedule,
                None => {
                    return Err(StoreError::NotFound {
                        entity: "schedule",
                        key: id.as_str().to_string(),
                    })
                }
            };
            if !current.status.is_active() {
                return Err(StoreError::InvalidStatusTransition {
                    schedule_id: id.clone(),
                    from: current.status,
                });
            }
            current.status = ScheduleStatus::Completed;
            let schedule = current.clone();

            let envelope_id = state.allocate_envelope_id(now)?;
            let envelope = Envelope::v1(
                envelope_id,
                SCHEDULE_STORE_SOURCE,
                EnvelopePayload::ScheduleCompleted {
                    schedule_id: schedule.id.clone(),
                    project_id: schedule.project_id.clone(),
                },
                now,
            )?;
            (schedule, envelope)
        };
        self.sink.publish(envelope)?;
        Ok(schedule)
    }

    pub fn get(&self, id: &ScheduleId) -> Option<Schedule> {
        self.state.borrow().schedules.get(id).cloned()
    }

    /// Pure read, never emits.
    pub fn query(&self, filter: &ScheduleFilter) -> Vec<Schedule> {
        self.state
            .borrow()
            .schedules
            .values()
            .filter(|schedule| filter.matches(schedule))
            .cloned()
            .collect()
    }

    /// Latest active schedule for a (project, meeting) pair; used to resolve
    /// `complete_meeting` sync requests. Postponed schedules are not active.
    pub fn find_by_project_meeting(
        &self,
        project_id: &ProjectId,
        meeting: MeetingSequence,
    ) -> Option<Schedule> {
        let state = self.state.borrow();
        let ids = state.project_index.get(project_id)?;
        ids.iter()
            .rev()
            .filter_map(|id| state.schedules.get(id))
            .find(|schedule| {
                schedule.meeting_sequence == Some(meeting) && schedule.status.is_active()
            })
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().schedules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().schedules.is_empty()
    }

    /// Flat snapshot for a persistence adapter.
    pub fn snapshot(&self) -> Vec<Schedule> {
        self.state.borrow().schedules.values().cloned().collect()
    }

    /// Replaces store contents from a snapshot, rebuilding the project index
    /// and the id-generator watermark. Never emits.
    pub fn restore(&self, rows: Vec<Schedule>) -> Result<(), StoreError> {
        for row in &rows {
            row.validate()?;
        }
        let mut state = self.state.borrow_mut();
        state.schedules.clear();
        state.project_index.clear();
        let mut max_seq = 0u64;
        for row in rows {
            if let Some(seq) = row
                .id
                .as_str()
                .strip_prefix(SCHEDULE_ID_PREFIX)
                .and_then(|suffix| suffix.parse::<u64>().ok())
            {
                max_seq = max_seq.max(seq);
            }
            if state.schedules.insert(row.id.clone(), row.clone()).is_some() {
                return Err(StoreError::DuplicateKey {
                    entity: "schedule",
                    key: row.id.as_str().to_string(),
                });
            }
            state.index_project(&row);
        }
        state.next_schedule_seq = max_seq;
        Ok(())
    }
}

fn collect_create_violations(input: &ScheduleCreateInput) -> Vec<ContractViolation> {
    let mut violations = Vec::new();
    if let Err(violation) = validate_text("schedule.title", &input.title, 192) {
        violations.push(violation);
    }
    if input.start_at.0 == 0 {
        violations.push(ContractViolation::InvalidValue {
            field: "schedule.start_at",
            reason: "must be > 0",
        });
    }
    if input.end_at.0 < input.start_at.0 {
        violations.push(ContractViolation::InvalidValue {
            field: "schedule.end_at",
            reason: "must be >= start_at",
        });
    }
    if input.kind == ScheduleKind::Buildup {
        if input.project_id.is_none() {
            violations.push(ContractViolation::InvalidValue {
                field: "schedule.project_id",
                reason: "required for buildup schedules",
            });
        }
        if input.meeting_sequence.is_none() {
            violations.push(ContractViolation::InvalidValue {
                field: "schedule.meeting_sequence",
                reason: "required for buildup schedules",
            });
        }
    }
    violations
}

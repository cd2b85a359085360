#![forbid(unsafe_code)]

use std::cell::Cell;
use std::rc::Rc;

use buildup_contracts::envelope::{
    envelope_types, Envelope, EnvelopeId, EnvelopePayload, SyncOperation,
};
use buildup_contracts::project::{ActorId, ProjectId};
use buildup_contracts::schedule::{
    MeetingSequence, PhaseTransitionTrigger, Schedule, ScheduleCreateInput, ScheduleId,
    ScheduleKind,
};
use buildup_contracts::{ContractViolation, ReasonCodeId, WallTimeMs};
use buildup_rules::PhaseRuleTable;
use buildup_storage::{ProjectStore, ScheduleStore, StoreError};

use crate::bus::{EventBus, SubscriberFailure, Subscription};
use crate::dedup::Deduplicator;

pub const COORDINATOR_SOURCE: &str = "sync_coordinator";

/// Duration assumed for meetings created on behalf of a sync request, which
/// carries no calendar times of its own.
const DEFAULT_MEETING_DURATION_MS: u64 = 3_600_000;

/// Outcome codes carried on coordinator-emitted envelopes, namespaced under
/// 0x5359 ("SY").
pub mod reason_codes {
    use buildup_contracts::ReasonCodeId;

    pub const TRANSITION_APPLIED: ReasonCodeId = ReasonCodeId(0x5359_0001);
    pub const TRANSITION_ALREADY_APPLIED: ReasonCodeId = ReasonCodeId(0x5359_0002);
    pub const NO_RULE_FOR_MEETING: ReasonCodeId = ReasonCodeId(0x5359_0003);
    pub const RULE_NOT_AUTOMATIC: ReasonCodeId = ReasonCodeId(0x5359_0004);
    pub const NOT_A_BUILDUP_SCHEDULE: ReasonCodeId = ReasonCodeId(0x5359_0005);
    pub const MALFORMED_SYNC_REQUEST: ReasonCodeId = ReasonCodeId(0x5359_0006);
    pub const PROJECT_NOT_FOUND: ReasonCodeId = ReasonCodeId(0x5359_0007);
    pub const MEETING_NOT_FOUND: ReasonCodeId = ReasonCodeId(0x5359_0008);
    pub const STORE_FAILURE: ReasonCodeId = ReasonCodeId(0x5359_0009);
    pub const CATCH_UP_NOT_NEEDED: ReasonCodeId = ReasonCodeId(0x5359_000A);
}

struct CoordinatorInner {
    schedules: ScheduleStore,
    projects: ProjectStore,
    rules: PhaseRuleTable,
    dedup: Rc<Deduplicator>,
    bus: EventBus,
    next_envelope_seq: Cell<u64>,
}

/// Drives project phases from schedule events. Purely reactive: all input
/// arrives as envelopes, all output leaves as envelopes, and each incoming
/// envelope is handled in one synchronous pass with the outcome recorded as
/// exactly one `phase_transition.completed`, `sync.no_op`, or `sync.error`.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Rc<CoordinatorInner>,
}

impl SyncCoordinator {
    pub fn new(
        schedules: ScheduleStore,
        projects: ProjectStore,
        rules: PhaseRuleTable,
        dedup: Rc<Deduplicator>,
        bus: EventBus,
    ) -> Self {
        Self {
            inner: Rc::new(CoordinatorInner {
                schedules,
                projects,
                rules,
                dedup,
                bus,
                next_envelope_seq: Cell::new(0),
            }),
        }
    }

    /// Subscribes the coordinator to the three envelope types it reacts to.
    pub fn attach(&self) -> Vec<Subscription> {
        let mut subscriptions = Vec::with_capacity(3);
        for event_type in [
            envelope_types::SCHEDULE_CREATED,
            envelope_types::SCHEDULE_SYNC_REQUESTED,
            envelope_types::SCHEDULE_COMPLETED,
        ] {
            let coordinator = self.clone();
            subscriptions.push(self.inner.bus.subscribe(event_type, move |envelope| {
                coordinator.handle(envelope)
            }));
        }
        subscriptions
    }

    fn handle(&self, envelope: &Envelope) -> Result<(), SubscriberFailure> {
        // duplicates within the retention window are discarded silently
        if !self.inner.dedup.should_process(&envelope.id, envelope.timestamp) {
            return Ok(());
        }
        let outcome = match &envelope.payload {
            EnvelopePayload::ScheduleCreated { schedule } => {
                self.on_schedule_created(envelope, schedule)
            }
            EnvelopePayload::ScheduleSyncRequested {
                project_id,
                meeting,
                operation,
            } => self.on_sync_requested(envelope, project_id.as_ref(), *meeting, *operation),
            EnvelopePayload::ScheduleCompleted {
                schedule_id,
                project_id,
            } => self.on_schedule_completed(envelope, schedule_id, project_id.as_ref()),
            _ => Ok(()),
        };
        outcome.map_err(|violation| {
            SubscriberFailure::new(format!("coordinator emit failed: {:?}", violation))
        })
    }

    /// A new schedule either advances its project now (automatic rule) or is
    /// recorded as a no-op with the reason.
    fn on_schedule_created(
        &self,
        envelope: &Envelope,
        schedule: &Schedule,
    ) -> Result<(), ContractViolation> {
        let (project_id, meeting) = match (&schedule.project_id, schedule.meeting_sequence) {
            (Some(project_id), Some(meeting)) if schedule.kind == ScheduleKind::Buildup => {
                (project_id.clone(), meeting)
            }
            _ => {
                return self.emit_no_op(
                    envelope,
                    "not a buildup schedule",
                    reason_codes::NOT_A_BUILDUP_SCHEDULE,
                );
            }
        };

        let trigger = match self.resolve_trigger(envelope, schedule, meeting)? {
            Some(trigger) => trigger,
            None => {
                return self.emit_no_op(
                    envelope,
                    "no phase rule for meeting sequence",
                    reason_codes::NO_RULE_FOR_MEETING,
                );
            }
        };
        if !trigger.automatic {
            return self.emit_no_op(
                envelope,
                "phase rule requires operator confirmation",
                reason_codes::RULE_NOT_AUTOMATIC,
            );
        }

        self.apply_and_report(
            envelope,
            &project_id,
            &trigger,
            Some(schedule.id.clone()),
            "schedule.created",
        )
    }

    /// `create_meeting` delegates to the schedule store; the resulting
    /// `schedule.created` envelope drives phase logic under its own id.
    /// `complete_meeting` marks the active schedule completed, which likewise
    /// continues via `schedule.completed`.
    fn on_sync_requested(
        &self,
        envelope: &Envelope,
        project_id: Option<&ProjectId>,
        meeting: Option<MeetingSequence>,
        operation: SyncOperation,
    ) -> Result<(), ContractViolation> {
        let (project_id, meeting) = match (project_id, meeting) {
            (Some(project_id), Some(meeting)) => (project_id.clone(), meeting),
            _ => {
                return self.emit_error(
                    envelope,
                    operation.as_str(),
                    "request is missing project_id or meeting",
                    None,
                    reason_codes::MALFORMED_SYNC_REQUEST,
                );
            }
        };

        match operation {
            SyncOperation::CreateMeeting => {
                let input = ScheduleCreateInput {
                    kind: ScheduleKind::Buildup,
                    title: format!("{} meeting", meeting.as_str()),
                    project_id: Some(project_id.clone()),
                    meeting_sequence: Some(meeting),
                    start_at: envelope.timestamp,
                    end_at: WallTimeMs(envelope.timestamp.0 + DEFAULT_MEETING_DURATION_MS),
                };
                match self.inner.schedules.create(input, envelope.timestamp) {
                    Ok(_) => Ok(()),
                    Err(err) => self.emit_error(
                        envelope,
                        operation.as_str(),
                        &store_error_text(&err),
                        Some(&project_id),
                        reason_codes::STORE_FAILURE,
                    ),
                }
            }
            SyncOperation::CompleteMeeting => {
                let schedule = match self
                    .inner
                    .schedules
                    .find_by_project_meeting(&project_id, meeting)
                {
                    Some(schedule) => schedule,
                    None => {
                        return self.emit_error(
                            envelope,
                            operation.as_str(),
                            "no active schedule for project and meeting",
                            Some(&project_id),
                            reason_codes::MEETING_NOT_FOUND,
                        );
                    }
                };
                match self
                    .inner
                    .schedules
                    .mark_completed(&schedule.id, envelope.timestamp)
                {
                    Ok(_) => Ok(()),
                    Err(err) => self.emit_error(
                        envelope,
                        operation.as_str(),
                        &store_error_text(&err),
                        Some(&project_id),
                        reason_codes::STORE_FAILURE,
                    ),
                }
            }
        }
    }

    /// Completion is a catch-up checkpoint: if creation already advanced the
    /// project, completing the meeting changes nothing; if the creation event
    /// was missed, the transition is applied now under the completion
    /// envelope's id.
    fn on_schedule_completed(
        &self,
        envelope: &Envelope,
        schedule_id: &ScheduleId,
        project_id: Option<&ProjectId>,
    ) -> Result<(), ContractViolation> {
        let project_id = match project_id {
            Some(project_id) => project_id.clone(),
            None => {
                return self.emit_no_op(
                    envelope,
                    "not a buildup schedule",
                    reason_codes::NOT_A_BUILDUP_SCHEDULE,
                );
            }
        };
        let schedule = match self.inner.schedules.get(schedule_id) {
            Some(schedule) => schedule,
            None => {
                return self.emit_error(
                    envelope,
                    "schedule.completed",
                    "completed schedule not found",
                    Some(&project_id),
                    reason_codes::STORE_FAILURE,
                );
            }
        };
        let meeting = match schedule.meeting_sequence {
            Some(meeting) => meeting,
            None => {
                return self.emit_no_op(
                    envelope,
                    "not a buildup schedule",
                    reason_codes::NOT_A_BUILDUP_SCHEDULE,
                );
            }
        };

        let trigger = match self.resolve_trigger(envelope, &schedule, meeting)? {
            Some(trigger) => trigger,
            None => {
                return self.emit_no_op(
                    envelope,
                    "no phase rule for meeting sequence",
                    reason_codes::NO_RULE_FOR_MEETING,
                );
            }
        };
        if !trigger.automatic {
            return self.emit_no_op(
                envelope,
                "phase rule requires operator confirmation",
                reason_codes::RULE_NOT_AUTOMATIC,
            );
        }

        let current = match self.inner.projects.get_phase(&project_id) {
            Ok(phase) => phase,
            Err(_) => {
                return self.emit_error(
                    envelope,
                    "schedule.completed",
                    "project not found",
                    Some(&project_id),
                    reason_codes::PROJECT_NOT_FOUND,
                );
            }
        };
        if current.rank() >= trigger.to_phase.rank() {
            return self.emit_no_op(
                envelope,
                "project already at or past the target phase",
                reason_codes::CATCH_UP_NOT_NEEDED,
            );
        }

        self.apply_and_report(
            envelope,
            &project_id,
            &trigger,
            Some(schedule.id.clone()),
            "schedule.completed",
        )
    }

    /// Cached trigger first, with a defensive re-check against the live rule
    /// table. A mismatch is advisory: it is reported as `rule.mismatch` and
    /// the recomputed rule wins.
    fn resolve_trigger(
        &self,
        envelope: &Envelope,
        schedule: &Schedule,
        meeting: MeetingSequence,
    ) -> Result<Option<PhaseTransitionTrigger>, ContractViolation> {
        match &schedule.phase_transition_trigger {
            Some(cached) if self.inner.rules.matches_cached(cached, meeting) => {
                Ok(Some(cached.clone()))
            }
            Some(cached) => {
                let recomputed = self.inner.rules.trigger_for(meeting);
                self.emit(
                    envelope.timestamp,
                    EnvelopePayload::RuleMismatch {
                        schedule_id: Some(schedule.id.clone()),
                        cached: cached.clone(),
                        recomputed: recomputed.clone(),
                        envelope_id: envelope.id.clone(),
                    },
                )?;
                Ok(recomputed)
            }
            None => Ok(self.inner.rules.trigger_for(meeting)),
        }
    }

    fn apply_and_report(
        &self,
        envelope: &Envelope,
        project_id: &ProjectId,
        trigger: &PhaseTransitionTrigger,
        schedule_id: Option<ScheduleId>,
        operation: &str,
    ) -> Result<(), ContractViolation> {
        let actor = ActorId::new(COORDINATOR_SOURCE)?;
        match self.inner.projects.apply_transition(
            project_id,
            trigger.to_phase,
            &trigger.reason,
            actor,
            envelope.id.clone(),
            envelope.timestamp,
        ) {
            Ok(applied) => self.emit(
                envelope.timestamp,
                EnvelopePayload::PhaseTransitionCompleted {
                    project_id: project_id.clone(),
                    from_phase: applied.from_phase,
                    to_phase: applied.to_phase,
                    schedule_id,
                    envelope_id: envelope.id.clone(),
                    already_applied: false,
                    reason_code: reason_codes::TRANSITION_APPLIED,
                },
            ),
            // durable guard: the envelope already moved this project once
            Err(StoreError::DuplicateTransition { .. }) => {
                let from_phase = self
                    .inner
                    .projects
                    .get_phase(project_id)
                    .unwrap_or(trigger.to_phase);
                self.emit(
                    envelope.timestamp,
                    EnvelopePayload::PhaseTransitionCompleted {
                        project_id: project_id.clone(),
                        from_phase,
                        to_phase: trigger.to_phase,
                        schedule_id,
                        envelope_id: envelope.id.clone(),
                        already_applied: true,
                        reason_code: reason_codes::TRANSITION_ALREADY_APPLIED,
                    },
                )
            }
            Err(StoreError::NotFound { .. }) => self.emit_error(
                envelope,
                operation,
                "project not found",
                Some(project_id),
                reason_codes::PROJECT_NOT_FOUND,
            ),
            Err(err) => self.emit_error(
                envelope,
                operation,
                &store_error_text(&err),
                Some(project_id),
                reason_codes::STORE_FAILURE,
            ),
        }
    }

    fn emit_no_op(
        &self,
        envelope: &Envelope,
        reason: &str,
        reason_code: ReasonCodeId,
    ) -> Result<(), ContractViolation> {
        self.emit(
            envelope.timestamp,
            EnvelopePayload::SyncNoOp {
                envelope_id: envelope.id.clone(),
                reason: reason.to_string(),
                reason_code,
            },
        )
    }

    fn emit_error(
        &self,
        envelope: &Envelope,
        operation: &str,
        error: &str,
        project_id: Option<&ProjectId>,
        reason_code: ReasonCodeId,
    ) -> Result<(), ContractViolation> {
        self.emit(
            envelope.timestamp,
            EnvelopePayload::SyncError {
                operation: operation.to_string(),
                error: error.to_string(),
                envelope_id: envelope.id.clone(),
                project_id: project_id.cloned(),
                reason_code,
            },
        )
    }

    fn emit(&self, now: WallTimeMs, payload: EnvelopePayload) -> Result<(), ContractViolation> {
        let seq = self.inner.next_envelope_seq.get() + 1;
        self.inner.next_envelope_seq.set(seq);
        let id = EnvelopeId::new(format!(
            "{}:evt_{}_{:04}",
            COORDINATOR_SOURCE, now.0, seq
        ))?;
        let envelope = Envelope::v1(id, COORDINATOR_SOURCE, payload, now)?;
        self.inner.bus.publish(envelope)
    }
}

fn store_error_text(err: &StoreError) -> String {
    match err {
        StoreError::Validation { violations } => format!("validation failed: {:?}", violations),
        StoreError::NotFound { entity, key } => format!("{} not found: {}", entity, key),
        StoreError::DuplicateKey { entity, key } => format!("duplicate {}: {}", entity, key),
        StoreError::InvalidStatusTransition { schedule_id, from } => format!(
            "schedule {} cannot leave status {}",
            schedule_id.as_str(),
            from.as_str()
        ),
        StoreError::DuplicateTransition {
            project_id,
            envelope_id,
        } => format!(
            "transition already applied for project {} by envelope {}",
            project_id.as_str(),
            envelope_id.as_str()
        ),
        StoreError::Contract(violation) => format!("contract violation: {:?}", violation),
        StoreError::Adapter { message } => format!("adapter failure: {}", message),
    }
}

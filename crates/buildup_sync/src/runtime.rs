#![forbid(unsafe_code)]

use std::rc::Rc;

use buildup_contracts::envelope::{Envelope, EnvelopeId};
use buildup_contracts::project::{ActorId, Project, ProjectId, ProjectPhase};
use buildup_contracts::schedule::{
    Schedule, ScheduleCreateInput, ScheduleId, SchedulePatch,
};
use buildup_contracts::{validate_text, ContractViolation, WallTimeMs};
use buildup_rules::PhaseRuleTable;
use buildup_storage::{
    AppliedTransition, ProjectStore, ScheduleFilter, ScheduleStore, StoreError,
};

use crate::bus::{EventBus, Subscription};
use crate::coordinator::SyncCoordinator;
use crate::dedup::{DedupConfig, Deduplicator};

/// Composition root: one bus, both stores publishing into it, and the
/// coordinator attached. Callers mutate state only through this surface (or
/// by publishing request envelopes); every mutation's downstream effects
/// have run to completion by the time a method returns.
pub struct SyncRuntime {
    bus: EventBus,
    schedules: ScheduleStore,
    projects: ProjectStore,
    subscriptions: Vec<Subscription>,
}

impl SyncRuntime {
    pub fn new() -> Self {
        Self::with_config(DedupConfig::default(), PhaseRuleTable::default_v1())
    }

    pub fn with_config(dedup: DedupConfig, rules: PhaseRuleTable) -> Self {
        let bus = EventBus::new();
        let sink: Rc<EventBus> = Rc::new(bus.clone());
        let schedules = ScheduleStore::new(rules.clone(), sink.clone());
        let projects = ProjectStore::new(sink);
        let coordinator = SyncCoordinator::new(
            schedules.clone(),
            projects.clone(),
            rules,
            Rc::new(Deduplicator::new(dedup)),
            bus.clone(),
        );
        let subscriptions = coordinator.attach();
        Self {
            bus,
            schedules,
            projects,
            subscriptions,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Entry point for boundary producers (UI actions, background jobs):
    /// hands a pre-built envelope to the bus.
    pub fn publish(&self, envelope: Envelope) -> Result<(), ContractViolation> {
        self.bus.publish(envelope)
    }

    pub fn create_schedule(
        &self,
        input: ScheduleCreateInput,
        now: WallTimeMs,
    ) -> Result<Schedule, StoreError> {
        self.schedules.create(input, now)
    }

    pub fn update_schedule(
        &self,
        id: &ScheduleId,
        patch: SchedulePatch,
        now: WallTimeMs,
    ) -> Result<Schedule, StoreError> {
        self.schedules.update(id, patch, now)
    }

    pub fn mark_schedule_completed(
        &self,
        id: &ScheduleId,
        now: WallTimeMs,
    ) -> Result<Schedule, StoreError> {
        self.schedules.mark_completed(id, now)
    }

    pub fn get_schedule(&self, id: &ScheduleId) -> Option<Schedule> {
        self.schedules.get(id)
    }

    pub fn query_schedules(&self, filter: &ScheduleFilter) -> Vec<Schedule> {
        self.schedules.query(filter)
    }

    pub fn register_project(
        &self,
        project_id: ProjectId,
        initial_phase: ProjectPhase,
        changed_by: ActorId,
        now: WallTimeMs,
    ) -> Result<Project, StoreError> {
        self.projects.register(project_id, initial_phase, changed_by, now)
    }

    pub fn get_project(&self, project_id: &ProjectId) -> Option<Project> {
        self.projects.get(project_id)
    }

    pub fn project_phase(&self, project_id: &ProjectId) -> Result<ProjectPhase, StoreError> {
        self.projects.get_phase(project_id)
    }

    /// Operator escape hatch. Any phase move is permitted, including
    /// backward ones, but a non-empty reason and an explicit actor are
    /// required, and the move lands in phase history like any other.
    pub fn manual_phase_override(
        &self,
        project_id: &ProjectId,
        to_phase: ProjectPhase,
        reason: &str,
        changed_by: ActorId,
        envelope_id: EnvelopeId,
        now: WallTimeMs,
    ) -> Result<AppliedTransition, StoreError> {
        validate_text("manual_override.reason", reason, 256)?;
        self.projects
            .apply_transition(project_id, to_phase, reason, changed_by, envelope_id, now)
    }

    pub fn snapshot_schedules(&self) -> Vec<Schedule> {
        self.schedules.snapshot()
    }

    pub fn restore_schedules(&self, rows: Vec<Schedule>) -> Result<(), StoreError> {
        self.schedules.restore(rows)
    }

    pub fn snapshot_projects(&self) -> Vec<Project> {
        self.projects.snapshot()
    }

    pub fn restore_projects(&self, rows: Vec<Project>) -> Result<(), StoreError> {
        self.projects.restore(rows)
    }

    /// Detaches the coordinator; remaining handles stay usable as plain
    /// stores.
    pub fn shutdown(self) {
        for subscription in self.subscriptions {
            self.bus.unsubscribe(subscription);
        }
    }
}

impl Default for SyncRuntime {
    fn default() -> Self {
        Self::new()
    }
}

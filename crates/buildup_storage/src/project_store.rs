#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use buildup_contracts::envelope::{Envelope, EnvelopeId, EnvelopePayload, EnvelopeSink};
use buildup_contracts::project::{
    ActorId, PhaseHistoryEntry, Project, ProjectId, ProjectPhase,
};
use buildup_contracts::{ContractViolation, Validate, WallTimeMs};

use crate::error::StoreError;

pub const PROJECT_STORE_SOURCE: &str = "project_store";

#[derive(Debug)]
struct ProjectState {
    projects: BTreeMap<ProjectId, Project>,
    /// Durable idempotency guard: every (project, envelope) pair that ever
    /// produced a phase transition. Survives restore because it is rebuilt
    /// from phase history.
    applied_index: BTreeSet<(ProjectId, EnvelopeId)>,
    next_envelope_seq: u64,
}

impl ProjectState {
    fn allocate_envelope_id(&mut self, now: WallTimeMs) -> Result<EnvelopeId, ContractViolation> {
        self.next_envelope_seq += 1;
        EnvelopeId::new(format!(
            "{}:evt_{}_{:04}",
            PROJECT_STORE_SOURCE, now.0, self.next_envelope_seq
        ))
    }
}

/// Result of a successfully applied phase transition.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedTransition {
    pub project_id: ProjectId,
    pub from_phase: ProjectPhase,
    pub to_phase: ProjectPhase,
}

/// Single source of truth for Project entities and their append-only phase
/// history. Same handle shape as [`crate::ScheduleStore`]: borrows are
/// scoped, envelopes leave only after the borrow is released.
#[derive(Clone)]
pub struct ProjectStore {
    state: Rc<RefCell<ProjectState>>,
    sink: Rc<dyn EnvelopeSink>,
}

impl ProjectStore {
    pub fn new(sink: Rc<dyn EnvelopeSink>) -> Self {
        Self {
            state: Rc::new(RefCell::new(ProjectState {
                projects: BTreeMap::new(),
                applied_index: BTreeSet::new(),
                next_envelope_seq: 0,
            })),
            sink,
        }
    }

    /// Registers a project with a seed history entry. Registration is not a
    /// phase transition, so it carries no envelope id and emits nothing.
    pub fn register(
        &self,
        project_id: ProjectId,
        initial_phase: ProjectPhase,
        changed_by: ActorId,
        now: WallTimeMs,
    ) -> Result<Project, StoreError> {
        let mut state = self.state.borrow_mut();
        if state.projects.contains_key(&project_id) {
            return Err(StoreError::DuplicateKey {
                entity: "project",
                key: project_id.as_str().to_string(),
            });
        }
        let seed = PhaseHistoryEntry::v1(
            initial_phase,
            now,
            "registered".to_string(),
            changed_by,
            None,
        )?;
        let project = Project::v1(project_id.clone(), initial_phase, vec![seed])?;
        state.projects.insert(project_id, project.clone());
        Ok(project)
    }

    pub fn get(&self, project_id: &ProjectId) -> Option<Project> {
        self.state.borrow().projects.get(project_id).cloned()
    }

    pub fn get_phase(&self, project_id: &ProjectId) -> Result<ProjectPhase, StoreError> {
        self.state
            .borrow()
            .projects
            .get(project_id)
            .map(|project| project.phase)
            .ok_or_else(|| StoreError::NotFound {
                entity: "project",
                key: project_id.as_str().to_string(),
            })
    }

    /// True when `envelope_id` already produced a transition on this project.
    pub fn transition_applied(&self, project_id: &ProjectId, envelope_id: &EnvelopeId) -> bool {
        self.state
            .borrow()
            .applied_index
            .contains(&(project_id.clone(), envelope_id.clone()))
    }

    /// Moves a project to `to_phase`, appending a history entry keyed by the
    /// causing envelope. The same envelope id is rejected the second time
    /// with [`StoreError::DuplicateTransition`], no matter how long ago the
    /// first application happened. Backward moves are permitted; the rule
    /// table decides direction, not the store. Publishes
    /// `project.phase_changed`.
    pub fn apply_transition(
        &self,
        project_id: &ProjectId,
        to_phase: ProjectPhase,
        reason: &str,
        changed_by: ActorId,
        envelope_id: EnvelopeId,
        now: WallTimeMs,
    ) -> Result<AppliedTransition, StoreError> {
        let (applied, envelope) = {
            let mut state = self.state.borrow_mut();
            let guard_key = (project_id.clone(), envelope_id.clone());
            if state.applied_index.contains(&guard_key) {
                return Err(StoreError::DuplicateTransition {
                    project_id: project_id.clone(),
                    envelope_id,
                });
            }
            let project = match state.projects.get_mut(project_id) {
                Some(project) => project,
                None => {
                    return Err(StoreError::NotFound {
                        entity: "project",
                        key: project_id.as_str().to_string(),
                    })
                }
            };
            let from_phase = project.phase;
            let entry = PhaseHistoryEntry::v1(
                to_phase,
                now,
                reason.to_string(),
                changed_by.clone(),
                Some(envelope_id.clone()),
            )?;
            project.phase = to_phase;
            project.phase_history.push(entry);
            state.applied_index.insert(guard_key);

            let applied = AppliedTransition {
                project_id: project_id.clone(),
                from_phase,
                to_phase,
            };
            let out_id = state.allocate_envelope_id(now)?;
            let envelope = Envelope::v1(
                out_id,
                PROJECT_STORE_SOURCE,
                EnvelopePayload::ProjectPhaseChanged {
                    project_id: project_id.clone(),
                    from_phase,
                    to_phase,
                    reason: reason.to_string(),
                    changed_by,
                },
                now,
            )?;
            (applied, envelope)
        };
        self.sink.publish(envelope)?;
        Ok(applied)
    }

    pub fn len(&self) -> usize {
        self.state.borrow().projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().projects.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Project> {
        self.state.borrow().projects.values().cloned().collect()
    }

    /// Replaces store contents from a snapshot. The applied-transition index
    /// is rebuilt from the envelope ids recorded in phase history, so the
    /// durable guard holds across restarts. Never emits.
    pub fn restore(&self, rows: Vec<Project>) -> Result<(), StoreError> {
        for row in &rows {
            row.validate()?;
        }
        let mut state = self.state.borrow_mut();
        state.projects.clear();
        state.applied_index.clear();
        for row in rows {
            for entry in &row.phase_history {
                if let Some(envelope_id) = &entry.envelope_id {
                    state
                        .applied_index
                        .insert((row.id.clone(), envelope_id.clone()));
                }
            }
            if state.projects.insert(row.id.clone(), row.clone()).is_some() {
                return Err(StoreError::DuplicateKey {
                    entity: "project",
                    key: row.id.as_str().to_string(),
                });
            }
        }
        Ok(())
    }
}

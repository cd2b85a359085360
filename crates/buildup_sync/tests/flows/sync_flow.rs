#![forbid(unsafe_code)]

//! End-to-end flows through the composed runtime: schedule events in,
//! phase transitions and outcome envelopes out.

use std::cell::RefCell;
use std::rc::Rc;

use buildup_contracts::envelope::{
    envelope_types, Envelope, EnvelopeId, EnvelopePayload, SyncOperation,
};
use buildup_contracts::project::{ActorId, ProjectId, ProjectPhase};
use buildup_contracts::schedule::{
    MeetingSequence, Schedule, ScheduleCreateInput, ScheduleId, ScheduleKind, ScheduleStatus,
    SCHEDULE_CONTRACT_VERSION,
};
use buildup_contracts::WallTimeMs;
use buildup_rules::PhaseRuleTable;
use buildup_sync::{reason_codes, SyncRuntime};

const ALL_EVENT_TYPES: [&str; 10] = [
    envelope_types::SCHEDULE_CREATED,
    envelope_types::SCHEDULE_UPDATED,
    envelope_types::SCHEDULE_COMPLETED,
    envelope_types::SCHEDULE_SYNC_REQUESTED,
    envelope_types::PHASE_TRANSITION_COMPLETED,
    envelope_types::SYNC_ERROR,
    envelope_types::SYNC_NO_OP,
    envelope_types::PROJECT_PHASE_CHANGED,
    envelope_types::RULE_MISMATCH,
    envelope_types::SUBSCRIBER_ERROR,
];

fn record_all(runtime: &SyncRuntime) -> Rc<RefCell<Vec<Envelope>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    for event_type in ALL_EVENT_TYPES {
        let seen = seen.clone();
        runtime.bus().subscribe(event_type, move |envelope| {
            seen.borrow_mut().push(envelope.clone());
            Ok(())
        });
    }
    seen
}

fn of_type<'a>(seen: &'a [Envelope], event_type: &str) -> Vec<&'a Envelope> {
    seen.iter().filter(|e| e.event_type == event_type).collect()
}

fn actor() -> ActorId {
    ActorId::new("operator_1").unwrap()
}

fn register(runtime: &SyncRuntime, project: &str, phase: ProjectPhase) -> ProjectId {
    let project_id = ProjectId::new(project).unwrap();
    runtime
        .register_project(project_id.clone(), phase, actor(), WallTimeMs(1))
        .unwrap();
    project_id
}

fn guide_input(project_id: &ProjectId, meeting: MeetingSequence) -> ScheduleCreateInput {
    ScheduleCreateInput {
        kind: ScheduleKind::Buildup,
        title: format!("{} meeting", meeting.as_str()),
        project_id: Some(project_id.clone()),
        meeting_sequence: Some(meeting),
        start_at: WallTimeMs(1_000),
        end_at: WallTimeMs(2_000),
    }
}

/// Hand-built schedule for envelopes injected from outside the store, e.g.
/// replays of events whose schedule never went through `create`.
fn external_schedule(
    id: &str,
    project_id: &ProjectId,
    meeting: MeetingSequence,
    rules: &PhaseRuleTable,
) -> Schedule {
    Schedule {
        schema_version: SCHEDULE_CONTRACT_VERSION,
        id: ScheduleId::new(id).unwrap(),
        kind: ScheduleKind::Buildup,
        title: format!("{} meeting", meeting.as_str()),
        project_id: Some(project_id.clone()),
        meeting_sequence: Some(meeting),
        status: ScheduleStatus::Scheduled,
        start_at: WallTimeMs(1_000),
        end_at: WallTimeMs(2_000),
        phase_transition_trigger: rules.trigger_for(meeting),
    }
}

fn created_envelope(id: &str, schedule: &Schedule, at: WallTimeMs) -> Envelope {
    Envelope::v1(
        EnvelopeId::new(id).unwrap(),
        "calendar_import",
        EnvelopePayload::ScheduleCreated {
            schedule: schedule.clone(),
        },
        at,
    )
    .unwrap()
}

#[test]
fn at_flow_01_guide_meeting_creation_advances_the_project_phase() {
    let runtime = SyncRuntime::new();
    let seen = record_all(&runtime);
    let project_id = register(&runtime, "proj_1", ProjectPhase::ContractSigned);

    let schedule = runtime
        .create_schedule(guide_input(&project_id, MeetingSequence::Guide1), WallTimeMs(100))
        .unwrap();

    assert_eq!(
        runtime.project_phase(&project_id).unwrap(),
        ProjectPhase::Planning
    );

    let seen = seen.borrow();
    let completed = of_type(&seen, envelope_types::PHASE_TRANSITION_COMPLETED);
    assert_eq!(completed.len(), 1);
    match &completed[0].payload {
        EnvelopePayload::PhaseTransitionCompleted {
            project_id: p,
            from_phase,
            to_phase,
            schedule_id,
            already_applied,
            reason_code,
            ..
        } => {
            assert_eq!(p, &project_id);
            assert_eq!(*from_phase, ProjectPhase::ContractSigned);
            assert_eq!(*to_phase, ProjectPhase::Planning);
            assert_eq!(schedule_id.as_ref(), Some(&schedule.id));
            assert!(!already_applied);
            assert_eq!(*reason_code, reason_codes::TRANSITION_APPLIED);
        }
        other => panic!("unexpected payload {:?}", other),
    }
    // the project store announced the move as well
    assert_eq!(of_type(&seen, envelope_types::PROJECT_PHASE_CHANGED).len(), 1);
}

#[test]
fn at_flow_02_duplicate_envelope_is_discarded_silently() {
    let runtime = SyncRuntime::new();
    let seen = record_all(&runtime);
    let project_id = register(&runtime, "proj_1", ProjectPhase::ContractSigned);

    let rules = PhaseRuleTable::default_v1();
    let schedule = external_schedule("sch_ext_1", &project_id, MeetingSequence::Guide1, &rules);
    let envelope = created_envelope("evt_dup", &schedule, WallTimeMs(100));

    runtime.publish(envelope.clone()).unwrap();
    runtime.publish(envelope).unwrap();

    assert_eq!(
        runtime.project_phase(&project_id).unwrap(),
        ProjectPhase::Planning
    );
    assert_eq!(
        runtime
            .get_project(&project_id)
            .unwrap()
            .phase_history
            .len(),
        2
    );

    let seen = seen.borrow();
    assert_eq!(
        of_type(&seen, envelope_types::PHASE_TRANSITION_COMPLETED).len(),
        1
    );
    // no error, no no-op: the duplicate vanishes without a trace
    assert!(of_type(&seen, envelope_types::SYNC_ERROR).is_empty());
    assert!(of_type(&seen, envelope_types::SYNC_NO_OP).is_empty());
}

#[test]
fn at_flow_03_replay_past_the_dedup_window_hits_the_durable_guard() {
    let runtime = SyncRuntime::new();
    let seen = record_all(&runtime);
    let project_id = register(&runtime, "proj_1", ProjectPhase::ContractSigned);

    let rules = PhaseRuleTable::default_v1();
    let schedule = external_schedule("sch_ext_1", &project_id, MeetingSequence::Guide1, &rules);

    runtime
        .publish(created_envelope("evt_replay", &schedule, WallTimeMs(1_000)))
        .unwrap();
    // same envelope id, redelivered long after the retention window
    runtime
        .publish(created_envelope("evt_replay", &schedule, WallTimeMs(400_000)))
        .unwrap();

    assert_eq!(
        runtime
            .get_project(&project_id)
            .unwrap()
            .phase_history
            .len(),
        2
    );

    let seen = seen.borrow();
    let completed = of_type(&seen, envelope_types::PHASE_TRANSITION_COMPLETED);
    assert_eq!(completed.len(), 2);
    match &completed[1].payload {
        EnvelopePayload::PhaseTransitionCompleted {
            already_applied,
            reason_code,
            ..
        } => {
            assert!(already_applied);
            assert_eq!(*reason_code, reason_codes::TRANSITION_ALREADY_APPLIED);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn at_flow_04_guide_5_has_no_rule_and_records_a_no_op() {
    let runtime = SyncRuntime::new();
    let seen = record_all(&runtime);
    let project_id = register(&runtime, "proj_1", ProjectPhase::Review);

    runtime
        .create_schedule(guide_input(&project_id, MeetingSequence::Guide5), WallTimeMs(100))
        .unwrap();

    assert_eq!(
        runtime.project_phase(&project_id).unwrap(),
        ProjectPhase::Review
    );
    let seen = seen.borrow();
    let no_ops = of_type(&seen, envelope_types::SYNC_NO_OP);
    assert_eq!(no_ops.len(), 1);
    match &no_ops[0].payload {
        EnvelopePayload::SyncNoOp { reason_code, .. } => {
            assert_eq!(*reason_code, reason_codes::NO_RULE_FOR_MEETING);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn at_flow_05_pre_meeting_rule_is_manual_and_does_not_fire() {
    let runtime = SyncRuntime::new();
    let seen = record_all(&runtime);
    let project_id = register(&runtime, "proj_1", ProjectPhase::ContractPending);

    runtime
        .create_schedule(
            guide_input(&project_id, MeetingSequence::PreMeeting),
            WallTimeMs(100),
        )
        .unwrap();

    assert_eq!(
        runtime.project_phase(&project_id).unwrap(),
        ProjectPhase::ContractPending
    );
    let seen = seen.borrow();
    let no_ops = of_type(&seen, envelope_types::SYNC_NO_OP);
    assert_eq!(no_ops.len(), 1);
    match &no_ops[0].payload {
        EnvelopePayload::SyncNoOp { reason_code, .. } => {
            assert_eq!(*reason_code, reason_codes::RULE_NOT_AUTOMATIC);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn at_flow_06_create_meeting_request_creates_the_schedule_and_advances_the_phase() {
    let runtime = SyncRuntime::new();
    let seen = record_all(&runtime);
    let project_id = register(&runtime, "proj_1", ProjectPhase::ContractSigned);

    let request = Envelope::v1(
        EnvelopeId::new("evt_req_1").unwrap(),
        "project_ui",
        EnvelopePayload::ScheduleSyncRequested {
            project_id: Some(project_id.clone()),
            meeting: Some(MeetingSequence::Guide1),
            operation: SyncOperation::CreateMeeting,
        },
        WallTimeMs(100),
    )
    .unwrap();
    runtime.publish(request).unwrap();

    let schedules = runtime.query_schedules(&Default::default());
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].meeting_sequence, Some(MeetingSequence::Guide1));
    assert_eq!(
        runtime.project_phase(&project_id).unwrap(),
        ProjectPhase::Planning
    );

    // phase logic ran under the schedule.created envelope, not the request
    let seen = seen.borrow();
    let completed = of_type(&seen, envelope_types::PHASE_TRANSITION_COMPLETED);
    assert_eq!(completed.len(), 1);
    match &completed[0].payload {
        EnvelopePayload::PhaseTransitionCompleted { envelope_id, .. } => {
            assert_ne!(envelope_id.as_str(), "evt_req_1");
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn at_flow_07_malformed_sync_request_reports_an_error_and_mutates_nothing() {
    let runtime = SyncRuntime::new();
    let seen = record_all(&runtime);
    let project_id = register(&runtime, "proj_1", ProjectPhase::ContractSigned);

    let request = Envelope::v1(
        EnvelopeId::new("evt_req_bad").unwrap(),
        "project_ui",
        EnvelopePayload::ScheduleSyncRequested {
            project_id: None,
            meeting: Some(MeetingSequence::Guide1),
            operation: SyncOperation::CreateMeeting,
        },
        WallTimeMs(100),
    )
    .unwrap();
    runtime.publish(request).unwrap();

    assert!(runtime.query_schedules(&Default::default()).is_empty());
    assert_eq!(
        runtime.project_phase(&project_id).unwrap(),
        ProjectPhase::ContractSigned
    );

    let seen = seen.borrow();
    let errors = of_type(&seen, envelope_types::SYNC_ERROR);
    assert_eq!(errors.len(), 1);
    match &errors[0].payload {
        EnvelopePayload::SyncError {
            operation,
            reason_code,
            envelope_id,
            ..
        } => {
            assert_eq!(operation, "create_meeting");
            assert_eq!(*reason_code, reason_codes::MALFORMED_SYNC_REQUEST);
            assert_eq!(envelope_id.as_str(), "evt_req_bad");
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn at_flow_08_complete_meeting_request_after_creation_is_a_catch_up_no_op() {
    let runtime = SyncRuntime::new();
    let seen = record_all(&runtime);
    let project_id = register(&runtime, "proj_1", ProjectPhase::ContractSigned);
    runtime
        .create_schedule(guide_input(&project_id, MeetingSequence::Guide1), WallTimeMs(100))
        .unwrap();
    assert_eq!(
        runtime.project_phase(&project_id).unwrap(),
        ProjectPhase::Planning
    );

    let request = Envelope::v1(
        EnvelopeId::new("evt_req_2").unwrap(),
        "project_ui",
        EnvelopePayload::ScheduleSyncRequested {
            project_id: Some(project_id.clone()),
            meeting: Some(MeetingSequence::Guide1),
            operation: SyncOperation::CompleteMeeting,
        },
        WallTimeMs(200),
    )
    .unwrap();
    runtime.publish(request).unwrap();

    let schedules = runtime.query_schedules(&Default::default());
    assert_eq!(schedules[0].status, ScheduleStatus::Completed);
    // still Planning; creation already advanced the project
    assert_eq!(
        runtime.project_phase(&project_id).unwrap(),
        ProjectPhase::Planning
    );

    let seen = seen.borrow();
    let no_ops = of_type(&seen, envelope_types::SYNC_NO_OP);
    assert_eq!(no_ops.len(), 1);
    match &no_ops[0].payload {
        EnvelopePayload::SyncNoOp { reason_code, .. } => {
            assert_eq!(*reason_code, reason_codes::CATCH_UP_NOT_NEEDED);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn at_flow_09_completion_catches_up_a_project_that_missed_the_creation_event() {
    let runtime = SyncRuntime::new();
    let seen = record_all(&runtime);
    let project_id = register(&runtime, "proj_1", ProjectPhase::ContractSigned);

    // schedule arrives via restore, so no schedule.created ever fires
    let rules = PhaseRuleTable::default_v1();
    let schedule = external_schedule("sch_000009", &project_id, MeetingSequence::Guide1, &rules);
    runtime.restore_schedules(vec![schedule.clone()]).unwrap();
    assert_eq!(
        runtime.project_phase(&project_id).unwrap(),
        ProjectPhase::ContractSigned
    );

    runtime
        .mark_schedule_completed(&schedule.id, WallTimeMs(200))
        .unwrap();

    assert_eq!(
        runtime.project_phase(&project_id).unwrap(),
        ProjectPhase::Planning
    );
    let seen = seen.borrow();
    let completed = of_type(&seen, envelope_types::PHASE_TRANSITION_COMPLETED);
    assert_eq!(completed.len(), 1);
}

#[test]
fn at_flow_10_unknown_project_reports_an_error() {
    let runtime = SyncRuntime::new();
    let seen = record_all(&runtime);
    let project_id = ProjectId::new("proj_ghost").unwrap();

    runtime
        .create_schedule(guide_input(&project_id, MeetingSequence::Guide1), WallTimeMs(100))
        .unwrap();

    let seen = seen.borrow();
    let errors = of_type(&seen, envelope_types::SYNC_ERROR);
    assert_eq!(errors.len(), 1);
    match &errors[0].payload {
        EnvelopePayload::SyncError {
            reason_code,
            project_id: p,
            ..
        } => {
            assert_eq!(*reason_code, reason_codes::PROJECT_NOT_FOUND);
            assert_eq!(p.as_ref(), Some(&project_id));
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn at_flow_11_stale_cached_trigger_is_reported_and_the_live_rule_wins() {
    let runtime = SyncRuntime::new();
    let seen = record_all(&runtime);
    let project_id = register(&runtime, "proj_1", ProjectPhase::ContractSigned);

    let rules = PhaseRuleTable::default_v1();
    let mut schedule =
        external_schedule("sch_ext_1", &project_id, MeetingSequence::Guide1, &rules);
    if let Some(trigger) = schedule.phase_transition_trigger.as_mut() {
        trigger.to_phase = ProjectPhase::Execution;
    }
    runtime
        .publish(created_envelope("evt_stale", &schedule, WallTimeMs(100)))
        .unwrap();

    // live rule applied, not the tampered cache
    assert_eq!(
        runtime.project_phase(&project_id).unwrap(),
        ProjectPhase::Planning
    );
    let seen = seen.borrow();
    assert_eq!(of_type(&seen, envelope_types::RULE_MISMATCH).len(), 1);
    assert_eq!(
        of_type(&seen, envelope_types::PHASE_TRANSITION_COMPLETED).len(),
        1
    );
}

#[test]
fn at_flow_12_non_buildup_schedules_are_ignored_with_a_no_op() {
    let runtime = SyncRuntime::new();
    let seen = record_all(&runtime);

    runtime
        .create_schedule(
            ScheduleCreateInput {
                kind: ScheduleKind::General,
                title: "Team offsite".to_string(),
                project_id: None,
                meeting_sequence: None,
                start_at: WallTimeMs(1_000),
                end_at: WallTimeMs(2_000),
            },
            WallTimeMs(100),
        )
        .unwrap();

    let seen = seen.borrow();
    let no_ops = of_type(&seen, envelope_types::SYNC_NO_OP);
    assert_eq!(no_ops.len(), 1);
    match &no_ops[0].payload {
        EnvelopePayload::SyncNoOp { reason_code, .. } => {
            assert_eq!(*reason_code, reason_codes::NOT_A_BUILDUP_SCHEDULE);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn at_flow_13_full_guide_ladder_reaches_completed() {
    let runtime = SyncRuntime::new();
    let project_id = register(&runtime, "proj_1", ProjectPhase::ContractSigned);

    let ladder = [
        (MeetingSequence::Guide1, ProjectPhase::Planning),
        (MeetingSequence::Guide2, ProjectPhase::Design),
        (MeetingSequence::Guide3, ProjectPhase::Execution),
        (MeetingSequence::Guide4, ProjectPhase::Review),
        (MeetingSequence::Closing, ProjectPhase::Completed),
    ];
    for (idx, (meeting, expected)) in ladder.iter().enumerate() {
        runtime
            .create_schedule(
                guide_input(&project_id, *meeting),
                WallTimeMs(100 + idx as u64),
            )
            .unwrap();
        assert_eq!(runtime.project_phase(&project_id).unwrap(), *expected);
    }

    // registration plus five transitions
    assert_eq!(
        runtime
            .get_project(&project_id)
            .unwrap()
            .phase_history
            .len(),
        6
    );
}

#[test]
fn at_flow_14_projects_advance_independently() {
    let runtime = SyncRuntime::new();
    let proj_a = register(&runtime, "proj_a", ProjectPhase::ContractSigned);
    let proj_b = register(&runtime, "proj_b", ProjectPhase::Design);

    runtime
        .create_schedule(guide_input(&proj_a, MeetingSequence::Guide1), WallTimeMs(100))
        .unwrap();
    runtime
        .create_schedule(guide_input(&proj_b, MeetingSequence::Guide3), WallTimeMs(101))
        .unwrap();

    assert_eq!(
        runtime.project_phase(&proj_a).unwrap(),
        ProjectPhase::Planning
    );
    assert_eq!(
        runtime.project_phase(&proj_b).unwrap(),
        ProjectPhase::Execution
    );
}

#[test]
fn at_flow_15_complete_meeting_without_an_active_schedule_is_an_error() {
    let runtime = SyncRuntime::new();
    let seen = record_all(&runtime);
    let project_id = register(&runtime, "proj_1", ProjectPhase::ContractSigned);

    let request = Envelope::v1(
        EnvelopeId::new("evt_req_3").unwrap(),
        "project_ui",
        EnvelopePayload::ScheduleSyncRequested {
            project_id: Some(project_id.clone()),
            meeting: Some(MeetingSequence::Guide1),
            operation: SyncOperation::CompleteMeeting,
        },
        WallTimeMs(100),
    )
    .unwrap();
    runtime.publish(request).unwrap();

    let seen = seen.borrow();
    let errors = of_type(&seen, envelope_types::SYNC_ERROR);
    assert_eq!(errors.len(), 1);
    match &errors[0].payload {
        EnvelopePayload::SyncError { reason_code, .. } => {
            assert_eq!(*reason_code, reason_codes::MEETING_NOT_FOUND);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn at_flow_16_postponed_schedules_fire_no_trigger() {
    let runtime = SyncRuntime::new();
    let seen = record_all(&runtime);
    let project_id = register(&runtime, "proj_1", ProjectPhase::ContractSigned);

    // parked schedule arrives via restore, then someone tries to complete it
    let rules = PhaseRuleTable::default_v1();
    let mut schedule =
        external_schedule("sch_000010", &project_id, MeetingSequence::Guide1, &rules);
    schedule.status = ScheduleStatus::Postponed;
    runtime.restore_schedules(vec![schedule.clone()]).unwrap();

    let out = runtime.mark_schedule_completed(&schedule.id, WallTimeMs(200));
    assert!(out.is_err());
    assert_eq!(
        runtime.project_phase(&project_id).unwrap(),
        ProjectPhase::ContractSigned
    );

    // a complete_meeting request cannot reach it either
    let request = Envelope::v1(
        EnvelopeId::new("evt_req_parked").unwrap(),
        "project_ui",
        EnvelopePayload::ScheduleSyncRequested {
            project_id: Some(project_id.clone()),
            meeting: Some(MeetingSequence::Guide1),
            operation: SyncOperation::CompleteMeeting,
        },
        WallTimeMs(201),
    )
    .unwrap();
    runtime.publish(request).unwrap();

    assert_eq!(
        runtime.project_phase(&project_id).unwrap(),
        ProjectPhase::ContractSigned
    );
    let seen = seen.borrow();
    assert!(of_type(&seen, envelope_types::PHASE_TRANSITION_COMPLETED).is_empty());
    let errors = of_type(&seen, envelope_types::SYNC_ERROR);
    assert_eq!(errors.len(), 1);
    match &errors[0].payload {
        EnvelopePayload::SyncError { reason_code, .. } => {
            assert_eq!(*reason_code, reason_codes::MEETING_NOT_FOUND);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn at_flow_17_manual_override_and_automatic_rule_record_independent_entries() {
    let runtime = SyncRuntime::new();
    let seen = record_all(&runtime);
    let project_id = register(&runtime, "proj_1", ProjectPhase::Planning);

    runtime
        .manual_phase_override(
            &project_id,
            ProjectPhase::Design,
            "design kickoff pulled forward",
            actor(),
            EnvelopeId::new("evt_manual_1").unwrap(),
            WallTimeMs(100),
        )
        .unwrap();

    // guide 2 targets design as well, under its own envelope id
    runtime
        .create_schedule(guide_input(&project_id, MeetingSequence::Guide2), WallTimeMs(200))
        .unwrap();

    assert_eq!(
        runtime.project_phase(&project_id).unwrap(),
        ProjectPhase::Design
    );
    // registration, manual move, automatic move
    let history = runtime.get_project(&project_id).unwrap().phase_history;
    assert_eq!(history.len(), 3);
    assert_eq!(
        history[1].envelope_id,
        Some(EnvelopeId::new("evt_manual_1").unwrap())
    );
    assert_ne!(history[2].envelope_id, history[1].envelope_id);

    let seen = seen.borrow();
    let completed = of_type(&seen, envelope_types::PHASE_TRANSITION_COMPLETED);
    assert_eq!(completed.len(), 1);
    match &completed[0].payload {
        EnvelopePayload::PhaseTransitionCompleted {
            already_applied,
            to_phase,
            ..
        } => {
            assert!(!already_applied);
            assert_eq!(*to_phase, ProjectPhase::Design);
        }
        other => panic!("unexpected payload {:?}", other),
    }
    assert_eq!(of_type(&seen, envelope_types::PROJECT_PHASE_CHANGED).len(), 2);
}

#![forbid(unsafe_code)]

use buildup_contracts::project::ProjectPhase;
use buildup_contracts::schedule::{MeetingSequence, PhaseTransitionTrigger, RuleVersion};

/// Static mapping from one meeting sequence to a phase move. `automatic`
/// rules are applied by the coordinator without operator confirmation;
/// non-automatic rules only record intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTransitionRule {
    pub meeting_sequence: MeetingSequence,
    pub from_phase: ProjectPhase,
    pub to_phase: ProjectPhase,
    pub automatic: bool,
    pub reason: &'static str,
}

/// Pure lookup table. No side effects, no I/O: the same sequence always
/// resolves to the same rule for a given table version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRuleTable {
    version: RuleVersion,
    rules: Vec<PhaseTransitionRule>,
}

impl PhaseRuleTable {
    pub fn new(version: RuleVersion, rules: Vec<PhaseTransitionRule>) -> Self {
        Self { version, rules }
    }

    /// The buildup meeting ladder. Guide 5 is a mid-sequence check-in and
    /// carries no rule; the pre-meeting records intent only (the contract
    /// signature is an operator action, not a calendar side effect).
    pub fn default_v1() -> Self {
        Self::new(
            RuleVersion(1),
            vec![
                PhaseTransitionRule {
                    meeting_sequence: MeetingSequence::PreMeeting,
                    from_phase: ProjectPhase::ContractPending,
                    to_phase: ProjectPhase::ContractSigned,
                    automatic: false,
                    reason: "pre-meeting held",
                },
                PhaseTransitionRule {
                    meeting_sequence: MeetingSequence::Guide1,
                    from_phase: ProjectPhase::ContractSigned,
                    to_phase: ProjectPhase::Planning,
                    automatic: true,
                    reason: "guide meeting 1 scheduled",
                },
                PhaseTransitionRule {
                    meeting_sequence: MeetingSequence::Guide2,
                    from_phase: ProjectPhase::Planning,
                    to_phase: ProjectPhase::Design,
                    automatic: true,
                    reason: "guide meeting 2 scheduled",
                },
                PhaseTransitionRule {
                    meeting_sequence: MeetingSequence::Guide3,
                    from_phase: ProjectPhase::Design,
                    to_phase: ProjectPhase::Execution,
                    automatic: true,
                    reason: "guide meeting 3 scheduled",
                },
                PhaseTransitionRule {
                    meeting_sequence: MeetingSequence::Guide4,
                    from_phase: ProjectPhase::Execution,
                    to_phase: ProjectPhase::Review,
                    automatic: true,
                    reason: "guide meeting 4 scheduled",
                },
                PhaseTransitionRule {
                    meeting_sequence: MeetingSequence::Closing,
                    from_phase: ProjectPhase::Review,
                    to_phase: ProjectPhase::Completed,
                    automatic: true,
                    reason: "closing meeting scheduled",
                },
            ],
        )
    }

    pub fn version(&self) -> RuleVersion {
        self.version
    }

    pub fn resolve(&self, meeting_sequence: MeetingSequence) -> Option<&PhaseTransitionRule> {
        self.rules
            .iter()
            .find(|rule| rule.meeting_sequence == meeting_sequence)
    }

    /// Creation-time pre-computation of the trigger a schedule caches.
    pub fn trigger_for(&self, meeting_sequence: MeetingSequence) -> Option<PhaseTransitionTrigger> {
        self.resolve(meeting_sequence)
            .map(|rule| PhaseTransitionTrigger {
                from_phase: rule.from_phase,
                to_phase: rule.to_phase,
                automatic: rule.automatic,
                reason: rule.reason.to_string(),
                rule_version: self.version,
            })
    }

    /// Defensive re-check used by the coordinator before applying a cached
    /// trigger. A mismatch means the rule changed after the schedule was
    /// created; the cached value is then advisory only.
    pub fn matches_cached(
        &self,
        cached: &PhaseTransitionTrigger,
        meeting_sequence: MeetingSequence,
    ) -> bool {
        match self.trigger_for(meeting_sequence) {
            Some(current) => {
                current.from_phase == cached.from_phase
                    && current.to_phase == cached.to_phase
                    && current.automatic == cached.automatic
            }
            None => false,
        }
    }
}

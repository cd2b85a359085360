#![forbid(unsafe_code)]

pub mod phase_rules;

pub use phase_rules::{PhaseRuleTable, PhaseTransitionRule};

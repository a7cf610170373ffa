//! Rule-driven profanity/anger detection: rulepack loading and the scanner.

pub mod detector;
pub mod rulepack;

pub use detector::{
    CtxAction, Detector, DetectorSource, HitSeverity, RuleMatch, TargetHit, Zone,
};
pub use rulepack::{Category, Rulepack, TargetType};

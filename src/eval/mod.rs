//! Local flag evaluation.
//!
//! [`FlagDefinitions::evaluate_flag`](crate::FlagDefinitions::evaluate_flag) and
//! [`FlagDefinitions::evaluate_all_flags`](crate::FlagDefinitions::evaluate_all_flags) are the
//! entry points. Both are pure: everything they depend on, including the current time and the
//! hasher, is passed in.
mod cohorts;
mod dates;
mod dependencies;
mod evaluator;
mod property_matcher;
mod result;

pub use cohorts::MAX_PROPERTY_GROUP_DEPTH;
pub use dates::{parse_date, parse_relative_date};
pub use property_matcher::match_property;
pub use result::{
    EvaluationResult, FlagValue, InconclusiveReason, MatchError, ServerEvaluationReason,
};

pub(crate) use evaluator::Evaluator;

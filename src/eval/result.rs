use std::borrow::Cow;

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::models::Operator;

/// Value a flag evaluates to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, From, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    /// Boolean flag result, or `false` for any flag that did not match.
    Boolean(bool),
    /// Key of the chosen multivariate variant.
    Variant(String),
}

impl FlagValue {
    /// `true` for `Boolean(true)` and any non-empty variant.
    pub fn is_enabled(&self) -> bool {
        match self {
            FlagValue::Boolean(b) => *b,
            FlagValue::Variant(v) => !v.is_empty(),
        }
    }

    /// Return the variant key if the value is a variant.
    pub fn as_variant(&self) -> Option<&str> {
        match self {
            FlagValue::Variant(v) => Some(v),
            FlagValue::Boolean(_) => None,
        }
    }

    /// Key under which a payload for this value is stored.
    pub(crate) fn payload_key(&self) -> Cow<'_, str> {
        match self {
            FlagValue::Boolean(true) => Cow::Borrowed("true"),
            FlagValue::Boolean(false) => Cow::Borrowed("false"),
            FlagValue::Variant(v) => Cow::Borrowed(v),
        }
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        FlagValue::Variant(value.to_owned())
    }
}

/// Outcome of evaluating one flag against the local snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationResult {
    /// The snapshot was enough to decide.
    Matched {
        /// Resulting value.
        value: FlagValue,
        /// Payload attached to the value, if any.
        payload: Option<serde_json::Value>,
    },
    /// The snapshot was not enough to decide. The remote service may still be able to.
    Inconclusive(InconclusiveReason),
    /// The flag depends on data only the server has.
    RequiresServerEvaluation(ServerEvaluationReason),
}

impl EvaluationResult {
    /// Return the value if the flag was decided locally.
    pub fn value(&self) -> Option<&FlagValue> {
        match self {
            EvaluationResult::Matched { value, .. } => Some(value),
            _ => None,
        }
    }

    /// `true` if the result was not decided locally.
    pub fn needs_fallback(&self) -> bool {
        !matches!(self, EvaluationResult::Matched { .. })
    }
}

impl From<MatchError> for EvaluationResult {
    fn from(value: MatchError) -> Self {
        match value {
            MatchError::Inconclusive(reason) => EvaluationResult::Inconclusive(reason),
            MatchError::RequiresServerEvaluation(reason) => {
                EvaluationResult::RequiresServerEvaluation(reason)
            }
        }
    }
}

/// Why a flag could not be decided locally.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InconclusiveReason {
    /// The requested flag is not in the snapshot. Either it does not exist or definitions have
    /// not been fetched yet.
    #[error("flag `{0}` not found in local definitions")]
    FlagNotFound(String),

    /// The flag definition did not parse. It is recommended to upgrade the SDK.
    #[error("flag `{0}` could not be parsed, try upgrading the SDK")]
    ConfigurationParseError(String),

    /// The flag needs server-side state to keep assignments stable.
    #[error("flag `{0}` requires experience continuity")]
    ExperienceContinuity(String),

    /// The flag aggregates by a group type index the snapshot does not name.
    #[error("group type index {0} is not mapped to a group type")]
    UnmappedGroupType(i64),

    /// A condition references a property missing from the context.
    #[error("property `{0}` is missing from the evaluation context")]
    MissingProperty(String),

    /// The operator has no local implementation.
    #[error("operator {0:?} cannot be evaluated locally")]
    UnsupportedOperator(Operator),

    /// A date operator got a value that is not a date.
    #[error("invalid date value for property `{0}`")]
    InvalidDate(String),

    /// A property group uses a logical operator other than `AND`/`OR`.
    #[error("unknown property group type")]
    UnknownGroupType,

    /// Cohort definitions nest deeper than [`MAX_PROPERTY_GROUP_DEPTH`](super::MAX_PROPERTY_GROUP_DEPTH).
    #[error("property groups nested deeper than {0} levels")]
    PropertyGroupDepthExceeded(usize),

    /// A flag dependency condition carries no dependency chain.
    #[error("flag dependency `{0}` has no dependency chain")]
    MissingDependencyChain(String),

    /// Flag dependencies form a cycle.
    #[error("circular dependency detected for flag `{0}`")]
    DependencyCycle(String),

    /// A flag dependency names a flag that is not in the snapshot.
    #[error("flag dependency `{0}` not found")]
    MissingDependency(String),
}

/// Why a flag must be evaluated by the server.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ServerEvaluationReason {
    /// The referenced cohort definition was not shipped to the SDK. Usually a static or
    /// behavioral cohort.
    #[error("cohort `{0}` is not available locally")]
    UnknownCohort(String),
}

/// Failure of a single matching step.
///
/// `RequiresServerEvaluation` always aborts the flag; `Inconclusive` only spoils the branch it
/// occurs in.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, From)]
pub enum MatchError {
    #[allow(missing_docs)]
    #[error(transparent)]
    Inconclusive(InconclusiveReason),
    #[allow(missing_docs)]
    #[error(transparent)]
    RequiresServerEvaluation(ServerEvaluationReason),
}

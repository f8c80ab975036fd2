use crate::{hasher::ConsistentHasher, models::PropertyCondition, AttributeValue};

use super::{Evaluator, FlagValue, InconclusiveReason, MatchError};

impl<H: ConsistentHasher> Evaluator<'_, H> {
    /// Match a `flag_evaluates_to` condition.
    ///
    /// Every flag in the dependency chain is resolved in order. A disabled prerequisite makes the
    /// condition false; the last flag (the condition's own key) is compared against the expected
    /// value.
    pub(super) fn match_flag_dependency(
        &mut self,
        condition: &PropertyCondition,
    ) -> Result<bool, MatchError> {
        let Some(chain) = &condition.dependency_chain else {
            return Err(InconclusiveReason::MissingDependencyChain(condition.key.clone()).into());
        };
        if chain.is_empty() {
            // The server sends an empty chain when it detected a cycle.
            return Err(InconclusiveReason::DependencyCycle(condition.key.clone()).into());
        }

        for flag_key in chain.iter().filter(|key| **key != condition.key) {
            if !self.resolve_key(flag_key)?.is_enabled() {
                log::trace!(target: "flagpole",
                    flag_key = flag_key.as_str(),
                    dependent = condition.key.as_str();
                    "prerequisite flag is disabled");
                return Ok(false);
            }
        }

        let actual = self.resolve_key(&condition.key)?;
        Ok(matches_dependency_value(&condition.value, &actual))
    }
}

/// Compare a dependency's resolved value with the value a condition expects.
///
/// `true` matches any enabled value, `false` only a disabled boolean. A string matches the
/// variant of the same name, case-sensitively.
pub(super) fn matches_dependency_value(expected: &AttributeValue, actual: &FlagValue) -> bool {
    match (expected, actual) {
        (_, FlagValue::Variant(variant)) if variant.is_empty() => false,
        (AttributeValue::Boolean(expected), FlagValue::Variant(_)) => *expected,
        (AttributeValue::String(expected), FlagValue::Variant(variant)) => expected == variant,
        (AttributeValue::Boolean(expected), FlagValue::Boolean(actual)) => expected == actual,
        _ => false,
    }
}

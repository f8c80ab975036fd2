use crate::{
    hasher::ConsistentHasher,
    models::{LogicalOperator, PropertyCondition, PropertyGroup, PropertyGroupNode},
    Attributes,
};

use super::{Evaluator, InconclusiveReason, MatchError, ServerEvaluationReason};

/// Property groups nested deeper than this are not evaluated locally.
pub const MAX_PROPERTY_GROUP_DEPTH: usize = 32;

impl<H: ConsistentHasher> Evaluator<'_, H> {
    /// Match the cohort referenced by `condition.value` against `properties`.
    ///
    /// Cohorts missing from the snapshot (static and behavioral cohorts are not shipped) need the
    /// server.
    pub(super) fn match_cohort(
        &mut self,
        condition: &PropertyCondition,
        properties: &Attributes,
        depth: usize,
    ) -> Result<bool, MatchError> {
        let cohort_id = condition.value.to_comparable_string();
        let definitions = self.definitions;
        let Some(cohort) = definitions.cohort(&cohort_id) else {
            return Err(ServerEvaluationReason::UnknownCohort(cohort_id).into());
        };
        self.match_property_group(cohort, properties, depth + 1)
    }

    /// Evaluate a property group tree.
    ///
    /// `AND` and `OR` short-circuit on the first decisive child. A group none of whose children
    /// decided it is inconclusive if any child was; an empty group is true.
    pub(super) fn match_property_group(
        &mut self,
        group: &PropertyGroup,
        properties: &Attributes,
        depth: usize,
    ) -> Result<bool, MatchError> {
        if depth > MAX_PROPERTY_GROUP_DEPTH {
            return Err(
                InconclusiveReason::PropertyGroupDepthExceeded(MAX_PROPERTY_GROUP_DEPTH).into(),
            );
        }
        if group.values.is_empty() {
            return Ok(true);
        }
        let require_all = match group.group_type {
            LogicalOperator::And => true,
            LogicalOperator::Or => false,
            LogicalOperator::Unknown => return Err(InconclusiveReason::UnknownGroupType.into()),
        };

        let mut inconclusive = None;
        for node in &group.values {
            let result = match node {
                PropertyGroupNode::Group(nested) => {
                    self.match_property_group(nested, properties, depth + 1)
                }
                PropertyGroupNode::Condition(condition) => {
                    self.match_condition(condition, properties, depth)
                }
            };
            match result {
                Ok(matches) if matches != require_all => return Ok(matches),
                Ok(_) => {}
                Err(err @ MatchError::RequiresServerEvaluation(_)) => return Err(err),
                Err(MatchError::Inconclusive(reason)) => {
                    inconclusive.get_or_insert(reason);
                }
            }
        }

        match inconclusive {
            Some(reason) => Err(reason.into()),
            None => Ok(require_all),
        }
    }
}

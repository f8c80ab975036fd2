use std::collections::{HashMap, HashSet};

use crate::{
    hasher::{ConsistentHasher, VARIANT_SALT},
    models::{
        ConditionGroup, FlagDefinition, Operator, PropertyCondition, PropertyType, TryParse,
    },
    Attributes, EvaluationContext, FlagDefinitions, Timestamp,
};

use super::{property_matcher, EvaluationResult, FlagValue, InconclusiveReason, MatchError};

impl FlagDefinitions {
    /// Evaluate a single flag for `context`.
    ///
    /// `context` is used as given; the client adds `distinct_id` and `$group_key` properties
    /// before calling in.
    pub fn evaluate_flag(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
        hasher: &impl ConsistentHasher,
        now: Timestamp,
    ) -> EvaluationResult {
        Evaluator::new(self, context, hasher, now).evaluate_key(flag_key)
    }

    /// Evaluate every flag in the snapshot for `context`, in definition order.
    ///
    /// Dependency results are shared across flags, so each flag is resolved at most once.
    pub fn evaluate_all_flags(
        &self,
        context: &EvaluationContext,
        hasher: &impl ConsistentHasher,
        now: Timestamp,
    ) -> Vec<(String, EvaluationResult)> {
        let mut evaluator = Evaluator::new(self, context, hasher, now);
        self.flag_keys()
            .map(|key| (key.to_owned(), evaluator.evaluate_key(key)))
            .collect()
    }
}

/// Request-scoped evaluation state.
///
/// Holds the per-request cache of flag results used to resolve flag dependencies, and the set of
/// flags currently being resolved, which breaks dependency cycles the server did not catch.
///
/// A result whose resolution ran into the re-entry guard depends on which flags were already in
/// progress, so it is never cached.
pub(crate) struct Evaluator<'a, H> {
    pub(super) definitions: &'a FlagDefinitions,
    context: &'a EvaluationContext,
    hasher: &'a H,
    now: Timestamp,
    cache: HashMap<String, Result<FlagValue, MatchError>>,
    in_progress: HashSet<String>,
    /// Times the re-entry guard fired during this request.
    cycles_hit: usize,
}

impl<'a, H: ConsistentHasher> Evaluator<'a, H> {
    pub fn new(
        definitions: &'a FlagDefinitions,
        context: &'a EvaluationContext,
        hasher: &'a H,
        now: Timestamp,
    ) -> Self {
        Evaluator {
            definitions,
            context,
            hasher,
            now,
            cache: HashMap::new(),
            in_progress: HashSet::new(),
            cycles_hit: 0,
        }
    }

    /// Evaluate flag `flag_key`, attaching its payload if it matched.
    pub fn evaluate_key(&mut self, flag_key: &str) -> EvaluationResult {
        let definitions = self.definitions;
        let flag = match definitions.get_flag(flag_key) {
            Some(TryParse::Parsed(flag)) => flag,
            Some(TryParse::ParseFailed(_)) => {
                log::warn!(target: "flagpole", flag_key; "failed to parse flag definition");
                return EvaluationResult::Inconclusive(
                    InconclusiveReason::ConfigurationParseError(flag_key.to_owned()),
                );
            }
            None => {
                return EvaluationResult::Inconclusive(InconclusiveReason::FlagNotFound(
                    flag_key.to_owned(),
                ))
            }
        };

        let result = match self.resolve(flag) {
            Ok(value) => EvaluationResult::Matched {
                payload: flag.payload_for(&value),
                value,
            },
            Err(err) => err.into(),
        };

        log::trace!(target: "flagpole", flag_key, result:? = result; "evaluated flag locally");
        result
    }

    /// Resolve flag `flag_key` without its payload, reusing earlier results from this request.
    pub(super) fn resolve_key(&mut self, flag_key: &str) -> Result<FlagValue, MatchError> {
        let definitions = self.definitions;
        match definitions.get_flag(flag_key) {
            Some(TryParse::Parsed(flag)) => self.resolve(flag),
            Some(TryParse::ParseFailed(_)) => Err(InconclusiveReason::ConfigurationParseError(
                flag_key.to_owned(),
            )
            .into()),
            None => Err(InconclusiveReason::MissingDependency(flag_key.to_owned()).into()),
        }
    }

    fn resolve(&mut self, flag: &FlagDefinition) -> Result<FlagValue, MatchError> {
        if let Some(cached) = self.cache.get(&flag.key) {
            return cached.clone();
        }
        if !self.in_progress.insert(flag.key.clone()) {
            self.cycles_hit += 1;
            return Err(InconclusiveReason::DependencyCycle(flag.key.clone()).into());
        }

        let cycles_before = self.cycles_hit;
        let result = self.resolve_uncached(flag);

        self.in_progress.remove(&flag.key);
        if self.cycles_hit == cycles_before {
            self.cache.insert(flag.key.clone(), result.clone());
        }
        result
    }

    fn resolve_uncached(&mut self, flag: &FlagDefinition) -> Result<FlagValue, MatchError> {
        if flag.ensure_experience_continuity {
            return Err(InconclusiveReason::ExperienceContinuity(flag.key.clone()).into());
        }
        if !flag.active {
            return Ok(FlagValue::Boolean(false));
        }

        let definitions = self.definitions;
        let context = self.context;
        match flag.filters.aggregation_group_type_index {
            Some(index) => {
                let Some(group_type) = definitions.group_type_name(index) else {
                    return Err(InconclusiveReason::UnmappedGroupType(index).into());
                };
                let Some(group_key) = context.groups.get(group_type) else {
                    log::debug!(target: "flagpole",
                        flag_key = flag.key.as_str(),
                        group_type;
                        "group not passed in context, flag evaluates to false");
                    return Ok(FlagValue::Boolean(false));
                };
                let empty = Attributes::new();
                let properties = context.group_properties.get(group_type).unwrap_or(&empty);
                self.match_condition_groups(flag, group_key, properties)
            }
            None => {
                self.match_condition_groups(flag, &context.distinct_id, &context.person_properties)
            }
        }
    }

    /// First matching condition group decides. Groups with a variant override are tried first.
    fn match_condition_groups(
        &mut self,
        flag: &FlagDefinition,
        identity: &str,
        properties: &Attributes,
    ) -> Result<FlagValue, MatchError> {
        let mut groups: Vec<&ConditionGroup> = flag.filters.groups.iter().collect();
        // Stable sort keeps server order within each partition.
        groups.sort_by_key(|group| group.variant_override.is_none());

        let mut inconclusive = None;
        for group in groups {
            match self.is_condition_match(flag, group, identity, properties) {
                Ok(true) => {
                    let variant = group
                        .variant_override
                        .as_deref()
                        .filter(|variant| flag.has_variant(variant))
                        .map(str::to_owned)
                        .or_else(|| self.get_matching_variant(flag, identity));
                    return Ok(variant
                        .map(FlagValue::Variant)
                        .unwrap_or(FlagValue::Boolean(true)));
                }
                Ok(false) => {}
                Err(err @ MatchError::RequiresServerEvaluation(_)) => return Err(err),
                Err(MatchError::Inconclusive(reason)) => {
                    log::debug!(target: "flagpole",
                        flag_key = flag.key.as_str(),
                        reason:% = reason;
                        "condition group is inconclusive");
                    inconclusive.get_or_insert(reason);
                }
            }
        }

        match inconclusive {
            Some(reason) => Err(reason.into()),
            None => Ok(FlagValue::Boolean(false)),
        }
    }

    fn is_condition_match(
        &mut self,
        flag: &FlagDefinition,
        group: &ConditionGroup,
        identity: &str,
        properties: &Attributes,
    ) -> Result<bool, MatchError> {
        for condition in &group.properties {
            if !self.match_condition(condition, properties, 0)? {
                return Ok(false);
            }
        }

        let rollout = group.rollout_percentage.unwrap_or(100.0);
        Ok(self.hasher.hash(&flag.key, identity, "") <= rollout / 100.0)
    }

    fn get_matching_variant(&self, flag: &FlagDefinition, identity: &str) -> Option<String> {
        let hash = self.hasher.hash(&flag.key, identity, VARIANT_SALT);
        flag.variant_ranges()
            .into_iter()
            .find(|range| range.contains(hash))
            .map(|range| range.key.to_owned())
    }

    /// Match one condition of any type, applying its negation.
    pub(super) fn match_condition(
        &mut self,
        condition: &PropertyCondition,
        properties: &Attributes,
        depth: usize,
    ) -> Result<bool, MatchError> {
        let matches = match condition.property_type {
            PropertyType::Cohort => {
                let member = self.match_cohort(condition, properties, depth)?;
                if condition.operator == Operator::NotIn {
                    !member
                } else {
                    member
                }
            }
            PropertyType::Flag => self.match_flag_dependency(condition)?,
            PropertyType::Person | PropertyType::Group | PropertyType::Other => {
                property_matcher::match_property(condition, properties, self.now)?
            }
        };

        Ok(if condition.negation { !matches } else { matches })
    }
}

//! Wire format of the local evaluation payload.
//!
//! Models tolerate `null` in place of collections and booleans, and unknown operators or property
//! types, so that a newer server does not break an older SDK.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnNull};

use crate::{AttributeValue, FlagValue};

/// Response body of the local evaluation endpoint.
#[serde_as]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalEvaluationResponse {
    /// Flag definitions, in server order.
    ///
    /// Value is wrapped in `TryParse` so that if we fail to parse one flag (e.g., new server
    /// format), we can still serve other flags.
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub flags: Vec<TryParse<FlagDefinition>>,
    /// Group type index (as a string) to group type name.
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub group_type_mapping: HashMap<String, String>,
    /// Cohort id (as a string) to cohort definition.
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub cohorts: HashMap<String, TryParse<PropertyGroup>>,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
///
/// This can be helpful to isolate errors in a subtree. e.g., if one flag definition does not
/// parse, the rest of the flags are still usable.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &TryParse<T>) -> Option<&T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

impl TryParse<FlagDefinition> {
    /// Key of the flag, recovered from the raw JSON if the definition did not parse.
    pub fn flag_key(&self) -> Option<&str> {
        match self {
            TryParse::Parsed(flag) => Some(&flag.key),
            TryParse::ParseFailed(raw) => raw.get("key").and_then(serde_json::Value::as_str),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct FlagDefinition {
    #[serde(default)]
    pub id: Option<i64>,
    pub key: String,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub active: bool,
    /// Flags with experience continuity need server-side state and are never evaluated locally.
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub ensure_experience_continuity: bool,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub filters: FlagFilters,
}

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct FlagFilters {
    /// When set, the flag is evaluated for the group of this type instead of the person.
    #[serde(default)]
    pub aggregation_group_type_index: Option<i64>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub groups: Vec<ConditionGroup>,
    #[serde(default)]
    pub multivariate: Option<Multivariate>,
    /// Payloads keyed by `"true"`, `"false"` or a variant key.
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub payloads: HashMap<String, serde_json::Value>,
}

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Multivariate {
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub variants: Vec<Variant>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Variant {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Share of identities, in percent, that receive this variant.
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub rollout_percentage: f64,
}

/// One OR-branch of a flag: all properties must match, then the rollout applies.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    /// Conditions that must all match.
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub properties: Vec<PropertyCondition>,
    /// Percent of matching identities that get the flag. `None` means 100.
    #[serde(default)]
    pub rollout_percentage: Option<f64>,
    /// Variant forced for identities matching this group.
    #[serde(default, rename = "variant")]
    pub variant_override: Option<String>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct PropertyCondition {
    /// Attribute name, cohort marker or dependency flag key depending on `property_type`.
    pub key: String,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub operator: Operator,
    #[serde(default)]
    pub value: AttributeValue,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default, rename = "type")]
    pub property_type: PropertyType,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub negation: bool,
    #[serde(default)]
    pub group_type_index: Option<i64>,
    /// Flag keys to resolve before a flag-type condition, ending with the condition's own key.
    /// Empty when the server detected a cycle.
    #[serde(default)]
    pub dependency_chain: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Operator {
    #[default]
    Exact,
    IsNot,
    IsSet,
    IsNotSet,
    Icontains,
    NotIcontains,
    Regex,
    NotRegex,
    Gt,
    Gte,
    Lt,
    Lte,
    IsDateBefore,
    IsDateAfter,
    IsRelativeDateBefore,
    IsRelativeDateAfter,
    In,
    NotIn,
    FlagEvaluatesTo,
    #[serde(other)]
    Unknown,
}

/// What a condition's `key` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum PropertyType {
    #[default]
    Person,
    Group,
    Cohort,
    Flag,
    #[serde(other)]
    Other,
}

/// Logical tree of conditions. Used for cohort definitions.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyGroup {
    /// How child results combine.
    #[serde(rename = "type")]
    pub group_type: LogicalOperator,
    /// Children. Required on the wire so conditions never parse as groups.
    #[serde_as(deserialize_as = "DefaultOnNull")]
    pub values: Vec<PropertyGroupNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
#[allow(missing_docs)]
pub enum PropertyGroupNode {
    Group(PropertyGroup),
    Condition(PropertyCondition),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[allow(missing_docs)]
pub enum LogicalOperator {
    And,
    Or,
    #[serde(other)]
    Unknown,
}

/// Bucket `[start, end)` of the variant hash owned by one variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct VariantRange<'a> {
    pub key: &'a str,
    pub start: f64,
    pub end: f64,
}

impl VariantRange<'_> {
    pub fn contains(&self, hash: f64) -> bool {
        self.start <= hash && hash < self.end
    }
}

impl FlagDefinition {
    /// Multivariate variants, empty for boolean flags.
    pub fn variants(&self) -> &[Variant] {
        self.filters
            .multivariate
            .as_ref()
            .map(|multivariate| multivariate.variants.as_slice())
            .unwrap_or_default()
    }

    pub(crate) fn has_variant(&self, key: &str) -> bool {
        self.variants().iter().any(|variant| variant.key == key)
    }

    /// Consecutive hash ranges, one per variant in declaration order.
    pub(crate) fn variant_ranges(&self) -> Vec<VariantRange<'_>> {
        let mut start = 0.0;
        self.variants()
            .iter()
            .map(|variant| {
                let end = start + variant.rollout_percentage / 100.0;
                let range = VariantRange {
                    key: &variant.key,
                    start,
                    end,
                };
                start = end;
                range
            })
            .collect()
    }

    /// Payload attached to `value`, with JSON-encoded strings decoded.
    pub fn payload_for(&self, value: &FlagValue) -> Option<serde_json::Value> {
        self.filters
            .payloads
            .get(value.payload_key().as_ref())
            .cloned()
            .map(decode_payload)
    }
}

/// Payloads are frequently sent as JSON encoded in a string. Decode them, keeping strings that are
/// not valid JSON as-is.
pub(crate) fn decode_payload(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => {
            serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s))
        }
        value => value,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_null_tolerant_flag() {
        let flag: FlagDefinition = serde_json::from_value(json!({
            "id": 1,
            "key": "beta",
            "active": true,
            "ensure_experience_continuity": null,
            "filters": {
                "groups": [{"properties": null, "rollout_percentage": null, "variant": null}],
                "multivariate": null,
                "payloads": null,
            },
        }))
        .unwrap();

        assert!(flag.active);
        assert!(!flag.ensure_experience_continuity);
        assert_eq!(flag.filters.groups, vec![ConditionGroup::default()]);
        assert!(flag.variants().is_empty());
    }

    #[test]
    fn unknown_operator_and_type_parse() {
        let condition: PropertyCondition = serde_json::from_value(json!({
            "key": "email",
            "operator": "matches_soundex",
            "value": "x",
            "type": "event",
        }))
        .unwrap();

        assert_eq!(condition.operator, Operator::Unknown);
        assert_eq!(condition.property_type, PropertyType::Other);
    }

    #[test]
    fn try_parse_isolates_bad_flags() {
        let response: LocalEvaluationResponse = serde_json::from_value(json!({
            "flags": [
                {"key": "good", "active": true, "filters": {}},
                {"key": "bad", "active": "definitely"},
            ],
            "group_type_mapping": null,
        }))
        .unwrap();

        assert!(matches!(response.flags[0], TryParse::Parsed(_)));
        assert!(matches!(response.flags[1], TryParse::ParseFailed(_)));
        assert_eq!(response.flags[1].flag_key(), Some("bad"));
        assert!(response.group_type_mapping.is_empty());
    }

    #[test]
    fn property_group_nodes_distinguish_groups_from_conditions() {
        let group: PropertyGroup = serde_json::from_value(json!({
            "type": "OR",
            "values": [
                {"type": "AND", "values": [{"key": "plan", "value": "pro", "type": "person"}]},
                {"key": "id", "value": 2, "type": "cohort", "operator": "in"},
            ],
        }))
        .unwrap();

        assert_eq!(group.group_type, LogicalOperator::Or);
        assert!(matches!(group.values[0], PropertyGroupNode::Group(_)));
        assert!(matches!(
            group.values[1],
            PropertyGroupNode::Condition(PropertyCondition {
                property_type: PropertyType::Cohort,
                ..
            })
        ));
    }

    #[test]
    fn variant_ranges_are_consecutive() {
        let flag: FlagDefinition = serde_json::from_value(json!({
            "key": "mv",
            "filters": {"multivariate": {"variants": [
                {"key": "first", "rollout_percentage": 50},
                {"key": "second", "rollout_percentage": 20},
                {"key": "third", "rollout_percentage": 30},
            ]}},
        }))
        .unwrap();

        let ranges = flag.variant_ranges();
        assert_eq!(ranges[0].start, 0.0);
        assert_eq!(ranges[0].end, 0.5);
        assert_eq!(ranges[1].start, 0.5);
        assert!((ranges[1].end - 0.7).abs() < 1e-12);
        assert!(ranges[2].contains(0.99));
        assert!(!ranges[0].contains(0.5));
    }

    #[test]
    fn payloads_decode_json_strings() {
        assert_eq!(decode_payload(json!("{\"a\": 1}")), json!({"a": 1}));
        assert_eq!(decode_payload(json!("plain text")), json!("plain text"));
        assert_eq!(decode_payload(json!(42)), json!(42));
    }

    fn half_quarter_quarter() -> FlagDefinition {
        serde_json::from_value(json!({
            "key": "mv",
            "filters": {"multivariate": {"variants": [
                {"key": "a", "rollout_percentage": 50},
                {"key": "b", "rollout_percentage": 25},
                {"key": "c", "rollout_percentage": 25},
            ]}},
        }))
        .unwrap()
    }

    fn variant_at(flag: &FlagDefinition, hash: f64) -> Vec<&str> {
        flag.variant_ranges()
            .into_iter()
            .filter(|range| range.contains(hash))
            .map(|range| range.key)
            .collect()
    }

    #[test]
    fn variant_boundaries_belong_to_the_next_variant() {
        let flag = half_quarter_quarter();

        assert_eq!(variant_at(&flag, 0.0), vec!["a"]);
        assert_eq!(variant_at(&flag, 0.4999), vec!["a"]);
        assert_eq!(variant_at(&flag, 0.5), vec!["b"]);
        assert_eq!(variant_at(&flag, 0.7499), vec!["b"]);
        assert_eq!(variant_at(&flag, 0.75), vec!["c"]);
        assert_eq!(variant_at(&flag, 0.9999), vec!["c"]);
    }

    proptest! {
        #[test]
        fn every_hash_maps_to_exactly_one_variant(hash in 0.0..1.0f64) {
            let flag = half_quarter_quarter();

            let variants = variant_at(&flag, hash);

            prop_assert_eq!(variants.len(), 1);
            let expected = if hash < 0.5 {
                "a"
            } else if hash < 0.75 {
                "b"
            } else {
                "c"
            };
            prop_assert_eq!(variants[0], expected);
        }
    }
}

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{AttributeValue, Attributes};

/// Property added to group properties holding the group key.
const GROUP_KEY_PROPERTY: &str = "$group_key";
/// Property added to person properties holding the distinct id.
const DISTINCT_ID_PROPERTY: &str = "distinct_id";

/// Everything known about the identity a flag is evaluated for.
///
/// ```
/// # use flagpole::EvaluationContext;
/// let context = EvaluationContext::new("user-1")
///     .with_person_property("plan", "enterprise")
///     .with_group("company", "acme")
///     .with_group_property("company", "size", 250.0);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    /// Identity of the person.
    pub distinct_id: String,
    /// Group type name to group key.
    #[serde(default)]
    pub groups: HashMap<String, String>,
    /// Person attributes.
    #[serde(default)]
    pub person_properties: Attributes,
    /// Group type name to that group's attributes.
    #[serde(default)]
    pub group_properties: HashMap<String, Attributes>,
}

impl EvaluationContext {
    /// Create a context for `distinct_id` with no groups or properties.
    pub fn new(distinct_id: impl Into<String>) -> EvaluationContext {
        EvaluationContext {
            distinct_id: distinct_id.into(),
            ..Default::default()
        }
    }

    /// Add a person property.
    pub fn with_person_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> EvaluationContext {
        self.person_properties.insert(key.into(), value.into());
        self
    }

    /// Replace person properties.
    pub fn with_person_properties(mut self, properties: Attributes) -> EvaluationContext {
        self.person_properties = properties;
        self
    }

    /// Declare membership in a group.
    pub fn with_group(
        mut self,
        group_type: impl Into<String>,
        group_key: impl Into<String>,
    ) -> EvaluationContext {
        self.groups.insert(group_type.into(), group_key.into());
        self
    }

    /// Add a property for the group of type `group_type`.
    pub fn with_group_property(
        mut self,
        group_type: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> EvaluationContext {
        self.group_properties
            .entry(group_type.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    /// Return a copy with SDK-provided properties filled in: `distinct_id` for the person and
    /// `$group_key` for every group. Values supplied by the caller win.
    pub(crate) fn augmented(&self) -> EvaluationContext {
        let mut context = self.clone();

        context
            .person_properties
            .entry(DISTINCT_ID_PROPERTY.to_owned())
            .or_insert_with(|| self.distinct_id.as_str().into());

        for (group_type, group_key) in &self.groups {
            context
                .group_properties
                .entry(group_type.clone())
                .or_default()
                .entry(GROUP_KEY_PROPERTY.to_owned())
                .or_insert_with(|| group_key.as_str().into());
        }

        context
    }
}

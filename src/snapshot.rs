use std::{collections::HashMap, sync::Arc};

use chrono::Utc;

use crate::{
    models::{FlagDefinition, LocalEvaluationResponse, PropertyGroup, TryParse},
    Timestamp,
};

/// Flag definitions, cohorts and group type mapping from one local evaluation response, indexed
/// for evaluation.
#[derive(Debug, Default)]
pub struct FlagDefinitions {
    flags: Vec<TryParse<FlagDefinition>>,
    flags_by_key: HashMap<String, usize>,
    group_type_mapping: HashMap<String, String>,
    cohorts: HashMap<String, PropertyGroup>,
}

impl FlagDefinitions {
    /// Index a local evaluation response.
    ///
    /// Flags without a recoverable key and cohorts that do not parse are dropped. If a key
    /// appears more than once, the first definition wins.
    pub fn from_response(response: LocalEvaluationResponse) -> FlagDefinitions {
        let mut flags = Vec::with_capacity(response.flags.len());
        let mut flags_by_key = HashMap::with_capacity(response.flags.len());
        for flag in response.flags {
            let Some(key) = flag.flag_key().map(str::to_owned) else {
                log::warn!(target: "flagpole", "dropping flag definition without a key");
                continue;
            };
            if flags_by_key.contains_key(&key) {
                log::warn!(target: "flagpole", flag_key = key.as_str(); "duplicate flag definition");
                continue;
            }
            flags_by_key.insert(key, flags.len());
            flags.push(flag);
        }

        let cohorts = response
            .cohorts
            .into_iter()
            .filter_map(|(id, cohort)| match cohort {
                TryParse::Parsed(cohort) => Some((id, cohort)),
                TryParse::ParseFailed(_) => {
                    log::warn!(target: "flagpole", cohort_id = id.as_str(); "failed to parse cohort definition");
                    None
                }
            })
            .collect();

        FlagDefinitions {
            flags,
            flags_by_key,
            group_type_mapping: response.group_type_mapping,
            cohorts,
        }
    }

    /// Look up a flag by key.
    pub fn get_flag(&self, flag_key: &str) -> Option<&TryParse<FlagDefinition>> {
        self.flags_by_key
            .get(flag_key)
            .and_then(|index| self.flags.get(*index))
    }

    /// Keys of all flags, in server order. Includes inactive flags and flags that did not parse.
    pub fn flag_keys(&self) -> impl Iterator<Item = &str> {
        self.flags.iter().filter_map(TryParse::flag_key)
    }

    /// Name of the group type with `index`.
    pub fn group_type_name(&self, index: i64) -> Option<&str> {
        self.group_type_mapping
            .get(&index.to_string())
            .map(String::as_str)
    }

    /// Cohort definition by id.
    pub fn cohort(&self, cohort_id: &str) -> Option<&PropertyGroup> {
        self.cohorts.get(cohort_id)
    }

    /// Number of flags.
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    /// `true` if there are no flags.
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

/// Immutable snapshot of flag definitions as last received from the server.
///
/// A snapshot is never modified after creation; refreshes install a new one.
#[derive(Debug, Clone, Default)]
pub struct FlagSnapshot {
    /// Definitions used for evaluation.
    pub definitions: Arc<FlagDefinitions>,
    /// Entity tag of the response the definitions came from.
    pub etag: Option<String>,
    /// When the definitions were received. `None` until the first successful fetch.
    pub fetched_at: Option<Timestamp>,
    /// Set when the server refused to serve definitions because the project ran out of quota.
    /// Evaluation yields no values while set.
    pub quota_limited: bool,
}

impl FlagSnapshot {
    /// Create a snapshot from freshly fetched definitions.
    pub fn from_response(response: LocalEvaluationResponse, etag: Option<String>) -> FlagSnapshot {
        FlagSnapshot {
            definitions: Arc::new(FlagDefinitions::from_response(response)),
            etag,
            fetched_at: Some(Utc::now()),
            quota_limited: false,
        }
    }

    /// Empty snapshot marking the project as quota limited.
    pub fn quota_limited() -> FlagSnapshot {
        FlagSnapshot {
            quota_limited: true,
            ..Default::default()
        }
    }

    /// Same definitions under a new entity tag.
    pub(crate) fn with_etag(&self, etag: String) -> FlagSnapshot {
        FlagSnapshot {
            definitions: self.definitions.clone(),
            etag: Some(etag),
            fetched_at: self.fetched_at,
            quota_limited: self.quota_limited,
        }
    }
}

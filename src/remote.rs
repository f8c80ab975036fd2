//! Remote flag evaluation: the fallback used when the local snapshot cannot decide.
use std::{collections::HashMap, time::Duration};

use reqwest::{header::USER_AGENT, StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::{
    fetcher::SDK_USER_AGENT, models::decode_payload, Attributes, Error, EvaluationContext,
    FlagValue, Result,
};

const FLAGS_ENDPOINT: &str = "/flags/";
const REMOTE_CONFIG_ENDPOINT: &str = "/api/projects/@current/feature_flags/";
/// Quota limit marker listing feature flags in a remote evaluation response.
const FEATURE_FLAGS_QUOTA: &str = "feature_flags";

/// Evaluates flags on the server.
///
/// Implemented by [`HttpRemoteEvaluator`]. Other implementations can be plugged into
/// [`Client::new_with_remote_evaluator`](crate::Client::new_with_remote_evaluator), e.g., to
/// route requests through a proxy or to stub the server in tests.
pub trait RemoteEvaluator {
    /// Evaluate all flags for `context`.
    ///
    /// # Errors
    ///
    /// Transport and decoding errors.
    fn evaluate_flags(&self, context: &EvaluationContext) -> Result<RemoteFlags>;

    /// Fetch the decrypted remote config payload of flag `flag_key`.
    ///
    /// # Errors
    ///
    /// Transport and decoding errors, or [`Error::LocalEvaluationDisabled`] when no personal API
    /// key is configured.
    fn remote_config_payload(&self, flag_key: &str) -> Result<Option<serde_json::Value>>;
}

/// Flags evaluated by the server for one context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteFlags {
    /// Flag key to result.
    pub flags: HashMap<String, RemoteFlag>,
    /// The server failed to compute some flags. Those are missing from `flags`.
    pub errors_while_computing_flags: bool,
    /// Server request id, useful when reporting problems.
    pub request_id: Option<String>,
}

/// One flag evaluated by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFlag {
    /// Resulting value.
    pub value: FlagValue,
    /// Payload attached to the value.
    pub payload: Option<serde_json::Value>,
    /// Why the server chose this value. Only sent by newer servers.
    pub reason: Option<EvaluationReason>,
    /// Flag metadata. Only sent by newer servers.
    pub metadata: Option<FlagMetadata>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationReason {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub condition_index: Option<i64>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagMetadata {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct RemoteEvaluationRequest<'a> {
    token: &'a str,
    distinct_id: &'a str,
    groups: &'a HashMap<String, String>,
    person_properties: &'a Attributes,
    group_properties: &'a HashMap<String, Attributes>,
}

/// Remote evaluation response. Newer servers send `flags`; older ones send `featureFlags` and
/// `featureFlagPayloads`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteEvaluationResponse {
    #[serde(default)]
    flags: Option<HashMap<String, FlagDetail>>,
    #[serde(default)]
    feature_flags: Option<HashMap<String, FlagValue>>,
    #[serde(default)]
    feature_flag_payloads: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    errors_while_computing_flags: bool,
    #[serde(default)]
    quota_limited: Option<Vec<String>>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Deserialize)]
struct FlagDetail {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    variant: Option<String>,
    #[serde(default)]
    reason: Option<EvaluationReason>,
    #[serde(default)]
    metadata: Option<FlagMetadata>,
}

impl From<RemoteEvaluationResponse> for RemoteFlags {
    fn from(response: RemoteEvaluationResponse) -> Self {
        let quota_limited = response
            .quota_limited
            .iter()
            .flatten()
            .any(|limited| limited == FEATURE_FLAGS_QUOTA);
        if quota_limited {
            log::warn!(target: "flagpole",
                "feature flags quota exceeded, remote evaluation returned no flags");
            return RemoteFlags {
                request_id: response.request_id,
                ..Default::default()
            };
        }

        let flags = match (response.flags, response.feature_flags) {
            (Some(details), _) => details
                .into_iter()
                .map(|(key, detail)| {
                    let value = match detail.variant {
                        Some(variant) if detail.enabled => FlagValue::Variant(variant),
                        _ => FlagValue::Boolean(detail.enabled),
                    };
                    let payload = detail
                        .metadata
                        .as_ref()
                        .and_then(|metadata| metadata.payload.clone())
                        .map(decode_payload);
                    let flag = RemoteFlag {
                        value,
                        payload,
                        reason: detail.reason,
                        metadata: detail.metadata,
                    };
                    (key, flag)
                })
                .collect(),
            (None, Some(values)) => {
                let mut payloads = response.feature_flag_payloads.unwrap_or_default();
                values
                    .into_iter()
                    .map(|(key, value)| {
                        let flag = RemoteFlag {
                            value,
                            payload: payloads.remove(&key).map(decode_payload),
                            reason: None,
                            metadata: None,
                        };
                        (key, flag)
                    })
                    .collect()
            }
            (None, None) => HashMap::new(),
        };

        RemoteFlags {
            flags,
            errors_while_computing_flags: response.errors_while_computing_flags,
            request_id: response.request_id,
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct HttpRemoteEvaluatorConfig {
    pub host: String,
    pub project_token: String,
    /// Needed for remote config payloads only.
    pub personal_api_key: Option<String>,
    pub timeout: Duration,
}

/// [`RemoteEvaluator`] talking to the flags HTTP API.
pub struct HttpRemoteEvaluator {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    flags_url: Url,
    /// `{host}/api/projects/@current/feature_flags/`. The flag key is appended as a path segment.
    remote_config_base: Url,
    project_token: String,
    personal_api_key: Option<String>,
}

impl HttpRemoteEvaluator {
    /// Create an evaluator.
    ///
    /// # Errors
    ///
    /// Fails if `host` is not a valid URL or the HTTP client cannot be initialized.
    pub fn new(config: HttpRemoteEvaluatorConfig) -> Result<HttpRemoteEvaluator> {
        let host = config.host.trim_end_matches('/').to_owned();
        let flags_url = Url::parse_with_params(&format!("{host}{FLAGS_ENDPOINT}"), &[("v", "2")])
            .map_err(Error::InvalidBaseUrl)?;
        let remote_config_base = Url::parse(&format!("{host}{REMOTE_CONFIG_ENDPOINT}"))
            .map_err(Error::InvalidBaseUrl)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(HttpRemoteEvaluator {
            client,
            flags_url,
            remote_config_base,
            project_token: config.project_token,
            personal_api_key: config.personal_api_key,
        })
    }
}

impl RemoteEvaluator for HttpRemoteEvaluator {
    fn evaluate_flags(&self, context: &EvaluationContext) -> Result<RemoteFlags> {
        let request = RemoteEvaluationRequest {
            token: &self.project_token,
            distinct_id: &context.distinct_id,
            groups: &context.groups,
            person_properties: &context.person_properties,
            group_properties: &context.group_properties,
        };

        log::debug!(target: "flagpole",
            distinct_id = context.distinct_id.as_str();
            "evaluating flags remotely");
        let response = self
            .client
            .post(self.flags_url.clone())
            .header(USER_AGENT, SDK_USER_AGENT)
            .json(&request)
            .send()?;

        let response: RemoteEvaluationResponse = read_json(response)?;
        Ok(response.into())
    }

    fn remote_config_payload(&self, flag_key: &str) -> Result<Option<serde_json::Value>> {
        let Some(personal_api_key) = &self.personal_api_key else {
            return Err(Error::LocalEvaluationDisabled);
        };
        let mut url = self.remote_config_base.clone();
        url.path_segments_mut()
            .map_err(|()| {
                Error::InvalidBaseUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase)
            })?
            .pop_if_empty()
            .push(flag_key)
            .push("remote_config");
        url.query_pairs_mut()
            .append_pair("token", &self.project_token);

        log::debug!(target: "flagpole", flag_key; "fetching remote config payload");
        let response = self
            .client
            .get(url)
            .bearer_auth(personal_api_key)
            .header(USER_AGENT, SDK_USER_AGENT)
            .send()?;

        let payload: serde_json::Value = read_json(response)?;
        Ok(match payload {
            serde_json::Value::Null => None,
            payload => Some(decode_payload(payload)),
        })
    }
}

/// Read a JSON body, turning non-2xx statuses and unparseable bodies into errors.
fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::blocking::Response) -> Result<T> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(Error::Unauthorized);
    }
    let body = response.text()?;
    if !status.is_success() {
        log::warn!(target: "flagpole",
            status = status.as_u16();
            "received unexpected response from flags API");
        return Err(Error::UnexpectedStatus {
            status: status.as_u16(),
            body,
        });
    }
    serde_json::from_str(&body).map_err(|err| Error::MalformedResponse {
        status: status.as_u16(),
        message: err.to_string(),
        body,
    })
}

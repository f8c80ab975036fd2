//! An HTTP client that fetches flag definitions for local evaluation.
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use reqwest::{
    header::{ETAG, IF_NONE_MATCH, USER_AGENT},
    StatusCode, Url,
};

use crate::{models::LocalEvaluationResponse, Error, Result};

pub(crate) const SDK_USER_AGENT: &str = concat!("flagpole-rust/", env!("CARGO_PKG_VERSION"));

const LOCAL_EVALUATION_ENDPOINT: &str = "/api/feature_flag/local_evaluation/";

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct DefinitionsFetcherConfig {
    pub host: String,
    /// Public project token. Identifies the project.
    pub project_token: String,
    /// Private key authorizing access to flag definitions.
    pub personal_api_key: String,
    /// Ask the server to include cohort definitions.
    pub send_cohorts: bool,
    pub timeout: Duration,
}

/// Result of one successful round trip to the definitions endpoint.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The server sent new definitions.
    Modified {
        #[allow(missing_docs)]
        response: LocalEvaluationResponse,
        #[allow(missing_docs)]
        etag: Option<String>,
    },
    /// `304 Not Modified`. The server may still rotate the entity tag.
    NotModified {
        #[allow(missing_docs)]
        etag: Option<String>,
    },
    /// `402 Payment Required`: the project is over its feature flags quota.
    QuotaLimited,
}

/// A client that fetches flag definitions from the server.
pub struct DefinitionsFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    url: Url,
    personal_api_key: String,
    /// If we receive a 401 Unauthorized error during a request, it means the personal API key is
    /// not valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl DefinitionsFetcher {
    /// Create a fetcher.
    ///
    /// # Errors
    ///
    /// Fails if `host` is not a valid URL or the HTTP client cannot be initialized.
    pub fn new(config: DefinitionsFetcherConfig) -> Result<DefinitionsFetcher> {
        let mut url = Url::parse_with_params(
            &format!(
                "{}{}",
                config.host.trim_end_matches('/'),
                LOCAL_EVALUATION_ENDPOINT
            ),
            &[("token", &*config.project_token)],
        )
        .map_err(Error::InvalidBaseUrl)?;
        if config.send_cohorts {
            url.query_pairs_mut().append_key_only("send_cohorts");
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(DefinitionsFetcher {
            client,
            url,
            personal_api_key: config.personal_api_key,
            unauthorized: AtomicBool::new(false),
        })
    }

    /// Fetch definitions, conditionally on `etag` if given.
    ///
    /// # Errors
    ///
    /// - [`Error::Unauthorized`] if the personal API key was rejected, now or on an earlier call.
    /// - [`Error::UnexpectedStatus`] for statuses other than 2xx, 304, 401 and 402.
    /// - [`Error::MalformedResponse`] if the body is not a definitions payload.
    /// - [`Error::Network`] for transport failures.
    pub fn fetch(&self, etag: Option<&str>) -> Result<FetchOutcome> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        log::debug!(target: "flagpole", "fetching flag definitions");
        let mut request = self
            .client
            .get(self.url.clone())
            .bearer_auth(&self.personal_api_key)
            .header(USER_AGENT, SDK_USER_AGENT);
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        let response = request.send()?;

        let status = response.status();
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        match status {
            StatusCode::NOT_MODIFIED => {
                log::debug!(target: "flagpole", "flag definitions not modified");
                Ok(FetchOutcome::NotModified { etag })
            }
            StatusCode::PAYMENT_REQUIRED => {
                log::warn!(target: "flagpole",
                    "feature flags quota exceeded, local evaluation is disabled until quota resets");
                Ok(FetchOutcome::QuotaLimited)
            }
            StatusCode::UNAUTHORIZED => {
                log::warn!(target: "flagpole",
                    "client is not authorized. Check your personal API key");
                self.unauthorized.store(true, Ordering::Relaxed);
                Err(Error::Unauthorized)
            }
            status if status.is_success() => {
                let body = response.text()?;
                let response = serde_json::from_str(&body).map_err(|err| {
                    Error::MalformedResponse {
                        status: status.as_u16(),
                        message: err.to_string(),
                        body,
                    }
                })?;
                log::debug!(target: "flagpole", "successfully fetched flag definitions");
                Ok(FetchOutcome::Modified { response, etag })
            }
            status => {
                let body = response.text().unwrap_or_default();
                log::warn!(target: "flagpole",
                    status = status.as_u16();
                    "received unexpected response while fetching flag definitions");
                Err(Error::UnexpectedStatus {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

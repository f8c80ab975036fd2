use std::{sync::Arc, time::Duration};

use crate::{
    error_handler::NoopErrorHandler, fetcher::DefinitionsFetcherConfig,
    remote::HttpRemoteEvaluatorConfig, Client, ErrorHandler, PollerThreadConfig, Result,
};

/// Configuration for [`Client`].
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use flagpole::ClientConfig;
/// let client = ClientConfig::from_project_token("phc_token")
///     .personal_api_key("phx_personal_key")
///     .host("https://flags.internal.example")
///     .poll_interval(Duration::from_secs(60))
///     .on_error(|err: &flagpole::Error| eprintln!("feature flags: {err}"))
///     .to_client()?;
/// # Ok::<(), flagpole::Error>(())
/// ```
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) project_token: String,
    pub(crate) personal_api_key: Option<String>,
    pub(crate) host: String,
    pub(crate) poller: PollerThreadConfig,
    pub(crate) request_timeout: Duration,
    pub(crate) definitions_timeout: Duration,
    pub(crate) send_cohorts: bool,
    pub(crate) error_handler: Arc<dyn ErrorHandler + Send + Sync>,
}

impl ClientConfig {
    /// Default host for API calls.
    pub const DEFAULT_HOST: &'static str = "http://localhost:8000";

    /// Default timeout for remote evaluation requests.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

    /// Default timeout for flag definitions requests.
    pub const DEFAULT_DEFINITIONS_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a default configuration using the specified project token.
    ///
    /// Without a personal API key, every evaluation is remote.
    ///
    /// ```
    /// # use flagpole::ClientConfig;
    /// ClientConfig::from_project_token("phc_token");
    /// ```
    pub fn from_project_token(project_token: impl Into<String>) -> Self {
        ClientConfig {
            project_token: project_token.into(),
            personal_api_key: None,
            host: ClientConfig::DEFAULT_HOST.to_owned(),
            poller: PollerThreadConfig::default(),
            request_timeout: ClientConfig::DEFAULT_REQUEST_TIMEOUT,
            definitions_timeout: ClientConfig::DEFAULT_DEFINITIONS_TIMEOUT,
            send_cohorts: true,
            error_handler: Arc::new(NoopErrorHandler),
        }
    }

    /// Set the personal API key. Enables local evaluation.
    pub fn personal_api_key(mut self, personal_api_key: impl Into<String>) -> Self {
        self.personal_api_key = Some(personal_api_key.into());
        self
    }

    /// Override host for API calls.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Interval between flag definitions refreshes.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poller = self.poller.with_interval(interval);
        self
    }

    /// Maximum random reduction of each poll interval.
    pub fn poll_jitter(mut self, jitter: Duration) -> Self {
        self.poller = self.poller.with_jitter(jitter);
        self
    }

    /// Timeout for remote evaluation and remote config requests.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Timeout for flag definitions requests.
    pub fn definitions_timeout(mut self, timeout: Duration) -> Self {
        self.definitions_timeout = timeout;
        self
    }

    /// Whether to request cohort definitions along with flags. Enabled by default.
    pub fn send_cohorts(mut self, send_cohorts: bool) -> Self {
        self.send_cohorts = send_cohorts;
        self
    }

    /// Set the handler receiving transport errors.
    pub fn on_error(mut self, error_handler: impl ErrorHandler + Send + Sync + 'static) -> Self {
        self.error_handler = Arc::new(error_handler);
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// # Errors
    ///
    /// Fails if the host is not a valid URL or an HTTP client cannot be initialized.
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }

    pub(crate) fn definitions_fetcher_config(&self) -> Option<DefinitionsFetcherConfig> {
        let personal_api_key = self.personal_api_key.clone()?;
        Some(DefinitionsFetcherConfig {
            host: self.host.clone(),
            project_token: self.project_token.clone(),
            personal_api_key,
            send_cohorts: self.send_cohorts,
            timeout: self.definitions_timeout,
        })
    }

    pub(crate) fn remote_evaluator_config(&self) -> HttpRemoteEvaluatorConfig {
        HttpRemoteEvaluatorConfig {
            host: self.host.clone(),
            project_token: self.project_token.clone(),
            personal_api_key: self.personal_api_key.clone(),
            timeout: self.request_timeout,
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("local_evaluation", &self.personal_api_key.is_some())
            .field("poller", &self.poller)
            .field("request_timeout", &self.request_timeout)
            .field("send_cohorts", &self.send_cohorts)
            .finish_non_exhaustive()
    }
}

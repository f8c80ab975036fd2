use std::{collections::HashMap, sync::Arc};

use chrono::Utc;

use crate::{
    fetcher::DefinitionsFetcher,
    hasher::Sha1Hasher,
    poller_thread::{self, PollerThread, RefreshOutcome},
    remote::{HttpRemoteEvaluator, RemoteEvaluator, RemoteFlag},
    ClientConfig, Error, EvaluationContext, EvaluationResult, FlagSnapshot, FlagValue, Result,
    SnapshotStore,
};

/// Where a flag value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationSource {
    /// Decided from the local snapshot.
    Local,
    /// Decided by the remote evaluation service.
    Remote,
}

/// A flag value with its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagResult {
    /// Resulting value.
    pub value: FlagValue,
    /// Payload attached to the value.
    pub payload: Option<serde_json::Value>,
    /// Where the value came from.
    pub source: EvaluationSource,
}

impl From<RemoteFlag> for FlagResult {
    fn from(flag: RemoteFlag) -> Self {
        FlagResult {
            value: flag.value,
            payload: flag.payload,
            source: EvaluationSource::Remote,
        }
    }
}

/// A feature flags client.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// # Poller Thread
///
/// With a personal API key configured, flags are evaluated locally against definitions fetched
/// by a poller thread. Start it by calling [`Client::start_poller_thread()`]. It's also
/// recommended to call [`PollerThread::wait_for_configuration`] before evaluating flags, as until
/// then every evaluation goes to the server.
///
/// # Examples
/// ```no_run
/// # use flagpole::{ClientConfig, EvaluationContext};
/// let client = ClientConfig::from_project_token("phc_token")
///     .personal_api_key("phx_personal_key")
///     .to_client()?;
/// let poller = client.start_poller_thread()?;
/// poller.wait_for_configuration()?;
///
/// let context = EvaluationContext::new("user-1").with_person_property("plan", "pro");
/// if client.is_feature_enabled("new-checkout", &context).unwrap_or(false) {
///     // ...
/// }
/// # Ok::<(), flagpole::Error>(())
/// ```
pub struct Client {
    config: ClientConfig,
    store: Arc<SnapshotStore>,
    fetcher: Option<Arc<DefinitionsFetcher>>,
    remote: Box<dyn RemoteEvaluator + Send + Sync>,
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// # Errors
    ///
    /// Fails if the host is not a valid URL or an HTTP client cannot be initialized.
    pub fn new(config: ClientConfig) -> Result<Client> {
        let remote = HttpRemoteEvaluator::new(config.remote_evaluator_config())?;
        Client::new_with_remote_evaluator(config, remote)
    }

    /// Create a new `Client` that sends remote evaluations to `remote` instead of the flags HTTP
    /// API.
    ///
    /// # Errors
    ///
    /// Fails if the host is not a valid URL or an HTTP client cannot be initialized.
    pub fn new_with_remote_evaluator(
        config: ClientConfig,
        remote: impl RemoteEvaluator + Send + Sync + 'static,
    ) -> Result<Client> {
        let fetcher = config
            .definitions_fetcher_config()
            .map(DefinitionsFetcher::new)
            .transpose()?
            .map(Arc::new);

        Ok(Client {
            config,
            store: Arc::new(SnapshotStore::new()),
            fetcher,
            remote: Box::new(remote),
        })
    }

    #[cfg(test)]
    fn new_with_snapshot_store(
        config: ClientConfig,
        store: Arc<SnapshotStore>,
        remote: impl RemoteEvaluator + Send + Sync + 'static,
    ) -> Client {
        Client {
            config,
            store,
            fetcher: None,
            remote: Box::new(remote),
        }
    }

    /// Evaluate flag `flag_key` for `context`.
    ///
    /// The flag is evaluated locally first. If the local snapshot cannot decide (including when
    /// the flag is not in the snapshot), the remote service is asked, unless `only_local` is set.
    ///
    /// Returns `None` if no value could be determined: the flag is unknown, local evaluation was
    /// inconclusive with `only_local`, the project is quota limited, or the remote call failed.
    /// Remote failures are passed to the configured error handler.
    ///
    /// # Examples
    ///
    /// ```
    /// # fn test(client: &flagpole::Client) {
    /// # use flagpole::EvaluationContext;
    /// let variant = client
    ///     .evaluate_flag("checkout-experiment", &EvaluationContext::new("user-1"), false)
    ///     .and_then(|result| result.value.as_variant().map(str::to_owned))
    ///     .unwrap_or_else(|| "control".to_owned());
    /// # }
    /// ```
    pub fn evaluate_flag(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
        only_local: bool,
    ) -> Option<FlagResult> {
        let snapshot = self.store.get_snapshot();
        if snapshot.quota_limited {
            log::debug!(target: "flagpole", flag_key; "project is quota limited, returning no value");
            return None;
        }

        let context = context.augmented();
        match snapshot
            .definitions
            .evaluate_flag(flag_key, &context, &Sha1Hasher, Utc::now())
        {
            EvaluationResult::Matched { value, payload } => {
                return Some(FlagResult {
                    value,
                    payload,
                    source: EvaluationSource::Local,
                })
            }
            EvaluationResult::Inconclusive(reason) => {
                log::debug!(target: "flagpole", flag_key; "local evaluation inconclusive: {reason}");
            }
            EvaluationResult::RequiresServerEvaluation(reason) => {
                log::debug!(target: "flagpole", flag_key; "flag requires server evaluation: {reason}");
            }
        }

        if only_local {
            return None;
        }

        let mut remote = self.evaluate_remotely(&context)?;
        remote.remove(flag_key)
    }

    /// Evaluate all flags for `context`.
    ///
    /// If the local snapshot decides every flag, the local results are returned. Otherwise
    /// (including when the snapshot is empty) the remote result set replaces the local one
    /// entirely, unless `only_local` is set, in which case undecided flags are left out.
    ///
    /// If the remote call fails, the locally decided flags are returned.
    pub fn evaluate_all_flags(
        &self,
        context: &EvaluationContext,
        only_local: bool,
    ) -> HashMap<String, FlagResult> {
        let snapshot = self.store.get_snapshot();
        if snapshot.quota_limited {
            log::debug!(target: "flagpole", "project is quota limited, returning no flags");
            return HashMap::new();
        }

        let context = context.augmented();
        let evaluated = snapshot
            .definitions
            .evaluate_all_flags(&context, &Sha1Hasher, Utc::now());

        let mut fallback = evaluated.is_empty();
        let mut results = HashMap::with_capacity(evaluated.len());
        for (flag_key, result) in evaluated {
            match result {
                EvaluationResult::Matched { value, payload } => {
                    results.insert(
                        flag_key,
                        FlagResult {
                            value,
                            payload,
                            source: EvaluationSource::Local,
                        },
                    );
                }
                _ => fallback = true,
            }
        }

        if fallback && !only_local {
            if let Some(remote) = self.evaluate_remotely(&context) {
                return remote;
            }
        }
        results
    }

    /// Return whether flag `flag_key` is enabled for `context`.
    ///
    /// A variant counts as enabled. Returns `None` if no value could be determined.
    pub fn is_feature_enabled(&self, flag_key: &str, context: &EvaluationContext) -> Option<bool> {
        self.evaluate_flag(flag_key, context, false)
            .map(|result| result.value.is_enabled())
    }

    /// Return the payload of the value flag `flag_key` evaluates to for `context`.
    pub fn get_feature_flag_payload(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
    ) -> Option<serde_json::Value> {
        self.evaluate_flag(flag_key, context, false)?.payload
    }

    /// Fetch the remote config payload of flag `flag_key`.
    ///
    /// Requires a personal API key. Failures are passed to the error handler and yield `None`.
    pub fn get_remote_config_payload(&self, flag_key: &str) -> Option<serde_json::Value> {
        match self.remote.remote_config_payload(flag_key) {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!(target: "flagpole", flag_key; "failed to fetch remote config payload: {err}");
                self.config.error_handler.on_error(&err);
                None
            }
        }
    }

    /// Evaluate flag `flag_key` against the local snapshot only, returning the detailed result.
    pub fn evaluate_flag_locally(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
    ) -> EvaluationResult {
        self.store.get_snapshot().definitions.evaluate_flag(
            flag_key,
            &context.augmented(),
            &Sha1Hasher,
            Utc::now(),
        )
    }

    /// Return the currently active snapshot of flag definitions.
    pub fn feature_flag_definitions(&self) -> Arc<FlagSnapshot> {
        self.store.get_snapshot()
    }

    /// Refresh flag definitions now, on the calling thread.
    ///
    /// Refresh failures are passed to the error handler and reported as
    /// [`RefreshOutcome::Failed`].
    ///
    /// # Errors
    ///
    /// - [`Error::LocalEvaluationDisabled`] if no personal API key is configured.
    pub fn reload_feature_flags(&self) -> Result<RefreshOutcome> {
        let fetcher = self.fetcher.as_ref().ok_or(Error::LocalEvaluationDisabled)?;
        let outcome = poller_thread::refresh(fetcher, &self.store);
        match &outcome {
            RefreshOutcome::Failed(err) => self.config.error_handler.on_error(err),
            RefreshOutcome::QuotaLimited => self.config.error_handler.on_error(&Error::QuotaLimited),
            RefreshOutcome::Installed | RefreshOutcome::Unchanged => {}
        }
        Ok(outcome)
    }

    /// Start a poller thread to fetch flag definitions from the server.
    ///
    /// # Errors
    ///
    /// - [`Error::LocalEvaluationDisabled`] if no personal API key is configured.
    /// - [`Error::Io`] if the thread cannot be spawned.
    pub fn start_poller_thread(&self) -> Result<PollerThread> {
        let fetcher = self.fetcher.clone().ok_or(Error::LocalEvaluationDisabled)?;
        Ok(PollerThread::start_with_config(
            fetcher,
            self.store.clone(),
            self.config.error_handler.clone(),
            self.config.poller.clone(),
        )?)
    }

    /// `true` once the first refresh attempt has completed, or right away when local evaluation
    /// is disabled.
    pub fn is_ready(&self) -> bool {
        self.fetcher.is_none() || self.store.is_refreshed()
    }

    fn evaluate_remotely(&self, context: &EvaluationContext) -> Option<HashMap<String, FlagResult>> {
        match self.remote.evaluate_flags(context) {
            Ok(remote) => {
                if remote.errors_while_computing_flags {
                    log::warn!(target: "flagpole",
                        request_id:? = remote.request_id;
                        "server reported errors while computing flags");
                }
                Some(
                    remote
                        .flags
                        .into_iter()
                        .map(|(key, flag)| (key, flag.into()))
                        .collect(),
                )
            }
            Err(err) => {
                log::warn!(target: "flagpole", "remote flag evaluation failed: {err}");
                self.config.error_handler.on_error(&err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    use proptest::prelude::*;
    use serde_json::json;

    use super::{Client, EvaluationSource, FlagResult};
    use crate::{
        models::LocalEvaluationResponse,
        remote::{RemoteEvaluator, RemoteFlag, RemoteFlags},
        ClientConfig, Error, EvaluationContext, FlagSnapshot, FlagValue, Result, SnapshotStore,
    };

    #[derive(Clone, Default)]
    struct StubRemote {
        flags: Option<RemoteFlags>,
        calls: Arc<AtomicUsize>,
        contexts: Arc<Mutex<Vec<EvaluationContext>>>,
    }

    impl StubRemote {
        fn returning(flags: impl IntoIterator<Item = (&'static str, FlagValue)>) -> StubRemote {
            let flags = flags
                .into_iter()
                .map(|(key, value)| {
                    (
                        key.to_owned(),
                        RemoteFlag {
                            value,
                            payload: None,
                            reason: None,
                            metadata: None,
                        },
                    )
                })
                .collect();
            StubRemote {
                flags: Some(RemoteFlags {
                    flags,
                    ..Default::default()
                }),
                ..Default::default()
            }
        }

        fn empty() -> StubRemote {
            StubRemote {
                flags: Some(RemoteFlags::default()),
                ..Default::default()
            }
        }

        fn failing() -> StubRemote {
            StubRemote::default()
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RemoteEvaluator for StubRemote {
        fn evaluate_flags(&self, context: &EvaluationContext) -> Result<RemoteFlags> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.contexts.lock().unwrap().push(context.clone());
            self.flags.clone().ok_or(Error::UnexpectedStatus {
                status: 500,
                body: String::new(),
            })
        }

        fn remote_config_payload(&self, _flag_key: &str) -> Result<Option<serde_json::Value>> {
            Ok(Some(json!({"remote": true})))
        }
    }

    fn store_with(value: serde_json::Value) -> Arc<SnapshotStore> {
        let response: LocalEvaluationResponse = serde_json::from_value(value).unwrap();
        let store = Arc::new(SnapshotStore::new());
        store.set_snapshot(Arc::new(FlagSnapshot::from_response(response, None)));
        store
    }

    fn definitions() -> serde_json::Value {
        json!({"flags": [
            {
                "key": "person-flag",
                "active": true,
                "filters": {
                    "groups": [{
                        "properties": [{"key": "region", "operator": "exact", "value": ["USA"], "type": "person"}],
                        "rollout_percentage": 100,
                    }],
                    "payloads": {"true": "{\"banner\": \"usa\"}"},
                },
            },
            {
                "key": "needs-email",
                "active": true,
                "filters": {"groups": [{
                    "properties": [{"key": "email", "operator": "icontains", "value": "@corp.com"}],
                }]},
            },
        ]})
    }

    fn client(store: Arc<SnapshotStore>, remote: StubRemote) -> Client {
        Client::new_with_snapshot_store(ClientConfig::from_project_token("token"), store, remote)
    }

    fn usa() -> EvaluationContext {
        EvaluationContext::new("some-distinct-id").with_person_property("region", "USA")
    }

    #[test]
    fn decisive_local_result_skips_remote() {
        let remote = StubRemote::returning([("person-flag", FlagValue::Boolean(false))]);
        let client = client(store_with(definitions()), remote.clone());

        assert_eq!(
            client.evaluate_flag("person-flag", &usa(), false),
            Some(FlagResult {
                value: FlagValue::Boolean(true),
                payload: Some(json!({"banner": "usa"})),
                source: EvaluationSource::Local,
            })
        );
        assert_eq!(remote.calls(), 0);
    }

    #[test]
    fn inconclusive_local_result_falls_back_to_remote() {
        let remote = StubRemote::returning([("needs-email", FlagValue::from("variant-b"))]);
        let client = client(store_with(definitions()), remote.clone());

        let result = client.evaluate_flag("needs-email", &usa(), false).unwrap();

        assert_eq!(result.value, FlagValue::Variant("variant-b".to_owned()));
        assert_eq!(result.source, EvaluationSource::Remote);
        assert_eq!(remote.calls(), 1);
    }

    #[test]
    fn only_local_never_calls_remote() {
        let remote = StubRemote::returning([("needs-email", FlagValue::Boolean(true))]);
        let client = client(store_with(definitions()), remote.clone());

        assert_eq!(client.evaluate_flag("needs-email", &usa(), true), None);
        assert_eq!(client.evaluate_flag("unknown", &usa(), true), None);
        assert!(!client.evaluate_all_flags(&usa(), true).contains_key("needs-email"));
        assert_eq!(remote.calls(), 0);
    }

    #[test]
    fn unknown_flag_asks_remote() {
        let remote = StubRemote::returning([("server-only", FlagValue::Boolean(true))]);
        let client = client(store_with(definitions()), remote.clone());

        assert_eq!(client.is_feature_enabled("server-only", &usa()), Some(true));
        assert_eq!(client.is_feature_enabled("nowhere", &usa()), None);
        assert_eq!(remote.calls(), 2);
    }

    #[test]
    fn remote_receives_augmented_context() {
        let remote = StubRemote::empty();
        let client = client(store_with(definitions()), remote.clone());

        client.evaluate_flag(
            "needs-email",
            &EvaluationContext::new("user-1").with_group("company", "acme"),
            false,
        );

        let contexts = remote.contexts.lock().unwrap();
        assert_eq!(
            contexts[0].person_properties.get("distinct_id"),
            Some(&"user-1".into())
        );
        assert_eq!(
            contexts[0].group_properties["company"].get("$group_key"),
            Some(&"acme".into())
        );
    }

    #[test]
    fn mutual_dependency_cycle_has_no_local_value() {
        let depends_on = |key: &str, dependency: &str| {
            json!({
                "key": key,
                "active": true,
                "filters": {"groups": [{
                    "properties": [{
                        "key": dependency,
                        "type": "flag",
                        "operator": "flag_evaluates_to",
                        "value": true,
                        "dependency_chain": [],
                    }],
                    "rollout_percentage": 100,
                }]},
            })
        };
        let remote = StubRemote::returning([("flag-a", FlagValue::Boolean(true))]);
        let client = client(
            store_with(json!({"flags": [
                depends_on("flag-a", "flag-b"),
                depends_on("flag-b", "flag-a"),
            ]})),
            remote.clone(),
        );

        assert_eq!(client.evaluate_flag("flag-a", &usa(), true), None);
        assert_eq!(client.evaluate_flag("flag-b", &usa(), true), None);
        assert!(client.evaluate_all_flags(&usa(), true).is_empty());
        assert_eq!(remote.calls(), 0);
        assert_eq!(
            client.evaluate_flag("flag-a", &usa(), false).map(|r| r.source),
            Some(EvaluationSource::Remote)
        );
    }

    #[test]
    fn quota_limited_snapshot_returns_nothing() {
        let store = Arc::new(SnapshotStore::new());
        store.set_snapshot(Arc::new(FlagSnapshot::quota_limited()));
        let remote = StubRemote::returning([("person-flag", FlagValue::Boolean(true))]);
        let client = client(store, remote.clone());

        assert_eq!(client.evaluate_flag("person-flag", &usa(), false), None);
        assert!(client.evaluate_all_flags(&usa(), false).is_empty());
        assert_eq!(remote.calls(), 0);
    }

    #[test]
    fn remote_failure_is_reported_and_yields_none() {
        let errors = Arc::new(AtomicUsize::new(0));
        let config = {
            let errors = errors.clone();
            ClientConfig::from_project_token("token").on_error(move |_: &Error| {
                errors.fetch_add(1, Ordering::SeqCst);
            })
        };
        let client =
            Client::new_with_snapshot_store(config, store_with(definitions()), StubRemote::failing());

        assert_eq!(client.evaluate_flag("needs-email", &usa(), false), None);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn all_flags_local_when_everything_is_decided() {
        let remote = StubRemote::empty();
        let client = client(store_with(definitions()), remote.clone());
        let context = usa().with_person_property("email", "a@corp.com");

        let results = client.evaluate_all_flags(&context, false);

        assert_eq!(results.len(), 2);
        assert!(results.values().all(|r| r.source == EvaluationSource::Local));
        assert_eq!(remote.calls(), 0);
    }

    #[test]
    fn all_flags_replaced_by_remote_when_anything_is_undecided() {
        let remote = StubRemote::returning([
            ("needs-email", FlagValue::Boolean(true)),
            ("server-only", FlagValue::from("b")),
        ]);
        let client = client(store_with(definitions()), remote.clone());

        let results = client.evaluate_all_flags(&usa(), false);

        let mut keys: Vec<_> = results.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["needs-email", "server-only"]);
        assert!(results.values().all(|r| r.source == EvaluationSource::Remote));
    }

    #[test]
    fn all_flags_keep_local_results_when_remote_fails() {
        let client = client(store_with(definitions()), StubRemote::failing());

        let results = client.evaluate_all_flags(&usa(), false);

        assert_eq!(results.len(), 1);
        assert_eq!(results["person-flag"].value, FlagValue::Boolean(true));
    }

    #[test]
    fn empty_snapshot_goes_remote() {
        let remote = StubRemote::returning([("a", FlagValue::Boolean(true))]);
        let client = client(Arc::new(SnapshotStore::new()), remote.clone());

        assert_eq!(client.evaluate_all_flags(&usa(), false).len(), 1);
        assert_eq!(remote.calls(), 1);
    }

    #[test]
    fn no_personal_key_disables_local_evaluation_management() {
        let client = client(Arc::new(SnapshotStore::new()), StubRemote::failing());

        assert!(client.is_ready());
        assert!(matches!(
            client.start_poller_thread(),
            Err(Error::LocalEvaluationDisabled)
        ));
        assert!(matches!(
            client.reload_feature_flags(),
            Err(Error::LocalEvaluationDisabled)
        ));
    }

    #[test]
    fn remote_config_payload_is_passed_through() {
        let client = client(Arc::new(SnapshotStore::new()), StubRemote::failing());
        assert_eq!(
            client.get_remote_config_payload("config-flag"),
            Some(json!({"remote": true}))
        );
    }

    proptest! {
        #[test]
        fn partial_local_results_are_fully_replaced(
            remote_flags in proptest::collection::hash_map("[a-z]{1,8}", any::<bool>(), 0..8),
        ) {
            let remote = StubRemote {
                flags: Some(RemoteFlags {
                    flags: remote_flags
                        .iter()
                        .map(|(key, enabled)| {
                            (key.clone(), RemoteFlag {
                                value: FlagValue::Boolean(*enabled),
                                payload: None,
                                reason: None,
                                metadata: None,
                            })
                        })
                        .collect(),
                    ..Default::default()
                }),
                ..Default::default()
            };
            let client = client(store_with(definitions()), remote);

            let results = client.evaluate_all_flags(&usa(), false);

            let expected: HashMap<String, FlagValue> = remote_flags
                .into_iter()
                .map(|(key, enabled)| (key, FlagValue::Boolean(enabled)))
                .collect();
            let actual: HashMap<String, FlagValue> = results
                .into_iter()
                .map(|(key, result)| (key, result.value))
                .collect();
            prop_assert_eq!(actual, expected);
        }
    }
}

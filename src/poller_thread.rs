//! A background poller thread that periodically requests flag definitions from the server and
//! stores them in a snapshot store.
use std::{
    sync::{mpsc::RecvTimeoutError, Arc, Condvar, Mutex},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{
    error_handler::ErrorHandler, fetcher::DefinitionsFetcher, snapshot_store::SnapshotStore,
    Error, Result,
};

/// Configuration for [`PollerThread`].
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub struct PollerThreadConfig {
    /// Interval to wait between requests for flag definitions.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_INTERVAL`].
    pub interval: Duration,
    /// Jitter applies a randomized duration to wait between requests. This helps to avoid
    /// multiple server instances synchronizing and producing spiky network load.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_JITTER`].
    pub jitter: Duration,
}

impl PollerThreadConfig {
    /// Default value for [`PollerThreadConfig::interval`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
    /// Default value for [`PollerThreadConfig::jitter`].
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);

    /// Create a new `PollerThreadConfig` using default configuration.
    pub fn new() -> PollerThreadConfig {
        PollerThreadConfig::default()
    }

    /// Update poll interval with `interval`.
    pub fn with_interval(mut self, interval: Duration) -> PollerThreadConfig {
        self.interval = interval;
        self
    }

    /// Update poll interval jitter with `jitter`.
    pub fn with_jitter(mut self, jitter: Duration) -> PollerThreadConfig {
        self.jitter = jitter;
        self
    }
}

impl Default for PollerThreadConfig {
    fn default() -> PollerThreadConfig {
        PollerThreadConfig {
            interval: PollerThreadConfig::DEFAULT_POLL_INTERVAL,
            jitter: PollerThreadConfig::DEFAULT_POLL_JITTER,
        }
    }
}

/// Result of one refresh cycle.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// New definitions were installed.
    Installed,
    /// The server reported no changes. The snapshot was kept.
    Unchanged,
    /// The project is over quota. An empty quota-limited snapshot was installed.
    QuotaLimited,
    /// The fetch failed. The previous snapshot is still active.
    Failed(Error),
}

/// Run one refresh cycle: fetch conditionally on the current entity tag and apply the outcome.
///
/// Failures leave the store untouched.
pub fn refresh(fetcher: &DefinitionsFetcher, store: &SnapshotStore) -> RefreshOutcome {
    let etag = store.get_snapshot().etag.clone();
    match fetcher.fetch(etag.as_deref()) {
        Ok(outcome) => store.apply(outcome),
        Err(err) => {
            log::warn!(target: "flagpole", "failed to refresh flag definitions: {err}");
            store.mark_refreshed();
            RefreshOutcome::Failed(err)
        }
    }
}

/// A flag definitions poller thread.
///
/// The poller thread polls the server periodically to fetch the latest definitions using
/// [`DefinitionsFetcher`] and stores them in [`SnapshotStore`].
pub struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,

    /// Holds `None` until the first refresh cycle completes. Afterwards holds the result of the
    /// latest cycle.
    result: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl PollerThread {
    /// Starts the poller thread with default configuration.
    ///
    /// # Errors
    ///
    /// This method can return the following errors:
    /// - IO Error if poller thread failed to start.
    pub fn start(
        fetcher: Arc<DefinitionsFetcher>,
        store: Arc<SnapshotStore>,
        error_handler: Arc<dyn ErrorHandler + Send + Sync>,
    ) -> std::io::Result<PollerThread> {
        PollerThread::start_with_config(fetcher, store, error_handler, PollerThreadConfig::default())
    }

    /// Starts the poller thread with the provided configuration.
    ///
    /// Refresh failures are passed to `error_handler`. A rejected personal API key stops the
    /// thread; other failures are retried on the next cycle.
    ///
    /// # Errors
    ///
    /// This method can return the following errors:
    /// - IO Error if poller thread failed to start.
    pub fn start_with_config(
        fetcher: Arc<DefinitionsFetcher>,
        store: Arc<SnapshotStore>,
        error_handler: Arc<dyn ErrorHandler + Send + Sync>,
        config: PollerThreadConfig,
    ) -> std::io::Result<PollerThread> {
        // Using `sync_channel` here as it makes `stop_sender` `Sync` (shareable between
        // threads). Buffer size of 1 should be enough for our use case as we're sending a stop
        // command, and we can simply `try_send()` and ignore if the buffer is full (another thread
        // has sent a stop command already).
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let result = Arc::new((Mutex::new(None), Condvar::new()));

        let join_handle = {
            // Cloning Arc for move into thread
            let result = Arc::clone(&result);
            let update_result = move |value| {
                if let Ok(mut slot) = result.0.lock() {
                    *slot = Some(value);
                }
                result.1.notify_all();
            };

            std::thread::Builder::new()
                .name("flagpole-poller".to_owned())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| loop {
                        match refresh(&fetcher, &store) {
                            RefreshOutcome::Installed | RefreshOutcome::Unchanged => {
                                update_result(Ok(()))
                            }
                            RefreshOutcome::QuotaLimited => {
                                error_handler.on_error(&Error::QuotaLimited);
                                update_result(Err(Error::QuotaLimited));
                            }
                            RefreshOutcome::Failed(err @ Error::Unauthorized) => {
                                // Unrecoverable
                                error_handler.on_error(&err);
                                update_result(Err(err));
                                return;
                            }
                            RefreshOutcome::Failed(err) => {
                                // Other errors are retriable.
                                error_handler.on_error(&err);
                                update_result(Err(err));
                            }
                        }

                        let timeout = jitter(config.interval, config.jitter);
                        match stop_receiver.recv_timeout(timeout) {
                            Err(RecvTimeoutError::Timeout) => {
                                // Timed out. Loop back to fetch new definitions.
                            }
                            Ok(()) => {
                                log::debug!(target: "flagpole", "poller thread received stop command");
                                return;
                            }
                            Err(RecvTimeoutError::Disconnected) => {
                                // When the other end of channel disconnects, calls to
                                // .recv_timeout() return immediately.
                                log::debug!(target: "flagpole", "poller thread received disconnected");
                                return;
                            }
                        }
                    }));

                    // If catch_unwind returns Err, it means a panic occurred.
                    if result.is_err() {
                        update_result(Err(Error::PollerThreadPanicked));
                    }
                })?
        };

        Ok(PollerThread {
            join_handle,
            stop_sender,
            result,
        })
    }

    /// Waits for the first refresh cycle to complete.
    ///
    /// # Errors
    ///
    /// Returns the error of the latest refresh cycle, if it failed. Notably:
    ///
    /// - [`Error::PollerThreadPanicked`]
    /// - [`Error::Unauthorized`]
    /// - [`Error::QuotaLimited`]
    ///
    /// # Example
    ///
    /// ```
    /// # fn test(poller_thread: flagpole::PollerThread) {
    /// match poller_thread.wait_for_configuration() {
    ///     Ok(()) => println!("Flag definitions fetched successfully."),
    ///     Err(err) => eprintln!("Cannot fetch flag definitions: {:?}", err),
    /// }
    /// # }
    /// ```
    pub fn wait_for_configuration(&self) -> Result<()> {
        let mut lock = self
            .result
            .0
            .lock()
            .map_err(|_| Error::PollerThreadPanicked)?;
        loop {
            match &*lock {
                Some(result) => {
                    return result.clone();
                }
                None => {
                    // Block waiting for the first cycle.
                    lock = self
                        .result
                        .1
                        .wait(lock)
                        .map_err(|_| Error::PollerThreadPanicked)?;
                }
            }
        }
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (thread exited) or the channel buffer is
        // full. Either way the thread is stopping or already stopped.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    ///
    /// If you don't need to wait for the thread to exit, use [`PollerThread::stop`] instead.
    ///
    /// # Errors
    ///
    /// - [`Error::PollerThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        // Send stop signal in case it wasn't sent before.
        self.stop();

        self.join_handle
            .join()
            .map_err(|_| Error::PollerThreadPanicked)?;

        Ok(())
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

#[cfg(test)]
mod jitter_tests {
    use std::time::Duration;

    #[test]
    fn jitter_is_subtractive() {
        let interval = Duration::from_secs(30);
        let jitter = Duration::from_secs(30);

        let result = super::jitter(interval, jitter);

        assert!(result <= interval, "{result:?} must be <= {interval:?}");
    }

    #[test]
    fn jitter_truncates_to_zero() {
        let interval = Duration::ZERO;
        let jitter = Duration::from_secs(30);

        let result = super::jitter(interval, jitter);

        assert_eq!(result, Duration::ZERO);
    }

    #[test]
    fn jitter_works_with_zero_jitter() {
        let interval = Duration::from_secs(30);
        let jitter = Duration::ZERO;

        let result = super::jitter(interval, jitter);

        assert_eq!(result, Duration::from_secs(30));
    }
}

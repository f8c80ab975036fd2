//! A thread-safe in-memory storage for the currently active [`FlagSnapshot`]. [`SnapshotStore`]
//! provides concurrent access for readers (flag evaluation) and writers (the poller thread or a
//! manual reload).
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};

use crate::{fetcher::FetchOutcome, poller_thread::RefreshOutcome, FlagSnapshot};

/// `SnapshotStore` provides a thread-safe (`Sync`) storage for flag definitions that allows
/// concurrent access for readers and writers.
///
/// `FlagSnapshot` itself is always immutable and can only be replaced completely.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshot: RwLock<Arc<FlagSnapshot>>,
    refreshed: AtomicBool,
}

impl SnapshotStore {
    /// Create a new store holding an empty snapshot.
    pub fn new() -> Self {
        SnapshotStore::default()
    }

    /// Get the currently active snapshot.
    ///
    /// The read lock is held only while cloning the `Arc`. Evaluation runs against the returned
    /// snapshot without holding any lock, and keeps using it even if a newer one is installed.
    pub fn get_snapshot(&self) -> Arc<FlagSnapshot> {
        // self.snapshot.read() should always return Ok(). Err() is possible only if the lock is
        // poisoned (writer panicked while holding the lock), which should never happen.
        let snapshot = self
            .snapshot
            .read()
            .expect("thread holding snapshot lock should not panic");

        snapshot.clone()
    }

    /// Install a new snapshot.
    pub fn set_snapshot(&self, snapshot: Arc<FlagSnapshot>) {
        let mut slot = self
            .snapshot
            .write()
            .expect("thread holding snapshot lock should not panic");

        *slot = snapshot;
    }

    /// `true` once at least one refresh attempt has completed, successful or not.
    pub fn is_refreshed(&self) -> bool {
        self.refreshed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_refreshed(&self) {
        self.refreshed.store(true, Ordering::Release);
    }

    /// Apply the outcome of a fetch to the active snapshot.
    ///
    /// - New definitions replace the snapshot.
    /// - "Not modified" keeps the definitions, adopting a new entity tag if the server sent one.
    /// - Quota limitation installs an empty, quota-limited snapshot and forgets the entity tag so
    ///   the next fetch is unconditional.
    pub fn apply(&self, outcome: FetchOutcome) -> RefreshOutcome {
        let refresh = match outcome {
            FetchOutcome::Modified { response, etag } => {
                let snapshot = FlagSnapshot::from_response(response, etag);
                log::debug!(target: "flagpole",
                    flags = snapshot.definitions.len();
                    "installing new flag definitions");
                self.set_snapshot(Arc::new(snapshot));
                RefreshOutcome::Installed
            }
            FetchOutcome::NotModified { etag } => {
                let current = self.get_snapshot();
                match etag {
                    Some(etag) if current.etag.as_deref() != Some(etag.as_str()) => {
                        self.set_snapshot(Arc::new(current.with_etag(etag)));
                    }
                    _ => {}
                }
                RefreshOutcome::Unchanged
            }
            FetchOutcome::QuotaLimited => {
                self.set_snapshot(Arc::new(FlagSnapshot::quota_limited()));
                RefreshOutcome::QuotaLimited
            }
        };
        self.mark_refreshed();
        refresh
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::SnapshotStore;
    use crate::{
        fetcher::FetchOutcome, models::LocalEvaluationResponse, poller_thread::RefreshOutcome,
    };

    fn response() -> LocalEvaluationResponse {
        serde_json::from_value(json!({"flags": [
            {"key": "a", "active": true, "filters": {}},
        ]}))
        .unwrap()
    }

    #[test]
    fn can_set_snapshot_from_another_thread() {
        let store = Arc::new(SnapshotStore::new());

        assert!(store.get_snapshot().definitions.is_empty());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.apply(FetchOutcome::Modified {
                    response: response(),
                    etag: None,
                })
            })
            .join();
        }

        assert_eq!(store.get_snapshot().definitions.len(), 1);
        assert!(store.is_refreshed());
    }

    #[test]
    fn readers_keep_their_snapshot_across_replacement() {
        let store = SnapshotStore::new();
        store.apply(FetchOutcome::Modified {
            response: response(),
            etag: Some("\"v1\"".to_owned()),
        });
        let held = store.get_snapshot();

        store.apply(FetchOutcome::QuotaLimited);

        assert_eq!(held.definitions.len(), 1);
        assert_eq!(held.etag.as_deref(), Some("\"v1\""));
        assert!(!held.quota_limited);
        assert!(store.get_snapshot().quota_limited);
    }

    #[test]
    fn not_modified_keeps_definitions_and_adopts_new_etag() {
        let store = SnapshotStore::new();
        store.apply(FetchOutcome::Modified {
            response: response(),
            etag: Some("\"v1\"".to_owned()),
        });
        let before = store.get_snapshot();

        assert!(matches!(
            store.apply(FetchOutcome::NotModified { etag: None }),
            RefreshOutcome::Unchanged
        ));
        let unchanged = store.get_snapshot();
        assert!(Arc::ptr_eq(&before, &unchanged));

        store.apply(FetchOutcome::NotModified {
            etag: Some("\"v2\"".to_owned()),
        });
        let retagged = store.get_snapshot();
        assert_eq!(retagged.etag.as_deref(), Some("\"v2\""));
        assert!(Arc::ptr_eq(&before.definitions, &retagged.definitions));
    }

    #[test]
    fn quota_limit_clears_definitions_and_etag() {
        let store = SnapshotStore::new();
        store.apply(FetchOutcome::Modified {
            response: response(),
            etag: Some("\"v1\"".to_owned()),
        });

        assert!(matches!(
            store.apply(FetchOutcome::QuotaLimited),
            RefreshOutcome::QuotaLimited
        ));
        let snapshot = store.get_snapshot();
        assert!(snapshot.quota_limited);
        assert!(snapshot.definitions.is_empty());
        assert_eq!(snapshot.etag, None);

        store.apply(FetchOutcome::Modified {
            response: response(),
            etag: None,
        });
        assert!(!store.get_snapshot().quota_limited);
    }
}

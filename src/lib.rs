//! `flagpole` evaluates feature flags locally from a cached snapshot of flag definitions, falling
//! back to a remote evaluation service only when the snapshot cannot conclusively decide.
//!
//! # Overview
//!
//! The SDK revolves around a [`Client`] that evaluates feature flags for an
//! [`EvaluationContext`]: an identity (`distinct_id`), the groups it belongs to, and attributes
//! describing the person and each group. Evaluation results in a [`FlagValue`], either a boolean
//! or the key of a multivariate variant, optionally accompanied by a JSON payload.
//!
//! [`FlagSnapshot`] is an immutable bundle of everything the server sent for local evaluation:
//! flag definitions, cohort definitions and the group type mapping. [`SnapshotStore`] holds the
//! currently active snapshot. Whenever definitions change, the snapshot is replaced completely, so
//! a reader always evaluates against one consistent snapshot.
//!
//! [`PollerThread`] periodically refreshes the snapshot with conditional (`If-None-Match`)
//! requests. Local evaluation requires a personal API key; without one, every evaluation goes to
//! the remote service.
//!
//! # Local evaluation results
//!
//! Local evaluation never fails with an error. It produces an [`EvaluationResult`]: either a
//! matched value, or a reason why the snapshot was not enough to decide
//! ([`InconclusiveReason`], [`ServerEvaluationReason`]). The client turns the latter into a remote
//! call unless the caller asked for local-only evaluation.
//!
//! # Error Handling
//!
//! Transport errors are represented by the [`Error`] enum. They are never returned from evaluation
//! calls: an affected call yields no value and the error is passed to the configured
//! [`ErrorHandler`].
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with the `flagpole`
//! target. Consider integrating a `log`-compatible logger implementation for better visibility
//! into SDK operations.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod attributes;
mod client;
mod config;
mod context;
mod error;
mod error_handler;
mod snapshot;

pub mod eval;
pub mod fetcher;
pub mod hasher;
pub mod models;
pub mod poller_thread;
pub mod remote;
pub mod snapshot_store;

pub use attributes::{AttributeValue, Attributes, Timestamp};
pub use client::{Client, EvaluationSource, FlagResult};
pub use config::ClientConfig;
pub use context::EvaluationContext;
pub use error::{Error, Result};
pub use error_handler::ErrorHandler;
pub use eval::{
    EvaluationResult, FlagValue, InconclusiveReason, MatchError, ServerEvaluationReason,
};
pub use poller_thread::{PollerThread, PollerThreadConfig, RefreshOutcome};
pub use snapshot::{FlagDefinitions, FlagSnapshot};
pub use snapshot_store::SnapshotStore;

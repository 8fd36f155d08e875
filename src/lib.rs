//! # Gateway Release - Core Library Crate
//!
//! The release pipeline of an API gateway control plane. Administrators edit
//! resources (routes, backends, plugins); this crate freezes them into
//! immutable resource versions, converts a version into the route and
//! service records a data plane consumes, reconciles those records into a
//! watched key-value store, and records every publish attempt as an
//! append-only event log.
//!
//! ## Module Organization
//!
//! - `core`: error taxonomy and configuration
//! - `domain`: gateways, stages, backends, resources, versions and release records
//! - `repository`: the persistence seam and its in-memory implementation
//! - `snapshot`: resource version creation and drift detection
//! - `diff`: structural diffs between JSON documents and record collections
//! - `convertor`: domain → data-plane conversion, plugin validation
//! - `distributor`: key-value store reconciliation per (gateway, stage)
//! - `lock`: per-(gateway, stage) mutual exclusion
//! - `release`: the publish state machine, hooks and batch reconciliation
//! - `observability`: logging setup and metrics

pub mod convertor;
pub mod core;
pub mod diff;
pub mod distributor;
pub mod domain;
pub mod lock;
pub mod observability;
pub mod release;
pub mod repository;
pub mod snapshot;

/// Main error type used throughout the pipeline
pub use core::error::{ReleaseError, ReleaseResult};

/// Configuration root, loaded from YAML or JSON
pub use core::config::ReleaseConfig;

pub use distributor::{Distributor, GlobalDistributor, KvStore};
pub use lock::ReleaseLock;
pub use release::{ReleaseRequest, Releaser, RevokeRequest, StageReleaseOutcome};
pub use repository::{InMemoryRepository, ReleaseRepository};
pub use snapshot::SnapshotStore;

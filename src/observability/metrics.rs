//! # Release Metrics
//!
//! Counters and histograms recorded through the `metrics` facade. The library
//! never installs an exporter; whatever recorder the embedding process
//! installs receives them, and without one they are no-ops.

use std::time::Duration;

use crate::domain::ReleaseStatus;

pub const PUBLISH_TOTAL: &str = "release_publish_total";
pub const SYNC_FAILED_KEYS_TOTAL: &str = "release_sync_failed_keys_total";
pub const DISTRIBUTE_DURATION_SECONDS: &str = "release_distribute_duration_seconds";
pub const LOCK_CONTENTION_TOTAL: &str = "release_lock_contention_total";

/// Count a finished publish attempt by its terminal status
pub fn record_publish(status: ReleaseStatus) {
    let counter = metrics::counter!(PUBLISH_TOTAL, "status" => status.as_str());
    counter.increment(1);
}

/// Count keys a reconciliation failed to write or delete
pub fn record_sync_failures(failed: usize) {
    if failed == 0 {
        return;
    }
    let counter = metrics::counter!(SYNC_FAILED_KEYS_TOTAL);
    counter.increment(failed as u64);
}

/// Record how long a distribute or revoke took
pub fn record_distribute_duration(operation: &'static str, ok: bool, duration: Duration) {
    let histogram = metrics::histogram!(
        DISTRIBUTE_DURATION_SECONDS,
        "operation" => operation,
        "ok" => if ok { "true" } else { "false" }
    );
    histogram.record(duration.as_secs_f64());
}

/// Count a failed lock attempt; the contended key is only logged
pub fn record_lock_contention() {
    let counter = metrics::counter!(LOCK_CONTENTION_TOTAL);
    counter.increment(1);
}

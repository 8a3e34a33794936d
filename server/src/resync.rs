//! Drift correction: pick the position every participant can rewind or hold to.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use tandem_proto::StatusReport;

/// Project a client report onto the instant `t0` the server position was taken.
///
/// A playing client kept advancing between `t0` and its report, so the elapsed
/// difference is subtracted (or added, for reports older than `t0`). A paused
/// report stands as is.
pub fn adjusted_position(report: &StatusReport, t0: DateTime<Utc>) -> i64 {
    if report.is_playing() {
        report.position + (t0 - report.timestamp).num_milliseconds()
    } else {
        report.position
    }
}

/// The most-behind of the server position and all adjusted client positions.
///
/// Correcting to the minimum only ever rewinds or holds, so no client skips
/// content it has not rendered yet.
pub fn resync_target<I>(server_position: i64, adjusted: I) -> i64
where
    I: IntoIterator<Item = i64>,
{
    adjusted
        .into_iter()
        .fold(server_position, i64::min)
        .max(0)
}

/// Single-flight flag; the guard clears it when the resync finishes.
#[derive(Default)]
pub struct ResyncGate {
    busy: AtomicBool,
}

pub struct ResyncGuard<'a> {
    gate: &'a ResyncGate,
}

impl ResyncGate {
    pub fn try_enter(&self) -> Option<ResyncGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ResyncGuard { gate: self })
    }
}

impl Drop for ResyncGuard<'_> {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::Release);
    }
}

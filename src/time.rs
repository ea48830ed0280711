//! Monotonic event-id generation and wall-clock timestamp helpers.
//!
//! Two clocks are used for two different purposes, and they are never
//! interchanged: the monotonic clock orders events; the wall clock only
//! labels them for humans.

use crate::error::LighthouseError;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Returns unix-epoch milliseconds, for human-visible timestamps in
/// payloads and trace entries. Never used for ordering.
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Returns an RFC-3339-flavored timestamp string with a literal `Z` suffix,
/// suitable for `/history/<iso-time>/` projection paths.
pub fn now_iso_z() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{}Z", secs)
}

pub fn new_correlation_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Generates monotonically increasing event ids of the form
/// `{monotonic_ns}_{seq}_{node}`.
///
/// Holds `(last_monotonic_ns, per_ns_seq)`. On each call it samples the
/// monotonic clock; if the nanosecond value is unchanged from the last
/// call, `per_ns_seq` increments to break the tie; if it advanced,
/// `per_ns_seq` resets to 0; if it ever goes backwards, generation refuses
/// and the caller must treat this as a fatal `ClockFault` (see SPEC_FULL.md
/// §4.1 and §9 "Clock handling").
pub struct EventIdGenerator {
    node: String,
    epoch: Instant,
    state: Mutex<(u64, u64)>,
}

impl EventIdGenerator {
    /// Construct a generator for `node`, recovering from a previously
    /// observed high-water mark (persisted in `events/.meta` after each
    /// segment roll) so restarts cannot emit ids less than or equal to one
    /// already durable.
    pub fn new(node: impl Into<String>, recovered_monotonic_ns: u64) -> Self {
        Self {
            node: node.into(),
            epoch: Instant::now(),
            state: Mutex::new((recovered_monotonic_ns, 0)),
        }
    }

    fn monotonic_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Generates the next event id, or fails with `ClockFault` if the
    /// sampled monotonic value regressed relative to the last one observed.
    pub fn next_id(&self) -> Result<(String, u64), LighthouseError> {
        let sampled = self.monotonic_ns();
        let mut state = self.state.lock().expect("event id generator lock poisoned");
        let (last_ns, last_seq) = *state;

        let (ns, seq) = match sampled.cmp(&last_ns) {
            std::cmp::Ordering::Greater => (sampled, 0),
            std::cmp::Ordering::Equal => (sampled, last_seq + 1),
            std::cmp::Ordering::Less => {
                return Err(LighthouseError::ClockFault(format!(
                    "monotonic clock regressed: sampled {} < last observed {}",
                    sampled, last_ns
                )));
            }
        };
        *state = (ns, seq);

        Ok((format!("{}_{}_{}", ns, seq, self.node), ns))
    }

    /// Highest monotonic value observed so far, for persistence at segment
    /// roll time.
    pub fn high_water_mark(&self) -> u64 {
        self.state.lock().expect("event id generator lock poisoned").0
    }
}

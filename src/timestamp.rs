//! Producer timestamps and the day/hour bucket names derived from them.
//!
//! Edge devices stamp every frame with local wall-clock time formatted as
//! `<Month><Day>/<Year> <HH:MM:SS>` (e.g. `October18/2026 14:03:05`). The
//! hub never substitutes receipt time.

use chrono::NaiveDateTime;

use crate::error::DecodeError;

pub type Timestamp = NaiveDateTime;

pub const WIRE_FORMAT: &str = "%B%d/%Y %H:%M:%S";
const DAY_FORMAT: &str = "%B%d";
const HOUR_FORMAT: &str = "%Hhr";
const CLIP_STEM_FORMAT: &str = "%B%d_%Hhr_%Mmin%Ssec";

pub fn parse_timestamp(value: &str) -> Result<Timestamp, DecodeError> {
    NaiveDateTime::parse_from_str(value.trim(), WIRE_FORMAT).map_err(|_| {
        DecodeError::Timestamp {
            value: value.to_string(),
        }
    })
}

pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.format(WIRE_FORMAT).to_string()
}

/// Day bucket folder name, e.g. `October18`.
pub fn day_bucket(ts: &Timestamp) -> String {
    ts.format(DAY_FORMAT).to_string()
}

/// Hour bucket folder name, e.g. `14hr`.
pub fn hour_bucket(ts: &Timestamp) -> String {
    ts.format(HOUR_FORMAT).to_string()
}

/// Clip file stem without extension, e.g. `October18_14hr_03min05sec`.
pub fn clip_stem(ts: &Timestamp) -> String {
    ts.format(CLIP_STEM_FORMAT).to_string()
}

/// Signed seconds from `earlier` to `later`; negative when the producer
/// clock moved backward.
pub fn seconds_between(later: &Timestamp, earlier: &Timestamp) -> f64 {
    let delta = later.signed_duration_since(*earlier);
    delta.num_milliseconds() as f64 / 1000.0
}

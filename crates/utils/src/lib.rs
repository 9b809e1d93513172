#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod error;
pub mod generation;

/// Converts a file system timestamp into the signed nanosecond "ticks" we persist.
///
/// Timestamps before the epoch are stored as negative values so they still compare correctly.
#[must_use]
pub fn system_time_to_ticks(time: SystemTime) -> i64 {
	#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
	// SAFETY: i64 nanoseconds covers roughly 292 years on each side of the epoch
	let ticks = match time.duration_since(UNIX_EPOCH) {
		Ok(since) => since.as_nanos() as i64,
		Err(e) => -(e.duration().as_nanos() as i64),
	};

	ticks
}

/// Inverse of [`system_time_to_ticks`]
#[must_use]
pub fn ticks_to_system_time(ticks: i64) -> SystemTime {
	if ticks >= 0 {
		UNIX_EPOCH + Duration::from_nanos(ticks.unsigned_abs())
	} else {
		UNIX_EPOCH - Duration::from_nanos(ticks.unsigned_abs())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ticks_survive_conversion_both_sides_of_epoch() {
		let after = UNIX_EPOCH + Duration::from_nanos(1_700_000_000_123_456_789);
		assert_eq!(ticks_to_system_time(system_time_to_ticks(after)), after);

		let before = UNIX_EPOCH - Duration::from_secs(86_400);
		assert_eq!(system_time_to_ticks(before), -86_400_000_000_000);
		assert_eq!(ticks_to_system_time(system_time_to_ticks(before)), before);
	}
}

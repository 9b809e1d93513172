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

use std::{collections::HashSet, num::NonZeroU64};

use lg_appearance::{DrawState, EntityHandle, EntityKind, StateChangeReason};

mod handle;
mod tracker;

pub use handle::TrackerHandle;
pub use tracker::{ObjectStateTracker, TrackerConfig};

/// Customization block followed by ten equipment slots of four bytes each
pub const EQUIPMENT_FINGERPRINT_LEN: usize = 26 + 10 * 4;

pub type EquipmentFingerprint = [u8; EQUIPMENT_FINGERPRINT_LEN];

/// Read access to one live entity in the host runtime.
///
/// Called from the tick loop only, so implementations can read host memory directly.
pub trait EntitySource {
	/// Current address, `None` while the entity doesn't exist
	fn address(&self) -> Option<EntityHandle>;

	/// Handle of the render object currently attached to the entity
	fn draw_object(&self) -> Option<NonZeroU64>;

	fn equipment_fingerprint(&self) -> EquipmentFingerprint;

	fn name(&self) -> Option<String>;

	fn draw_state(&self) -> DrawState;
}

impl<S: EntitySource + ?Sized> EntitySource for Box<S> {
	fn address(&self) -> Option<EntityHandle> {
		(**self).address()
	}

	fn draw_object(&self) -> Option<NonZeroU64> {
		(**self).draw_object()
	}

	fn equipment_fingerprint(&self) -> EquipmentFingerprint {
		(**self).equipment_fingerprint()
	}

	fn name(&self) -> Option<String> {
		(**self).name()
	}

	fn draw_state(&self) -> DrawState {
		(**self).draw_state()
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
	Changed(HashSet<StateChangeReason>),
	/// The entity went away and its appearance should be dropped
	Cleared,
}

impl ChangeEvent {
	/// Folds a later event into this one, the later one winning on conflicts
	fn absorb(&mut self, later: Self) {
		match (&mut *self, later) {
			(Self::Changed(reasons), Self::Changed(more)) => reasons.extend(more),
			(this, later) => *this = later,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
	pub kind: EntityKind,
	/// `None` for [`ChangeEvent::Cleared`]
	pub handle: Option<EntityHandle>,
	pub event: ChangeEvent,
}

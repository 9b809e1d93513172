use std::{fmt, num::NonZeroU64};

use serde::{Deserialize, Serialize};

/// Which of the user's related entities a piece of state belongs to.
///
/// The declaration order is the order appearance is applied in: the player first, then the
/// entities that are drawn attached to it.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum EntityKind {
	Player,
	MinionOrMount,
	Pet,
	Companion,
}

impl EntityKind {
	pub const ALL: [Self; 4] = [Self::Player, Self::MinionOrMount, Self::Pet, Self::Companion];

	/// Children that despawn and respawn often enough that clearing them must be debounced
	#[must_use]
	pub const fn is_transient_child(self) -> bool {
		matches!(self, Self::Pet | Self::Companion)
	}
}

impl fmt::Display for EntityKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Player => write!(f, "player"),
			Self::MinionOrMount => write!(f, "minion_or_mount"),
			Self::Pet => write!(f, "pet"),
			Self::Companion => write!(f, "companion"),
		}
	}
}

/// Opaque, never-null address of a live entity in the host runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityHandle(NonZeroU64);

impl EntityHandle {
	/// Returns `None` for the null address
	#[must_use]
	pub const fn new(address: u64) -> Option<Self> {
		match NonZeroU64::new(address) {
			Some(address) => Some(Self(address)),
			None => None,
		}
	}

	#[must_use]
	pub const fn address(self) -> u64 {
		self.0.get()
	}
}

impl fmt::Display for EntityHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:#x}", self.0.get())
	}
}

/// Whether the host's render object is still being built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DrawState {
	#[default]
	None,
	Transitioning,
	Loading,
}

impl DrawState {
	#[must_use]
	pub const fn is_drawing(self) -> bool {
		!matches!(self, Self::None)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn null_address_has_no_handle() {
		assert!(EntityHandle::new(0).is_none());
		assert_eq!(EntityHandle::new(0xdead).map(EntityHandle::address), Some(0xdead));
	}

	#[test]
	fn only_pets_and_companions_are_transient() {
		let transient = EntityKind::ALL
			.into_iter()
			.filter(|kind| kind.is_transient_child())
			.collect::<Vec<_>>();

		assert_eq!(transient, vec![EntityKind::Pet, EntityKind::Companion]);
	}
}

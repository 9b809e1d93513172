use std::sync::{
	atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
	Arc,
};

use lg_appearance::{DrawState, EntityHandle};

#[derive(Debug, Default)]
pub(crate) struct Shared {
	pub halted: AtomicBool,
	pub redraw_requested: AtomicBool,
	pub draw_state: AtomicU8,
	pub address: AtomicU64,
}

impl Shared {
	pub fn store_draw_state(&self, state: DrawState) {
		let encoded = match state {
			DrawState::None => 0,
			DrawState::Transitioning => 1,
			DrawState::Loading => 2,
		};
		self.draw_state.store(encoded, Ordering::Release);
	}

	pub fn store_address(&self, handle: Option<EntityHandle>) {
		self.address
			.store(handle.map_or(0, EntityHandle::address), Ordering::Release);
	}
}

/// Cloneable control surface of a tracker, usable from outside the tick loop.
///
/// Halting is used around redraws we trigger ourselves: whatever changes in the meantime is
/// held back and reported as one notification by the first poll after [`resume`](Self::resume).
#[derive(Debug, Clone)]
pub struct TrackerHandle {
	pub(crate) shared: Arc<Shared>,
}

impl TrackerHandle {
	pub fn halt(&self) {
		self.shared.halted.store(true, Ordering::Release);
	}

	pub fn resume(&self) {
		self.shared.halted.store(false, Ordering::Release);
	}

	#[must_use]
	pub fn is_halted(&self) -> bool {
		self.shared.halted.load(Ordering::Acquire)
	}

	/// Makes the next poll report [`RedrawForced`](lg_appearance::StateChangeReason::RedrawForced)
	pub fn force_redraw(&self) {
		self.shared.redraw_requested.store(true, Ordering::Release);
	}

	/// Draw state seen by the last poll
	#[must_use]
	pub fn is_drawing(&self) -> bool {
		self.shared.draw_state.load(Ordering::Acquire) != 0
	}

	/// Address seen by the last poll
	#[must_use]
	pub fn entity(&self) -> Option<EntityHandle> {
		EntityHandle::new(self.shared.address.load(Ordering::Acquire))
	}
}

use std::{
	collections::HashSet,
	num::NonZeroU64,
	sync::{atomic::Ordering, Arc},
	time::Duration,
};

use async_channel as chan;
use lg_appearance::{EntityHandle, EntityKind, StateChangeReason};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::{
	handle::{Shared, TrackerHandle},
	ChangeEvent, EntitySource, EquipmentFingerprint, StateChange,
};

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
	/// How long a transient child may be gone before it counts as cleared
	pub transient_clear_delay: Duration,
}

impl Default for TrackerConfig {
	fn default() -> Self {
		Self {
			transient_clear_delay: Duration::from_millis(500),
		}
	}
}

#[derive(Debug, Default)]
struct Observed {
	handle: Option<EntityHandle>,
	draw_object: Option<NonZeroU64>,
	fingerprint: Option<EquipmentFingerprint>,
	name: Option<String>,
}

/// Detects changes on one live entity. Owned and polled by the tick loop.
pub struct ObjectStateTracker<S> {
	kind: EntityKind,
	source: S,
	config: TrackerConfig,
	observed: Observed,
	shared: Arc<Shared>,
	/// Set while a transient child is gone but not yet reported as cleared
	clear_deadline: Option<Instant>,
	/// Changes seen while halted
	held: Option<ChangeEvent>,
	changes_tx: chan::Sender<StateChange>,
}

impl<S: EntitySource> ObjectStateTracker<S> {
	pub fn new(
		kind: EntityKind,
		source: S,
		config: TrackerConfig,
		changes_tx: chan::Sender<StateChange>,
	) -> Self {
		Self {
			kind,
			source,
			config,
			observed: Observed::default(),
			shared: Arc::default(),
			clear_deadline: None,
			held: None,
			changes_tx,
		}
	}

	#[must_use]
	pub const fn kind(&self) -> EntityKind {
		self.kind
	}

	#[must_use]
	pub fn handle(&self) -> TrackerHandle {
		TrackerHandle {
			shared: Arc::clone(&self.shared),
		}
	}

	#[must_use]
	pub fn is_drawing(&self) -> bool {
		self.handle().is_drawing()
	}

	pub fn force_redraw(&self) {
		self.handle().force_redraw();
	}

	/// Samples the entity once and publishes whatever changed since the previous poll
	pub fn poll(&mut self) {
		self.shared.store_draw_state(self.source.draw_state());

		let event = match self.source.address() {
			Some(address) => self.observe_present(address),
			None => self.observe_absent(),
		};

		let current_handle = self.observed.handle;
		self.shared.store_address(current_handle);

		if let Some(event) = event {
			self.held = Some(match self.held.take() {
				Some(mut held) => {
					held.absorb(event);
					held
				}
				None => event,
			});
		}

		if self.shared.halted.load(Ordering::Acquire) {
			if self.held.is_some() {
				trace!(kind = %self.kind, "Holding back change while halted;");
			}
			return;
		}

		if let Some(event) = self.held.take() {
			self.publish(StateChange {
				kind: self.kind,
				handle: current_handle,
				event,
			});
		}
	}

	fn observe_present(&mut self, address: EntityHandle) -> Option<ChangeEvent> {
		if self.clear_deadline.take().is_some() {
			debug!(kind = %self.kind, %address, "Transient entity came back before being cleared;");
		}

		let mut reasons = HashSet::new();

		if self.observed.handle != Some(address) {
			reasons.insert(StateChangeReason::AddressChanged);
			self.observed.handle = Some(address);
		}

		let draw_object = self.source.draw_object();
		if self.observed.draw_object != draw_object {
			reasons.insert(StateChangeReason::DrawObjectChanged);
			self.observed.draw_object = draw_object;
		}

		let fingerprint = self.source.equipment_fingerprint();
		let equipment_changed = self.observed.fingerprint.map_or(true, |previous| {
			// compared byte by byte so the log can point at the slot that changed
			let first_difference = previous
				.iter()
				.zip(&fingerprint)
				.position(|(old, new)| old != new);

			if let Some(offset) = first_difference {
				trace!(kind = %self.kind, offset, "Equipment bytes changed;");
			}

			first_difference.is_some()
		});
		if equipment_changed {
			reasons.insert(StateChangeReason::EquipmentChanged);
			self.observed.fingerprint = Some(fingerprint);
		}

		let name = self.source.name();
		if self.observed.name != name {
			reasons.insert(StateChangeReason::NameChanged);
			self.observed.name = name;
		}

		if self.shared.redraw_requested.swap(false, Ordering::AcqRel) {
			reasons.insert(StateChangeReason::RedrawForced);
		}

		(!reasons.is_empty()).then_some(ChangeEvent::Changed(reasons))
	}

	fn observe_absent(&mut self) -> Option<ChangeEvent> {
		if let Some(deadline) = self.clear_deadline {
			if Instant::now() < deadline {
				return None;
			}

			self.clear_deadline = None;
			self.observed = Observed::default();
			debug!(kind = %self.kind, "Transient entity stayed away, clearing;");
			return Some(ChangeEvent::Cleared);
		}

		self.observed.handle?;

		if self.kind.is_transient_child() {
			// keep what we observed, so reappearing unchanged produces no notification
			self.clear_deadline = Some(Instant::now() + self.config.transient_clear_delay);
			return None;
		}

		self.observed = Observed::default();
		Some(ChangeEvent::Cleared)
	}

	fn publish(&self, change: StateChange) {
		trace!(?change, "Publishing state change;");

		if let Err(e) = self.changes_tx.try_send(change) {
			warn!(kind = %self.kind, ?e, "State change receiver is gone;");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use crate::EQUIPMENT_FINGERPRINT_LEN;

	use lg_appearance::DrawState;
	use parking_lot::Mutex;
	use tokio::time::advance;
	use tracing_test::traced_test;

	#[derive(Debug, Clone)]
	struct FakeEntity {
		address: u64,
		draw_object: u64,
		fingerprint: EquipmentFingerprint,
		name: Option<String>,
		draw_state: DrawState,
	}

	impl Default for FakeEntity {
		fn default() -> Self {
			Self {
				address: 0x1000,
				draw_object: 0x2000,
				fingerprint: [0; EQUIPMENT_FINGERPRINT_LEN],
				name: Some("Somebody".to_string()),
				draw_state: DrawState::None,
			}
		}
	}

	#[derive(Clone, Default)]
	struct FakeSource(Arc<Mutex<FakeEntity>>);

	impl EntitySource for FakeSource {
		fn address(&self) -> Option<EntityHandle> {
			EntityHandle::new(self.0.lock().address)
		}

		fn draw_object(&self) -> Option<NonZeroU64> {
			NonZeroU64::new(self.0.lock().draw_object)
		}

		fn equipment_fingerprint(&self) -> EquipmentFingerprint {
			self.0.lock().fingerprint
		}

		fn name(&self) -> Option<String> {
			self.0.lock().name.clone()
		}

		fn draw_state(&self) -> DrawState {
			self.0.lock().draw_state
		}
	}

	fn tracker(
		kind: EntityKind,
	) -> (
		ObjectStateTracker<FakeSource>,
		FakeSource,
		chan::Receiver<StateChange>,
	) {
		let entity = FakeSource::default();
		let (tx, rx) = chan::unbounded();
		(
			ObjectStateTracker::new(kind, entity.clone(), TrackerConfig::default(), tx),
			entity,
			rx,
		)
	}

	fn reasons(rx: &chan::Receiver<StateChange>) -> Option<HashSet<StateChangeReason>> {
		match rx.try_recv().ok()?.event {
			ChangeEvent::Changed(reasons) => Some(reasons),
			ChangeEvent::Cleared => panic!("unexpected clear"),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn single_byte_flip_is_reported_once() {
		let (mut tracker, entity, rx) = tracker(EntityKind::Player);

		tracker.poll();
		assert_eq!(
			reasons(&rx),
			Some(HashSet::from([
				StateChangeReason::AddressChanged,
				StateChangeReason::DrawObjectChanged,
				StateChangeReason::EquipmentChanged,
				StateChangeReason::NameChanged,
			]))
		);

		tracker.poll();
		assert!(rx.is_empty());

		entity.0.lock().fingerprint[30] = 7;
		tracker.poll();
		assert_eq!(
			reasons(&rx),
			Some(HashSet::from([StateChangeReason::EquipmentChanged]))
		);

		tracker.poll();
		assert!(rx.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn player_disappearing_is_cleared_immediately() {
		let (mut tracker, entity, rx) = tracker(EntityKind::Player);
		tracker.poll();
		rx.try_recv().unwrap();

		entity.0.lock().address = 0;
		tracker.poll();

		let change = rx.try_recv().unwrap();
		assert_eq!(change.event, ChangeEvent::Cleared);
		assert_eq!(change.handle, None);

		tracker.poll();
		assert!(rx.is_empty());
	}

	#[tokio::test(start_paused = true)]
	#[traced_test]
	async fn pet_respawn_within_delay_is_silent() {
		let (mut tracker, entity, rx) = tracker(EntityKind::Pet);
		tracker.poll();
		rx.try_recv().unwrap();

		entity.0.lock().address = 0;
		tracker.poll();
		advance(Duration::from_millis(300)).await;
		tracker.poll();
		assert!(rx.is_empty());

		entity.0.lock().address = 0x1000;
		tracker.poll();
		assert!(rx.is_empty());
		assert!(logs_contain("came back before being cleared"));
	}

	#[tokio::test(start_paused = true)]
	async fn pet_gone_past_delay_is_cleared() {
		let (mut tracker, entity, rx) = tracker(EntityKind::Pet);
		tracker.poll();
		rx.try_recv().unwrap();

		entity.0.lock().address = 0;
		tracker.poll();
		advance(Duration::from_millis(501)).await;
		tracker.poll();
		assert_eq!(rx.try_recv().unwrap().event, ChangeEvent::Cleared);

		// coming back afterwards is a full change again
		entity.0.lock().address = 0x1000;
		tracker.poll();
		assert!(reasons(&rx)
			.unwrap()
			.contains(&StateChangeReason::AddressChanged));
	}

	#[tokio::test(start_paused = true)]
	async fn changes_while_halted_are_emitted_after_resume() {
		let (mut tracker, entity, rx) = tracker(EntityKind::Player);
		let handle = tracker.handle();
		tracker.poll();
		rx.try_recv().unwrap();

		handle.halt();
		entity.0.lock().fingerprint[0] = 1;
		tracker.poll();
		entity.0.lock().name = Some("Renamed".to_string());
		tracker.poll();
		assert!(rx.is_empty());

		handle.resume();
		handle.force_redraw();
		tracker.poll();
		assert_eq!(
			reasons(&rx),
			Some(HashSet::from([
				StateChangeReason::EquipmentChanged,
				StateChangeReason::NameChanged,
				StateChangeReason::RedrawForced,
			]))
		);
		assert!(rx.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn handle_reflects_last_poll() {
		let (mut tracker, entity, _rx) = tracker(EntityKind::Player);
		let handle = tracker.handle();

		entity.0.lock().draw_state = DrawState::Loading;
		tracker.poll();
		assert!(handle.is_drawing());
		assert_eq!(handle.entity(), EntityHandle::new(0x1000));

		entity.0.lock().draw_state = DrawState::None;
		tracker.poll();
		assert!(!tracker.is_drawing());
	}
}

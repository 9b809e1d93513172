use std::collections::HashMap;

use async_channel as chan;
use lg_appearance::{EntityHandle, EntityKind};
use lg_core_peer_sync::{RuntimeCondition, RuntimeMonitor};
use lg_core_snapshot_aggregator::DrawStateProbe;
use lg_core_state_tracker::{
	EntitySource, ObjectStateTracker, StateChange, TrackerConfig, TrackerHandle,
};

pub type BoxedSource = Box<dyn EntitySource + Send>;

/// Owns the local user's trackers. The host calls [`tick`](Self::tick) once per frame from
/// its own thread; everything downstream runs on the tokio runtime.
pub struct TickDriver {
	trackers: Vec<ObjectStateTracker<BoxedSource>>,
	runtime: RuntimeMonitor,
}

impl TickDriver {
	pub(crate) fn new(
		sources: Vec<(EntityKind, BoxedSource)>,
		config: TrackerConfig,
		changes_tx: &chan::Sender<StateChange>,
		runtime: RuntimeMonitor,
	) -> Self {
		let mut trackers = sources
			.into_iter()
			.map(|(kind, source)| ObjectStateTracker::new(kind, source, config, changes_tx.clone()))
			.collect::<Vec<_>>();

		trackers.sort_by_key(ObjectStateTracker::kind);

		Self { trackers, runtime }
	}

	/// Polls every tracker once, in application order
	pub fn tick(&mut self) {
		for tracker in &mut self.trackers {
			tracker.poll();
		}
	}

	/// Publishes the host's current condition; peers defer or cancel work accordingly
	pub fn set_runtime_condition(&self, condition: RuntimeCondition) {
		self.runtime.set(condition);
	}

	#[must_use]
	pub fn handle(&self, kind: EntityKind) -> Option<TrackerHandle> {
		self.trackers
			.iter()
			.find(|tracker| tracker.kind() == kind)
			.map(ObjectStateTracker::handle)
	}

	pub(crate) fn handles(&self) -> HashMap<EntityKind, TrackerHandle> {
		self.trackers
			.iter()
			.map(|tracker| (tracker.kind(), tracker.handle()))
			.collect()
	}
}

/// Answers "is this entity still drawing" from the trackers' last observations
pub(crate) struct TrackerProbe {
	handles: HashMap<EntityKind, TrackerHandle>,
}

impl TrackerProbe {
	pub(crate) const fn new(handles: HashMap<EntityKind, TrackerHandle>) -> Self {
		Self { handles }
	}
}

impl DrawStateProbe for TrackerProbe {
	fn is_drawing(&self, kind: EntityKind, handle: EntityHandle) -> bool {
		self.handles
			.get(&kind)
			.is_some_and(|tracked| tracked.entity() == Some(handle) && tracked.is_drawing())
	}
}

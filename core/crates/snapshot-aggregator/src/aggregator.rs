use std::{
	collections::{BTreeMap, HashMap, HashSet},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
};

use async_channel as chan;
use futures_concurrency::future::{Join, Race};
use lg_appearance::{AppearanceFragment, AppearanceSnapshot, ChangeSet, EntityHandle, EntityKind};
use lg_core_state_tracker::{ChangeEvent, StateChange};
use lg_utils::generation::GenerationSlot;
use parking_lot::Mutex;
use tokio::{
	spawn,
	sync::{watch, Mutex as AsyncMutex},
	task::JoinHandle,
	time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{AggregatorConfig, ComposeError, Composer, DrawStateProbe};

#[derive(Debug, Default)]
struct State {
	pending: ChangeSet,
	cleared: HashSet<EntityKind>,
	/// Latest known handle per kind, kept across rounds
	handles: HashMap<EntityKind, EntityHandle>,
}

struct Inner {
	config: AggregatorConfig,
	composer: Arc<dyn Composer>,
	probe: Arc<dyn DrawStateProbe>,
	state: Mutex<State>,
	debounce: GenerationSlot,
	shutdown: CancellationToken,
	round_lock: AsyncMutex<()>,
	snapshot_tx: watch::Sender<Option<Arc<AppearanceSnapshot>>>,
	rounds_completed: AtomicU64,
}

/// Turns bursts of tracker notifications into published [`AppearanceSnapshot`]s.
///
/// Every notification restarts the debounce timer. When it fires a round takes everything
/// pending and rebuilds those kinds. Rounds never overlap: a timer that fires mid-round waits
/// for the running one and then picks up what arrived in the meantime.
#[derive(Clone)]
pub struct SnapshotAggregator {
	inner: Arc<Inner>,
}

impl SnapshotAggregator {
	pub fn new(
		config: AggregatorConfig,
		composer: Arc<dyn Composer>,
		probe: Arc<dyn DrawStateProbe>,
	) -> Self {
		let shutdown = CancellationToken::new();
		let (snapshot_tx, _) = watch::channel(None);

		Self {
			inner: Arc::new(Inner {
				config,
				composer,
				probe,
				state: Mutex::default(),
				debounce: GenerationSlot::with_parent(shutdown.clone()),
				shutdown,
				round_lock: AsyncMutex::new(()),
				snapshot_tx,
				rounds_completed: AtomicU64::new(0),
			}),
		}
	}

	pub fn notify(&self, change: StateChange) {
		if self.inner.shutdown.is_cancelled() {
			return;
		}

		{
			let mut state = self.inner.state.lock();
			match change.event {
				ChangeEvent::Changed(reasons) => {
					state.cleared.remove(&change.kind);
					if let Some(handle) = change.handle {
						state.handles.insert(change.kind, handle);
					}
					state.pending.insert(change.kind, reasons);
				}
				ChangeEvent::Cleared => {
					state.cleared.insert(change.kind);
					state.handles.remove(&change.kind);
					state.pending.insert(change.kind, std::iter::empty());
				}
			}
		}

		let generation = self.inner.debounce.advance();
		let inner = Arc::clone(&self.inner);

		spawn(async move {
			enum Timer {
				Elapsed,
				Superseded,
			}

			let timer = (
				async {
					sleep(inner.config.debounce).await;
					Timer::Elapsed
				},
				async {
					generation.token().cancelled().await;
					Timer::Superseded
				},
			)
				.race()
				.await;

			if matches!(timer, Timer::Superseded) {
				trace!(generation = generation.id(), "Debounce timer superseded;");
				return;
			}

			inner.run_round().await;
		});
	}

	#[must_use]
	pub fn subscribe(&self) -> watch::Receiver<Option<Arc<AppearanceSnapshot>>> {
		self.inner.snapshot_tx.subscribe()
	}

	#[must_use]
	pub fn current(&self) -> Option<Arc<AppearanceSnapshot>> {
		self.inner.snapshot_tx.borrow().clone()
	}

	#[must_use]
	pub fn rounds_completed(&self) -> u64 {
		self.inner.rounds_completed.load(Ordering::Acquire)
	}

	/// Feeds tracker notifications into [`notify`](Self::notify) until the channel closes or
	/// the aggregator shuts down
	pub fn spawn_listener(&self, changes_rx: chan::Receiver<StateChange>) -> JoinHandle<()> {
		let this = self.clone();

		spawn(async move {
			enum Message {
				Change(StateChange),
				Closed,
				Stop,
			}

			loop {
				let msg = (
					async {
						changes_rx
							.recv()
							.await
							.map_or(Message::Closed, Message::Change)
					},
					async {
						this.inner.shutdown.cancelled().await;
						Message::Stop
					},
				)
					.race()
					.await;

				match msg {
					Message::Change(change) => this.notify(change),
					Message::Closed => {
						debug!("State change channel closed, stopping listener;");
						break;
					}
					Message::Stop => break,
				}
			}
		})
	}

	/// Stops pending timers and in-flight builds; nothing is published afterwards
	pub fn shutdown(&self) {
		self.inner.shutdown.cancel();
	}
}

impl Inner {
	#[instrument(skip(self))]
	async fn run_round(self: Arc<Self>) {
		let _round = self.round_lock.lock().await;

		if self.shutdown.is_cancelled() {
			return;
		}

		let (changes, cleared, handles) = {
			let mut state = self.state.lock();
			(
				state.pending.take(),
				std::mem::take(&mut state.cleared),
				state.handles.clone(),
			)
		};

		if changes.is_empty() {
			trace!("Nothing pending, skipping round;");
			return;
		}

		let to_build = changes
			.kinds()
			.into_iter()
			.filter(|kind| !cleared.contains(kind))
			.collect::<Vec<_>>();

		debug!(?to_build, ?cleared, "Starting aggregation round;");

		let results = to_build
			.iter()
			.map(|&kind| {
				let inner = Arc::clone(&self);
				let handle = handles.get(&kind).copied();
				async move {
					// each build runs in its own task so a panicking composer only loses its kind
					(kind, spawn(async move { inner.build_one(kind, handle).await }).await)
				}
			})
			.collect::<Vec<_>>()
			.join()
			.await;

		if self.shutdown.is_cancelled() {
			debug!("Shut down mid-round, discarding results;");
			return;
		}

		let mut fragments = self
			.snapshot_tx
			.borrow()
			.as_deref()
			.map(|snapshot| {
				snapshot
					.fragments()
					.map(|(kind, fragment)| (kind, fragment.clone()))
					.collect::<BTreeMap<_, _>>()
			})
			.unwrap_or_default();

		for kind in &cleared {
			fragments.remove(kind);
		}

		for (kind, res) in results {
			match res {
				Ok(Ok(fragment)) => {
					fragments.insert(kind, fragment);
				}
				Ok(Err(e)) => {
					warn!(%kind, ?e, "Failed to build appearance fragment, keeping the previous one;");
				}
				Err(e) => error!(%kind, ?e, "Appearance fragment build task panicked;"),
			}
		}

		match AppearanceSnapshot::new(fragments) {
			Ok(snapshot) => {
				info!(data_hash = %snapshot.data_hash(), "Publishing appearance snapshot;");
				self.snapshot_tx.send_replace(Some(Arc::new(snapshot)));
			}
			Err(e) => error!(?e, "Failed to assemble appearance snapshot;"),
		}

		self.rounds_completed.fetch_add(1, Ordering::AcqRel);
	}

	async fn build_one(
		&self,
		kind: EntityKind,
		handle: Option<EntityHandle>,
	) -> Result<AppearanceFragment, ComposeError> {
		let handle = handle.ok_or(ComposeError::EntityUnavailable(kind))?;
		let cancel = self.shutdown.child_token();

		self.wait_for_draw(kind, handle, &cancel).await?;

		self.composer.build_fragment(kind, handle, &cancel).await
	}

	/// Waits for the render object to settle. Gives up waiting after the configured timeout
	/// and samples whatever is there.
	async fn wait_for_draw(
		&self,
		kind: EntityKind,
		handle: EntityHandle,
		cancel: &CancellationToken,
	) -> Result<(), ComposeError> {
		enum Wait {
			Tick,
			Cancelled,
		}

		let started = Instant::now();

		while self.probe.is_drawing(kind, handle) {
			if started.elapsed() >= self.config.draw_wait_timeout {
				warn!(%kind, %handle, "Render object still drawing after timeout, sampling anyway;");
				return Ok(());
			}

			let wait = (
				async {
					sleep(self.config.draw_poll_interval).await;
					Wait::Tick
				},
				async {
					cancel.cancelled().await;
					Wait::Cancelled
				},
			)
				.race()
				.await;

			if matches!(wait, Wait::Cancelled) {
				return Err(ComposeError::Cancelled);
			}
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::{
		sync::atomic::{AtomicBool, AtomicUsize},
		time::Duration,
	};

	use async_trait::async_trait;
	use lg_appearance::StateChangeReason;
	use pretty_assertions::assert_eq;

	#[derive(Default)]
	struct FakeComposer {
		calls: Mutex<Vec<EntityKind>>,
		delay: Duration,
		failing: HashSet<EntityKind>,
		in_flight: AtomicUsize,
		max_in_flight: AtomicUsize,
	}

	#[async_trait]
	impl Composer for FakeComposer {
		async fn build_fragment(
			&self,
			kind: EntityKind,
			_handle: EntityHandle,
			_cancel: &CancellationToken,
		) -> Result<AppearanceFragment, ComposeError> {
			let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
			self.max_in_flight.fetch_max(running, Ordering::SeqCst);

			let call = {
				let mut calls = self.calls.lock();
				calls.push(kind);
				calls.len()
			};

			sleep(self.delay).await;
			self.in_flight.fetch_sub(1, Ordering::SeqCst);

			if self.failing.contains(&kind) {
				return Err(ComposeError::Failed("sampling exploded".into()));
			}

			Ok(AppearanceFragment {
				customization: format!("{kind}-{call}"),
				..Default::default()
			})
		}
	}

	#[derive(Default)]
	struct FakeProbe {
		drawing: AtomicBool,
	}

	impl DrawStateProbe for FakeProbe {
		fn is_drawing(&self, _kind: EntityKind, _handle: EntityHandle) -> bool {
			self.drawing.load(Ordering::SeqCst)
		}
	}

	fn changed(kind: EntityKind) -> StateChange {
		StateChange {
			kind,
			handle: EntityHandle::new(0x10),
			event: ChangeEvent::Changed(HashSet::from([StateChangeReason::EquipmentChanged])),
		}
	}

	fn aggregator(composer: &Arc<FakeComposer>, probe: &Arc<FakeProbe>) -> SnapshotAggregator {
		SnapshotAggregator::new(
			AggregatorConfig {
				draw_wait_timeout: Duration::from_secs(2),
				..Default::default()
			},
			Arc::clone(composer) as Arc<dyn Composer>,
			Arc::clone(probe) as Arc<dyn DrawStateProbe>,
		)
	}

	#[tokio::test(start_paused = true)]
	async fn burst_within_debounce_window_is_one_round() {
		let composer = Arc::new(FakeComposer::default());
		let aggregator = aggregator(&composer, &Arc::default());
		let mut snapshots = aggregator.subscribe();

		for _ in 0..5 {
			aggregator.notify(changed(EntityKind::Player));
			sleep(Duration::from_millis(200)).await;
		}
		assert_eq!(aggregator.rounds_completed(), 0);

		sleep(Duration::from_millis(1_500)).await;

		assert_eq!(aggregator.rounds_completed(), 1);
		assert_eq!(*composer.calls.lock(), vec![EntityKind::Player]);

		snapshots.changed().await.unwrap();
		let snapshot = snapshots.borrow().clone().unwrap();
		assert_eq!(
			snapshot.fragment(EntityKind::Player).map(|f| f.customization.as_str()),
			Some("player-1")
		);
	}

	#[tokio::test(start_paused = true)]
	async fn notifications_mid_round_get_a_follow_up_round() {
		let composer = Arc::new(FakeComposer {
			delay: Duration::from_secs(2),
			..Default::default()
		});
		let aggregator = aggregator(&composer, &Arc::default());

		aggregator.notify(changed(EntityKind::Player));
		sleep(Duration::from_millis(1_100)).await;
		// first round is now sampling
		aggregator.notify(changed(EntityKind::Pet));
		aggregator.notify(changed(EntityKind::Player));
		sleep(Duration::from_secs(6)).await;

		assert_eq!(aggregator.rounds_completed(), 2);
		assert_eq!(
			*composer.calls.lock(),
			vec![EntityKind::Player, EntityKind::Player, EntityKind::Pet]
		);
		// rounds never overlapped, only the second round's two kinds ran side by side
		assert_eq!(composer.max_in_flight.load(Ordering::SeqCst), 2);

		let snapshot = aggregator.current().unwrap();
		assert!(snapshot.fragment(EntityKind::Pet).is_some());
		assert_eq!(
			snapshot.fragment(EntityKind::Player).map(|f| f.customization.as_str()),
			Some("player-2")
		);
	}

	#[tokio::test(start_paused = true)]
	async fn failing_kind_keeps_others_and_previous_fragment() {
		let composer = Arc::new(FakeComposer {
			failing: HashSet::from([EntityKind::Pet]),
			..Default::default()
		});
		let aggregator = aggregator(&composer, &Arc::default());

		aggregator.notify(changed(EntityKind::Player));
		aggregator.notify(changed(EntityKind::Pet));
		sleep(Duration::from_secs(2)).await;

		let snapshot = aggregator.current().unwrap();
		assert!(snapshot.fragment(EntityKind::Player).is_some());
		assert!(snapshot.fragment(EntityKind::Pet).is_none());
		assert_eq!(aggregator.rounds_completed(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn cleared_kind_is_dropped_without_rebuilding() {
		let composer = Arc::new(FakeComposer::default());
		let aggregator = aggregator(&composer, &Arc::default());

		aggregator.notify(changed(EntityKind::Player));
		aggregator.notify(changed(EntityKind::Pet));
		sleep(Duration::from_secs(2)).await;
		assert_eq!(aggregator.current().unwrap().fragments().count(), 2);

		aggregator.notify(StateChange {
			kind: EntityKind::Pet,
			handle: None,
			event: ChangeEvent::Cleared,
		});
		sleep(Duration::from_secs(2)).await;

		let snapshot = aggregator.current().unwrap();
		assert!(snapshot.fragment(EntityKind::Pet).is_none());
		assert!(snapshot.fragment(EntityKind::Player).is_some());
		assert_eq!(composer.calls.lock().len(), 2);
		assert_eq!(aggregator.rounds_completed(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn draw_wait_fails_open() {
		let composer = Arc::new(FakeComposer::default());
		let probe = Arc::new(FakeProbe {
			drawing: AtomicBool::new(true),
		});
		let aggregator = aggregator(&composer, &probe);

		aggregator.notify(changed(EntityKind::Player));
		sleep(Duration::from_secs(2)).await;
		assert!(composer.calls.lock().is_empty());

		sleep(Duration::from_secs(2)).await;
		assert_eq!(composer.calls.lock().len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn shutdown_stops_pending_rounds_and_listener() {
		let composer = Arc::new(FakeComposer::default());
		let aggregator = aggregator(&composer, &Arc::default());
		let (tx, rx) = chan::unbounded();
		let listener = aggregator.spawn_listener(rx);

		tx.send(changed(EntityKind::Player)).await.unwrap();
		sleep(Duration::from_millis(100)).await;
		aggregator.shutdown();
		sleep(Duration::from_secs(2)).await;

		listener.await.unwrap();
		assert_eq!(aggregator.rounds_completed(), 0);
		assert!(composer.calls.lock().is_empty());
	}
}

use std::{
	collections::{BTreeMap, BTreeSet, HashSet},
	future::Future,
	sync::{Arc, Weak},
};

use futures_concurrency::future::Race;
use lg_appearance::{AddonKind, AppearanceSnapshot, ContentHash, DataHash, EntityHandle, EntityKind};
use lg_file_cache::ContentCache;
use lg_utils::generation::{Generation, GenerationSlot};
use parking_lot::Mutex;
use tokio::{
	spawn,
	sync::{watch, Mutex as AsyncMutex},
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
	ApplyGate, CollectionId, Downloader, EntityLocator, Error, PeerId, PeerSyncConfig,
	RenderFacets, ResolvedPaths, RuntimeCondition, RuntimeMonitor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
	Idle,
	/// Holding a snapshot until the host leaves an unsafe period
	Deferred,
	Resolving,
	Downloading,
	Applying,
	Disposed,
}

/// What has been pushed onto one of the peer's entities, so it can be taken back off
#[derive(Debug, Clone, Default)]
pub(crate) struct AppliedFacets {
	pub entity: Option<EntityHandle>,
	pub mods: bool,
	pub customization: bool,
	pub scale_offset: bool,
	pub addons: BTreeSet<AddonKind>,
}

#[derive(Debug, Default)]
pub(crate) struct PeerState {
	pub last_applied: Option<Arc<AppearanceSnapshot>>,
	pub resolved: BTreeMap<EntityKind, ResolvedPaths>,
	/// Most recent snapshot received, used when a reapply is owed
	pub latest: Option<Arc<AppearanceSnapshot>>,
	pub deferred: Option<(Arc<AppearanceSnapshot>, bool)>,
	pub reapply_owed: bool,
	pub do_not_retry: HashSet<ContentHash>,
	pub do_not_retry_for: Option<DataHash>,
	pub collection: Option<CollectionId>,
	pub applied: BTreeMap<EntityKind, AppliedFacets>,
}

pub(crate) struct Inner {
	pub peer: PeerId,
	pub config: PeerSyncConfig,
	pub cache: Arc<ContentCache>,
	pub facets: RenderFacets,
	pub downloader: Arc<dyn Downloader>,
	pub locator: Arc<dyn EntityLocator>,
	pub gate: ApplyGate,
	pub runtime: RuntimeMonitor,
	pub phase_tx: watch::Sender<SyncPhase>,
	pub apply_slot: GenerationSlot,
	/// Held for the whole of an application, so a superseded one has wound down before the
	/// next one touches the render host
	pub apply_lock: AsyncMutex<()>,
	pub dispose: CancellationToken,
	pub state: Mutex<PeerState>,
}

/// Collaborators shared by every peer's engine
#[derive(Clone)]
pub struct PeerSyncContext {
	pub config: PeerSyncConfig,
	pub cache: Arc<ContentCache>,
	pub facets: RenderFacets,
	pub downloader: Arc<dyn Downloader>,
	pub locator: Arc<dyn EntityLocator>,
	pub gate: ApplyGate,
	pub runtime: RuntimeMonitor,
}

/// Keeps one remote peer's entities looking the way the peer's latest snapshot says.
pub struct PeerSyncEngine {
	inner: Arc<Inner>,
	_stop_on_drop: DropGuard,
}

impl PeerSyncEngine {
	pub fn new(peer: PeerId, ctx: &PeerSyncContext) -> Self {
		let PeerSyncContext {
			config,
			cache,
			facets,
			downloader,
			locator,
			gate,
			runtime,
		} = ctx.clone();

		let dispose = CancellationToken::new();
		let (phase_tx, _) = watch::channel(SyncPhase::Idle);
		let mut runtime_rx = runtime.subscribe();
		let initial_condition = *runtime_rx.borrow_and_update();

		let inner = Arc::new(Inner {
			peer,
			config,
			cache,
			facets,
			downloader,
			locator,
			gate,
			runtime,
			phase_tx,
			apply_slot: GenerationSlot::with_parent(dispose.clone()),
			apply_lock: AsyncMutex::new(()),
			dispose: dispose.clone(),
			state: Mutex::default(),
		});

		spawn(watch_runtime(
			Arc::downgrade(&inner),
			dispose.clone(),
			runtime_rx,
			initial_condition,
		));

		Self {
			inner,
			_stop_on_drop: dispose.drop_guard(),
		}
	}

	#[must_use]
	pub fn peer(&self) -> &PeerId {
		&self.inner.peer
	}

	/// Takes a new snapshot from the peer. Applies it right away, or holds it while the host
	/// is in an unsafe period; only the latest held snapshot survives.
	pub fn receive(&self, snapshot: Arc<AppearanceSnapshot>, forced: bool) {
		self.inner.receive(snapshot, forced);
	}

	/// Called when one of the peer's entities shows up; reapplies if an earlier application
	/// was interrupted
	pub fn entity_appeared(&self) {
		let latest = {
			let mut state = self.inner.state.lock();
			if !state.reapply_owed {
				return;
			}
			state.reapply_owed = false;
			state.latest.clone()
		};

		if let Some(latest) = latest {
			debug!(peer = %self.inner.peer, "Entity is back, reapplying;");
			self.inner.receive(latest, true);
		}
	}

	#[must_use]
	pub fn last_applied_hash(&self) -> Option<DataHash> {
		self.inner
			.state
			.lock()
			.last_applied
			.as_ref()
			.map(|snapshot| snapshot.data_hash().clone())
	}

	#[must_use]
	pub fn resolved_paths(&self) -> BTreeMap<EntityKind, ResolvedPaths> {
		self.inner.state.lock().resolved.clone()
	}

	#[must_use]
	pub fn reapply_owed(&self) -> bool {
		self.inner.state.lock().reapply_owed
	}

	#[must_use]
	pub fn phase(&self) -> watch::Receiver<SyncPhase> {
		self.inner.phase_tx.subscribe()
	}

	#[must_use]
	pub fn current_phase(&self) -> SyncPhase {
		*self.inner.phase_tx.borrow()
	}

	/// Cancels whatever is in flight and, unless the host is in an unsafe period, reverts
	/// everything applied to the peer's entities
	#[instrument(skip(self), fields(peer = %self.inner.peer))]
	pub async fn dispose(&self) {
		let inner = &self.inner;
		if inner.dispose.is_cancelled() {
			return;
		}

		inner.dispose.cancel();
		inner.phase_tx.send_replace(SyncPhase::Disposed);

		let _sequential = inner.apply_lock.lock().await;

		if inner.runtime.current().is_unsafe() {
			info!("Host is in an unsafe period, leaving applied state in place;");
			return;
		}

		inner.revert_all().await;
		info!("Peer disposed;");
	}
}

impl Inner {
	fn receive(self: &Arc<Self>, snapshot: Arc<AppearanceSnapshot>, forced: bool) {
		if self.dispose.is_cancelled() {
			debug!(peer = %self.peer, "Ignoring snapshot for disposed peer;");
			return;
		}

		{
			let mut state = self.state.lock();

			if state.do_not_retry_for.as_ref() != Some(snapshot.data_hash()) {
				state.do_not_retry.clear();
				state.do_not_retry_for = Some(snapshot.data_hash().clone());
			}

			state.latest = Some(Arc::clone(&snapshot));

			if self.runtime.current().is_unsafe() {
				if state.deferred.replace((snapshot, forced)).is_some() {
					debug!(peer = %self.peer, "Replaced deferred snapshot;");
				}
				drop(state);
				self.phase_tx.send_replace(SyncPhase::Deferred);
				return;
			}

			state.deferred = None;
		}

		self.start_apply(snapshot, forced);
	}

	fn start_apply(self: &Arc<Self>, snapshot: Arc<AppearanceSnapshot>, forced: bool) {
		let generation = self.apply_slot.advance();
		self.phase_tx.send_replace(SyncPhase::Resolving);

		spawn(Arc::clone(self).run_apply(generation, snapshot, forced));
	}

	#[instrument(
		skip_all,
		fields(peer = %self.peer, data_hash = %snapshot.data_hash(), generation = generation.id(), forced)
	)]
	async fn run_apply(
		self: Arc<Self>,
		generation: Generation,
		snapshot: Arc<AppearanceSnapshot>,
		forced: bool,
	) {
		let _sequential = self.apply_lock.lock().await;

		if generation.is_cancelled() {
			trace!("Superseded before starting;");
			return;
		}

		match self.apply(&generation, &snapshot, forced).await {
			Ok(true) => info!("Applied peer appearance;"),
			Ok(false) => debug!("Snapshot already applied, nothing to do;"),
			Err(Error::Cancelled) if !self.apply_slot.is_current(&generation) => {
				trace!("Superseded by a newer snapshot;");
			}
			Err(e @ (Error::Cancelled | Error::EntityMissing(_))) => {
				if !self.dispose.is_cancelled() {
					self.state.lock().reapply_owed = true;
					debug!(%e, "Application interrupted, will reapply once the entity is back;");
				}
			}
			Err(e) => warn!(%e, "Failed to apply peer appearance, keeping the previous state;"),
		}

		if self.apply_slot.is_current(&generation) {
			self.settle_phase();
		}
	}

	pub(crate) fn set_phase_if_current(&self, generation: &Generation, phase: SyncPhase) {
		if self.apply_slot.is_current(generation) && !self.dispose.is_cancelled() {
			self.phase_tx.send_replace(phase);
		}
	}

	fn settle_phase(&self) {
		let phase = if self.dispose.is_cancelled() {
			SyncPhase::Disposed
		} else if self.state.lock().deferred.is_some() {
			SyncPhase::Deferred
		} else {
			SyncPhase::Idle
		};

		self.phase_tx.send_replace(phase);
	}

	fn interrupt_for_zoning(&self) {
		if matches!(
			*self.phase_tx.borrow(),
			SyncPhase::Resolving | SyncPhase::Downloading | SyncPhase::Applying
		) {
			debug!(peer = %self.peer, "Zoning started, cancelling application;");
			self.state.lock().reapply_owed = true;
			self.apply_slot.cancel();
		}
	}

	fn release_deferred(self: &Arc<Self>) {
		let deferred = self.state.lock().deferred.take();

		if let Some((snapshot, forced)) = deferred {
			debug!(peer = %self.peer, data_hash = %snapshot.data_hash(), "Unsafe period over, applying deferred snapshot;");
			self.start_apply(snapshot, forced);
		}
	}
}

async fn watch_runtime(
	inner: Weak<Inner>,
	dispose: CancellationToken,
	mut runtime_rx: watch::Receiver<RuntimeCondition>,
	mut previous: RuntimeCondition,
) {
	enum Event {
		Changed,
		Stop,
	}

	loop {
		let event = (
			async {
				if runtime_rx.changed().await.is_ok() {
					Event::Changed
				} else {
					Event::Stop
				}
			},
			async {
				dispose.cancelled().await;
				Event::Stop
			},
		)
			.race()
			.await;

		if matches!(event, Event::Stop) {
			break;
		}

		let current = *runtime_rx.borrow_and_update();
		let Some(inner) = inner.upgrade() else {
			break;
		};

		if current.zoning && !previous.zoning {
			inner.interrupt_for_zoning();
		}

		// a short unsafe blip can be coalesced away, so any safe condition releases
		if !current.is_unsafe() {
			inner.release_deferred();
		}

		previous = current;
	}
}

/// Runs `fut` unless `token` fires first
pub(crate) async fn cancellable<T>(
	token: &CancellationToken,
	fut: impl Future<Output = T>,
) -> Result<T, Error> {
	enum Outcome<T> {
		Done(T),
		Cancelled,
	}

	if token.is_cancelled() {
		return Err(Error::Cancelled);
	}

	match (async { Outcome::Done(fut.await) }, async {
		token.cancelled().await;
		Outcome::Cancelled
	})
		.race()
		.await
	{
		Outcome::Done(value) => Ok(value),
		Outcome::Cancelled => Err(Error::Cancelled),
	}
}

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

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use async_channel as chan;
use lg_appearance::{AppearanceSnapshot, EntityKind};
use lg_core_peer_sync::{
	ApplyGate, Downloader, EntityLocator, PeerId, PeerSyncContext, RenderFacets, RuntimeMonitor,
};
use lg_core_snapshot_aggregator::{Composer, SnapshotAggregator};
use lg_file_cache::ContentCache;
use lg_utils::error::report_error;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info, instrument};
use tracing_appender::non_blocking::WorkerGuard;

pub mod config;
mod logging;
mod maintenance;
mod registry;
mod tick;

pub use config::AppConfig;
pub use logging::init_logger;
pub use maintenance::spawn_cache_maintenance;
pub use registry::PeerRegistry;
pub use tick::{BoxedSource, TickDriver};

/// Everything the host provides to a node
pub struct Collaborators {
	/// Live entities of the local user, one per kind
	pub sources: Vec<(EntityKind, BoxedSource)>,
	pub composer: Arc<dyn Composer>,
	pub facets: RenderFacets,
	pub downloader: Arc<dyn Downloader>,
	pub locator: Arc<dyn EntityLocator>,
}

/// A running Looking Glass instance: publishes the local user's appearance and keeps every
/// connected peer's entities in sync with theirs.
pub struct Node {
	pub config: AppConfig,
	pub cache: Arc<ContentCache>,
	aggregator: SnapshotAggregator,
	registry: PeerRegistry,
	runtime: RuntimeMonitor,
	stop: CancellationToken,
	listener: JoinHandle<()>,
	maintenance: JoinHandle<()>,
	_stop_on_drop: DropGuard,
	_log_guard: WorkerGuard,
}

impl Node {
	/// Loads (or creates) the config in `data_dir` and starts every background service.
	///
	/// The returned [`TickDriver`] must be ticked by the host for local changes to be seen.
	pub async fn new(
		data_dir: impl AsRef<Path>,
		collaborators: Collaborators,
	) -> Result<(Self, TickDriver)> {
		let data_dir = data_dir.as_ref();
		tokio::fs::create_dir_all(data_dir)
			.await
			.with_context(|| format!("creating data directory {}", data_dir.display()))?;

		let config = AppConfig::load_or_create(data_dir)?;
		let log_guard = init_logger(&config.logs_dir(), &config.log_level)?;

		tokio::fs::create_dir_all(&config.cache.source_root)
			.await
			.with_context(|| {
				format!(
					"creating source directory {}",
					config.cache.source_root.display()
				)
			})?;

		let cache = Arc::new(
			ContentCache::open(config.cache.content_cache())
				.await
				.context("opening content cache")?,
		);

		let Collaborators {
			sources,
			composer,
			facets,
			downloader,
			locator,
		} = collaborators;

		let runtime = RuntimeMonitor::new();
		let (changes_tx, changes_rx) = chan::unbounded();
		let driver = TickDriver::new(
			sources,
			config.sync.tracker(),
			&changes_tx,
			runtime.clone(),
		);

		let aggregator = SnapshotAggregator::new(
			config.sync.aggregator(),
			composer,
			Arc::new(tick::TrackerProbe::new(driver.handles())),
		);
		let listener = aggregator.spawn_listener(changes_rx);

		let stop = CancellationToken::new();
		let maintenance = spawn_cache_maintenance(
			Arc::clone(&cache),
			config.cache.reconcile_interval(),
			config.cache.max_cache_size_bytes,
			stop.child_token(),
		);

		let registry = PeerRegistry::new(PeerSyncContext {
			config: config.sync.peer_sync(),
			cache: Arc::clone(&cache),
			facets,
			downloader,
			locator,
			gate: ApplyGate::new(config.sync.max_concurrent_applies),
			runtime: runtime.clone(),
		});

		info!(data_dir = %data_dir.display(), "Node started;");

		Ok((
			Self {
				config,
				cache,
				aggregator,
				registry,
				runtime,
				_stop_on_drop: stop.clone().drop_guard(),
				stop,
				listener,
				maintenance,
				_log_guard: log_guard,
			},
			driver,
		))
	}

	/// Local snapshots as they get published, for the transport to send out
	#[must_use]
	pub fn outgoing(&self) -> watch::Receiver<Option<Arc<AppearanceSnapshot>>> {
		self.aggregator.subscribe()
	}

	pub async fn receive_from_peer(&self, peer: PeerId, snapshot: Arc<AppearanceSnapshot>) {
		self.registry.receive(peer, snapshot, false).await;
	}

	/// Same as [`receive_from_peer`](Self::receive_from_peer) but reapplies every facet
	/// even when the snapshot is unchanged
	pub async fn force_from_peer(&self, peer: PeerId, snapshot: Arc<AppearanceSnapshot>) {
		self.registry.receive(peer, snapshot, true).await;
	}

	#[must_use]
	pub const fn peers(&self) -> &PeerRegistry {
		&self.registry
	}

	#[must_use]
	pub const fn runtime(&self) -> &RuntimeMonitor {
		&self.runtime
	}

	/// Stops every loop and reverts all peers
	#[instrument(skip(self))]
	pub async fn shutdown(self) {
		self.aggregator.shutdown();
		self.stop.cancel();

		self.registry.shutdown().await;

		report_error(&self.listener.await);
		report_error(&self.maintenance.await);

		info!("Node shut down;");
	}
}

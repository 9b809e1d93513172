use std::{collections::HashMap, sync::Arc};

use futures_concurrency::future::Join;
use lg_appearance::AppearanceSnapshot;
use lg_core_peer_sync::{PeerId, PeerSyncContext, PeerSyncEngine};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Default)]
struct Peers {
	active: HashMap<PeerId, Arc<PeerSyncEngine>>,
	/// Cancelled once the peer's previous engine finished reverting
	disposing: HashMap<PeerId, CancellationToken>,
}

/// One [`PeerSyncEngine`] per connected peer, created on the peer's first snapshot.
///
/// A peer that is being removed gets no new engine until the old one is done reverting, so
/// two engines never touch the same peer's entities at once.
pub struct PeerRegistry {
	ctx: PeerSyncContext,
	peers: RwLock<Peers>,
}

impl PeerRegistry {
	#[must_use]
	pub fn new(ctx: PeerSyncContext) -> Self {
		Self {
			ctx,
			peers: RwLock::default(),
		}
	}

	pub async fn receive(&self, peer: PeerId, snapshot: Arc<AppearanceSnapshot>, forced: bool) {
		self.engine(peer).await.receive(snapshot, forced);
	}

	/// Routes an "entity showed up" signal from the host to the owning peer
	pub async fn entity_appeared(&self, peer: &PeerId) {
		if let Some(engine) = self.get(peer).await {
			engine.entity_appeared();
		}
	}

	pub async fn get(&self, peer: &PeerId) -> Option<Arc<PeerSyncEngine>> {
		self.peers.read().await.active.get(peer).cloned()
	}

	pub async fn peers(&self) -> Vec<PeerId> {
		self.peers.read().await.active.keys().cloned().collect()
	}

	/// Forgets a peer, reverting whatever was applied to its entities
	pub async fn remove(&self, peer: &PeerId) -> bool {
		let (engine, done) = {
			let mut peers = self.peers.write().await;
			let Some(engine) = peers.active.remove(peer) else {
				return false;
			};

			let done = CancellationToken::new();
			peers.disposing.insert(peer.clone(), done.clone());
			(engine, done)
		};

		engine.dispose().await;

		self.peers.write().await.disposing.remove(peer);
		done.cancel();

		info!(%peer, "Peer removed;");
		true
	}

	/// Disposes every peer concurrently
	pub async fn shutdown(&self) {
		let peers = self
			.peers
			.read()
			.await
			.active
			.keys()
			.cloned()
			.collect::<Vec<_>>();

		debug!(peers = peers.len(), "Disposing all peers;");

		peers
			.iter()
			.map(|peer| self.remove(peer))
			.collect::<Vec<_>>()
			.join()
			.await;
	}

	async fn engine(&self, peer: PeerId) -> Arc<PeerSyncEngine> {
		loop {
			if let Some(engine) = self.get(&peer).await {
				return engine;
			}

			let previous = {
				let mut peers = self.peers.write().await;

				let Some(done) = peers.disposing.get(&peer).cloned() else {
					return Arc::clone(peers.active.entry(peer).or_insert_with_key(|peer| {
						debug!(%peer, "New peer, starting sync engine;");
						Arc::new(PeerSyncEngine::new(peer.clone(), &self.ctx))
					}));
				};
				done
			};

			debug!(%peer, "Waiting for the previous engine to finish reverting;");
			previous.cancelled().await;
		}
	}
}

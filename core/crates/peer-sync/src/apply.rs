use std::{
	collections::{BTreeMap, BTreeSet},
	sync::Arc,
};

use lg_appearance::{diff, AppearanceSnapshot, EntityHandle, EntityKind, PeerChange, PeerChanges};
use lg_utils::generation::Generation;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
	engine::{cancellable, AppliedFacets, Inner, SyncPhase},
	resolve::resolve,
	CollectionId, DownloadError, DownloadOutcome, Error, FacetError, ModCollectionFacet,
	RedrawFacet, ResolvedPaths,
};

fn facet_ok(res: Result<(), FacetError>, kind: EntityKind, facet: &'static str) -> bool {
	match res {
		Ok(()) => true,
		Err(e) => {
			warn!(%kind, facet, ?e, "Render facet call failed, skipping it;");
			false
		}
	}
}

impl Inner {
	/// Runs one application. `Ok(false)` means there was nothing to do.
	pub(crate) async fn apply(
		&self,
		generation: &Generation,
		snapshot: &Arc<AppearanceSnapshot>,
		forced: bool,
	) -> Result<bool, Error> {
		let last_applied = self.state.lock().last_applied.clone();

		if !forced
			&& last_applied
				.as_ref()
				.is_some_and(|last| last.data_hash() == snapshot.data_hash())
		{
			return Ok(false);
		}

		let changes = diff(last_applied.as_deref(), snapshot, forced);
		if changes.is_empty() {
			self.state.lock().last_applied = Some(Arc::clone(snapshot));
			return Ok(false);
		}

		trace!(?changes, "Computed changes against last applied snapshot;");

		let needs_files = changes
			.values()
			.any(|kind_changes| kind_changes.contains(&PeerChange::ModFiles));

		let resolved = if needs_files {
			self.resolve_with_downloads(generation, snapshot).await?
		} else {
			self.state.lock().resolved.clone()
		};

		self.set_phase_if_current(generation, SyncPhase::Applying);
		let token = generation.token();
		let _permit = cancellable(token, self.gate.acquire()).await??;

		let absent = self
			.apply_changes(token, snapshot, &changes, &resolved)
			.await?;

		if !absent.is_empty() {
			debug!(?absent, "Some entities are not present, will reapply once they appear;");
		}

		let mut state = self.state.lock();
		state.last_applied = Some(Arc::clone(snapshot));
		state.resolved = resolved;
		state.reapply_owed = !absent.is_empty();

		Ok(true)
	}

	/// Resolves every referenced file, asking the peer for misses between rounds
	async fn resolve_with_downloads(
		&self,
		generation: &Generation,
		snapshot: &AppearanceSnapshot,
	) -> Result<BTreeMap<EntityKind, ResolvedPaths>, Error> {
		let token = generation.token();
		let mut resolution = resolve(&self.cache, snapshot).await;
		let mut attempts = 0;

		while !resolution.missing.is_empty() {
			let retryable = {
				let state = self.state.lock();
				resolution
					.missing
					.iter()
					.filter(|hash| !state.do_not_retry.contains(*hash))
					.cloned()
					.collect::<Vec<_>>()
			};

			if retryable.is_empty() {
				return Err(Error::Unresolvable {
					missing: resolution.missing.into_iter().collect(),
				});
			}

			if attempts >= self.config.max_download_attempts {
				return Err(Error::DownloadsExhausted {
					attempts,
					missing: resolution.missing.into_iter().collect(),
				});
			}

			if attempts > 0 {
				cancellable(token, sleep(self.config.download_retry_delay)).await?;
			}
			attempts += 1;

			self.set_phase_if_current(generation, SyncPhase::Downloading);
			debug!(
				attempt = attempts,
				missing = retryable.len(),
				"Requesting missing files from peer;"
			);

			match cancellable(
				token,
				self.downloader.request_batch(&self.peer, &retryable, token),
			)
			.await?
			{
				Ok(outcome) => self.ingest_downloads(outcome).await,
				Err(DownloadError::Cancelled) => return Err(Error::Cancelled),
				Err(e) => warn!(attempt = attempts, ?e, "Download round failed;"),
			}

			resolution = resolve(&self.cache, snapshot).await;
		}

		Ok(resolution.paths)
	}

	async fn ingest_downloads(&self, outcome: DownloadOutcome) {
		let mut rejected = Vec::new();

		for file in outcome.files {
			match self.cache.ingest(&file.path).await {
				Some(record) if record.hash == file.hash => {
					trace!(hash = %file.hash, "Downloaded file ingested;");
				}
				Some(record) => {
					warn!(
						expected = %file.hash,
						found = %record.hash,
						"Downloaded file has unexpected content;"
					);
					rejected.push(file.hash);
				}
				None => rejected.push(file.hash),
			}
		}

		let mut state = self.state.lock();
		state.do_not_retry.extend(rejected);
		state.do_not_retry.extend(outcome.unavailable);
	}

	/// Pushes `changes` onto the peer's entities and returns the kinds that were skipped
	/// because their entity isn't present. Only a missing player aborts the whole application.
	async fn apply_changes(
		&self,
		token: &CancellationToken,
		snapshot: &AppearanceSnapshot,
		changes: &PeerChanges,
		resolved: &BTreeMap<EntityKind, ResolvedPaths>,
	) -> Result<BTreeSet<EntityKind>, Error> {
		if snapshot.fragment(EntityKind::Player).is_some()
			&& self.locator.locate(&self.peer, EntityKind::Player).is_none()
		{
			return Err(Error::EntityMissing(EntityKind::Player));
		}

		let mut absent = BTreeSet::new();

		let mod_kinds = changes
			.iter()
			.filter(|(_, kind_changes)| {
				kind_changes.contains(&PeerChange::ModFiles)
					|| kind_changes.contains(&PeerChange::ModManipulation)
			})
			.map(|(kind, _)| *kind)
			.collect::<Vec<_>>();

		if !mod_kinds.is_empty() {
			match self.facets.mods() {
				Some(mods) => {
					self.apply_mods(token, mods, snapshot, &mod_kinds, resolved, &mut absent)
						.await?;
				}
				None => debug!("Mod collection facet unavailable, skipping files;"),
			}
		}

		for (&kind, kind_changes) in changes {
			let fragment = snapshot.fragment(kind);

			let Some(entity) = self.locator.locate(&self.peer, kind) else {
				if fragment.is_some() {
					absent.insert(kind);
					continue;
				}
				// gone on both sides, nothing left to revert on it
				self.state.lock().applied.remove(&kind);
				continue;
			};

			if kind_changes.contains(&PeerChange::Customization) {
				if let Some(facet) = self.facets.customization() {
					let data = fragment
						.map(|fragment| fragment.customization.as_str())
						.filter(|data| !data.is_empty());

					let res = match data {
						Some(data) => cancellable(token, facet.apply(entity, data)).await?,
						None => cancellable(token, facet.revert(entity)).await?,
					};

					if facet_ok(res, kind, "customization") {
						self.mark(kind, entity, |applied| applied.customization = data.is_some());
					}
				}
			}

			if kind_changes.contains(&PeerChange::ScaleOffset) {
				if let Some(facet) = self.facets.scale_offset() {
					let offset = fragment.and_then(|fragment| fragment.scale_offset);

					let res = match offset {
						Some(offset) => cancellable(token, facet.apply(entity, offset)).await?,
						None => cancellable(token, facet.revert(entity)).await?,
					};

					if facet_ok(res, kind, "scale_offset") {
						self.mark(kind, entity, |applied| applied.scale_offset = offset.is_some());
					}
				}
			}

			for change in kind_changes {
				let PeerChange::Addon(addon) = *change else {
					continue;
				};

				let Some(facet) = self.facets.addon(addon) else {
					trace!(%kind, %addon, "Add-on facet unavailable, skipping;");
					continue;
				};

				let data = fragment.and_then(|fragment| fragment.addons.get(&addon));

				let res = match data {
					Some(data) => cancellable(token, facet.apply(entity, data)).await?,
					None => cancellable(token, facet.revert(entity)).await?,
				};

				if facet_ok(res, kind, "addon") {
					self.mark(kind, entity, |applied| {
						if data.is_some() {
							applied.addons.insert(addon);
						} else {
							applied.addons.remove(&addon);
						}
					});
				}
			}

			if kind_changes.contains(&PeerChange::ForcedRedraw) {
				if let Some(redraw) = self.facets.redraw() {
					if facet_ok(cancellable(token, redraw.redraw(entity)).await?, kind, "redraw") {
						// later kinds may be drawn attached to this one
						self.wait_for_redraw(token, redraw, entity).await?;
					}
				}
			}
		}

		Ok(absent)
	}

	async fn apply_mods(
		&self,
		token: &CancellationToken,
		mods: &dyn ModCollectionFacet,
		snapshot: &AppearanceSnapshot,
		kinds: &[EntityKind],
		resolved: &BTreeMap<EntityKind, ResolvedPaths>,
		absent: &mut BTreeSet<EntityKind>,
	) -> Result<(), Error> {
		let Some(collection) = self.ensure_collection(token, mods).await? else {
			return Ok(());
		};

		for &kind in kinds {
			let entity = self.locator.locate(&self.peer, kind);

			match (snapshot.fragment(kind), entity) {
				(Some(fragment), Some(entity)) => {
					let paths = resolved.get(&kind).cloned().unwrap_or_default();

					let set = cancellable(
						token,
						mods.set_mods(collection, kind, &paths, &fragment.manipulation_data),
					)
					.await?;

					if facet_ok(set, kind, "mods")
						&& facet_ok(
							cancellable(token, mods.assign(collection, entity)).await?,
							kind,
							"mods",
						) {
						self.mark(kind, entity, |applied| applied.mods = true);
					}
				}
				(Some(_), None) => {
					absent.insert(kind);
				}
				(None, Some(entity)) => {
					if facet_ok(
						cancellable(token, mods.unassign(collection, entity)).await?,
						kind,
						"mods",
					) {
						self.mark(kind, entity, |applied| applied.mods = false);
					}
				}
				(None, None) => {}
			}
		}

		Ok(())
	}

	/// The peer's collection, created on first use and reused afterwards
	async fn ensure_collection(
		&self,
		token: &CancellationToken,
		mods: &dyn ModCollectionFacet,
	) -> Result<Option<CollectionId>, Error> {
		if let Some(collection) = self.state.lock().collection {
			return Ok(Some(collection));
		}

		match cancellable(token, mods.create_collection(&self.peer)).await? {
			Ok(collection) => {
				debug!(%collection, "Created mod collection for peer;");
				self.state.lock().collection = Some(collection);
				Ok(Some(collection))
			}
			Err(e) => {
				warn!(?e, "Failed to create mod collection, skipping files;");
				Ok(None)
			}
		}
	}

	async fn wait_for_redraw(
		&self,
		token: &CancellationToken,
		redraw: &dyn RedrawFacet,
		entity: EntityHandle,
	) -> Result<(), Error> {
		let started = Instant::now();

		while redraw.is_drawing(entity) {
			if started.elapsed() >= self.config.draw_wait_timeout {
				warn!(%entity, "Entity still drawing after timeout, continuing;");
				break;
			}

			cancellable(token, sleep(self.config.draw_poll_interval)).await?;
		}

		Ok(())
	}

	fn mark(&self, kind: EntityKind, entity: EntityHandle, f: impl FnOnce(&mut AppliedFacets)) {
		let mut state = self.state.lock();
		let applied = state.applied.entry(kind).or_default();
		applied.entity = Some(entity);
		f(applied);
	}

	/// Takes everything back off the peer's entities: add-ons, customization, scale/offset,
	/// then the mod assignment, and finally releases the collection
	pub(crate) async fn revert_all(&self) {
		let (applied, collection) = {
			let mut state = self.state.lock();
			(
				std::mem::take(&mut state.applied),
				state.collection.take(),
			)
		};

		let mods = self.facets.mods();

		for (kind, facets) in applied.into_iter().rev() {
			let located = self.locator.locate(&self.peer, kind);
			let Some(entity) = located.filter(|entity| Some(*entity) == facets.entity) else {
				warn!(%kind, "Can't confirm entity is still present, not reverting it;");
				continue;
			};

			for addon in &facets.addons {
				if let Some(facet) = self.facets.addon(*addon) {
					facet_ok(facet.revert(entity).await, kind, "addon");
				}
			}

			if facets.customization {
				if let Some(facet) = self.facets.customization() {
					facet_ok(facet.revert(entity).await, kind, "customization");
				}
			}

			if facets.scale_offset {
				if let Some(facet) = self.facets.scale_offset() {
					facet_ok(facet.revert(entity).await, kind, "scale_offset");
				}
			}

			if let (true, Some(mods), Some(collection)) = (facets.mods, mods, collection) {
				facet_ok(mods.unassign(collection, entity).await, kind, "mods");

				if let Some(redraw) = self.facets.redraw() {
					facet_ok(redraw.redraw(entity).await, kind, "redraw");
				}
			}
		}

		if let (Some(mods), Some(collection)) = (mods, collection) {
			if let Err(e) = mods.remove_collection(collection).await {
				warn!(%collection, ?e, "Failed to remove peer's mod collection;");
			}
		}
	}
}

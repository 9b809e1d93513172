//! Interfaces to the host's render plugins and to the transport. Every facet is optional and
//! may come and go at runtime, so callers always check [`is_available`] before using one.
//!
//! [`is_available`]: ModCollectionFacet::is_available

use std::{collections::BTreeMap, fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use lg_appearance::{AddonKind, ContentHash, EntityHandle, EntityKind, ScaleOffset};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{PeerId, ResolvedPaths};

#[derive(Error, Debug)]
pub enum FacetError {
	#[error("facet is not available")]
	Unavailable,
	#[error("entity {0} is gone")]
	EntityGone(EntityHandle),
	#[error("facet call failed: {0}")]
	Failed(String),
}

/// Isolated mod collection owned by one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionId(Uuid);

impl CollectionId {
	#[must_use]
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for CollectionId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for CollectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

#[async_trait]
pub trait ModCollectionFacet: Send + Sync {
	fn is_available(&self) -> bool;

	async fn create_collection(&self, peer: &PeerId) -> Result<CollectionId, FacetError>;

	/// Replaces the files and manipulation data `kind` gets from the collection
	async fn set_mods(
		&self,
		collection: CollectionId,
		kind: EntityKind,
		paths: &ResolvedPaths,
		manipulation_data: &str,
	) -> Result<(), FacetError>;

	async fn assign(&self, collection: CollectionId, entity: EntityHandle) -> Result<(), FacetError>;

	async fn unassign(
		&self,
		collection: CollectionId,
		entity: EntityHandle,
	) -> Result<(), FacetError>;

	async fn remove_collection(&self, collection: CollectionId) -> Result<(), FacetError>;
}

#[async_trait]
pub trait CustomizationFacet: Send + Sync {
	fn is_available(&self) -> bool;

	async fn apply(&self, entity: EntityHandle, data: &str) -> Result<(), FacetError>;

	async fn revert(&self, entity: EntityHandle) -> Result<(), FacetError>;
}

#[async_trait]
pub trait ScaleOffsetFacet: Send + Sync {
	fn is_available(&self) -> bool;

	async fn apply(&self, entity: EntityHandle, offset: ScaleOffset) -> Result<(), FacetError>;

	async fn revert(&self, entity: EntityHandle) -> Result<(), FacetError>;
}

/// One cosmetic add-on plugin, carrying its data as an opaque string
#[async_trait]
pub trait AddonFacet: Send + Sync {
	fn is_available(&self) -> bool;

	async fn apply(&self, entity: EntityHandle, data: &str) -> Result<(), FacetError>;

	async fn revert(&self, entity: EntityHandle) -> Result<(), FacetError>;
}

#[async_trait]
pub trait RedrawFacet: Send + Sync {
	fn is_available(&self) -> bool;

	async fn redraw(&self, entity: EntityHandle) -> Result<(), FacetError>;

	fn is_drawing(&self, entity: EntityHandle) -> bool;
}

/// Everything the host offers for changing how an entity looks
#[derive(Clone, Default)]
pub struct RenderFacets {
	pub mods: Option<Arc<dyn ModCollectionFacet>>,
	pub customization: Option<Arc<dyn CustomizationFacet>>,
	pub scale_offset: Option<Arc<dyn ScaleOffsetFacet>>,
	pub addons: BTreeMap<AddonKind, Arc<dyn AddonFacet>>,
	pub redraw: Option<Arc<dyn RedrawFacet>>,
}

impl RenderFacets {
	pub(crate) fn mods(&self) -> Option<&dyn ModCollectionFacet> {
		self.mods.as_deref().filter(|facet| facet.is_available())
	}

	pub(crate) fn customization(&self) -> Option<&dyn CustomizationFacet> {
		self.customization
			.as_deref()
			.filter(|facet| facet.is_available())
	}

	pub(crate) fn scale_offset(&self) -> Option<&dyn ScaleOffsetFacet> {
		self.scale_offset
			.as_deref()
			.filter(|facet| facet.is_available())
	}

	pub(crate) fn addon(&self, kind: AddonKind) -> Option<&dyn AddonFacet> {
		self.addons
			.get(&kind)
			.map(|facet| &**facet)
			.filter(|facet| facet.is_available())
	}

	pub(crate) fn redraw(&self) -> Option<&dyn RedrawFacet> {
		self.redraw.as_deref().filter(|facet| facet.is_available())
	}
}

#[derive(Error, Debug)]
pub enum DownloadError {
	#[error("transfer failed: {0}")]
	Transfer(String),
	#[error("download was cancelled")]
	Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
	pub hash: ContentHash,
	pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadOutcome {
	/// Files now on disk, normally inside cache storage
	pub files: Vec<DownloadedFile>,
	/// Content the peer says it can't provide; never requested again for this snapshot
	pub unavailable: Vec<ContentHash>,
}

#[async_trait]
pub trait Downloader: Send + Sync {
	async fn request_batch(
		&self,
		peer: &PeerId,
		missing: &[ContentHash],
		cancel: &CancellationToken,
	) -> Result<DownloadOutcome, DownloadError>;
}

pub trait EntityLocator: Send + Sync {
	/// The peer's live entity of `kind`, if it's currently present
	fn locate(&self, peer: &PeerId, kind: EntityKind) -> Option<EntityHandle>;
}

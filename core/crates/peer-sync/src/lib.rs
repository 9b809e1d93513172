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

use std::{fmt, time::Duration};

use lg_appearance::{ContentHash, EntityKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod apply;
mod engine;
mod facets;
mod gate;
mod resolve;
mod runtime;

pub use engine::{PeerSyncContext, PeerSyncEngine, SyncPhase};
pub use facets::{
	AddonFacet, CollectionId, CustomizationFacet, DownloadError, DownloadOutcome, DownloadedFile,
	Downloader, EntityLocator, FacetError, ModCollectionFacet, RedrawFacet, RenderFacets,
	ScaleOffsetFacet,
};
pub use gate::ApplyGate;
pub use resolve::ResolvedPaths;
pub use runtime::{RuntimeCondition, RuntimeMonitor};

/// Identity of a remote peer as given by the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for PeerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[derive(Error, Debug)]
pub enum Error {
	#[error("application was cancelled")]
	Cancelled,
	#[error("entity <kind='{0}'> of the peer isn't present")]
	EntityMissing(EntityKind),
	#[error("{} file(s) can't be provided by the peer", .missing.len())]
	Unresolvable { missing: Vec<ContentHash> },
	#[error("{} file(s) still missing after {attempts} download attempts", .missing.len())]
	DownloadsExhausted {
		attempts: u32,
		missing: Vec<ContentHash>,
	},
	#[error("apply gate is closed")]
	GateClosed(#[from] tokio::sync::AcquireError),
}

#[derive(Debug, Clone, Copy)]
pub struct PeerSyncConfig {
	pub max_download_attempts: u32,
	pub download_retry_delay: Duration,
	/// Bound on waiting for a redraw to finish before the next kind is applied
	pub draw_wait_timeout: Duration,
	pub draw_poll_interval: Duration,
}

impl Default for PeerSyncConfig {
	fn default() -> Self {
		Self {
			max_download_attempts: 10,
			download_retry_delay: Duration::from_secs(2),
			draw_wait_timeout: Duration::from_secs(30),
			draw_poll_interval: Duration::from_millis(100),
		}
	}
}

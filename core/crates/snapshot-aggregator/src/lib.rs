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

use std::time::Duration;

use async_trait::async_trait;
use lg_appearance::{AppearanceFragment, EntityHandle, EntityKind};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod aggregator;

pub use aggregator::SnapshotAggregator;

#[derive(Error, Debug)]
pub enum ComposeError {
	#[error("entity <kind='{0}'> is not available to sample")]
	EntityUnavailable(EntityKind),
	#[error("fragment build was cancelled")]
	Cancelled,
	#[error("composition failed: {0}")]
	Failed(String),
}

/// Samples the host's appearance composition for one entity
#[async_trait]
pub trait Composer: Send + Sync + 'static {
	async fn build_fragment(
		&self,
		kind: EntityKind,
		handle: EntityHandle,
		cancel: &CancellationToken,
	) -> Result<AppearanceFragment, ComposeError>;
}

pub trait DrawStateProbe: Send + Sync + 'static {
	/// Whether the entity's render object is still being built
	fn is_drawing(&self, kind: EntityKind, handle: EntityHandle) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct AggregatorConfig {
	pub debounce: Duration,
	/// Upper bound on waiting for a render object to settle; sampling proceeds anyway after it
	pub draw_wait_timeout: Duration,
	pub draw_poll_interval: Duration,
}

impl Default for AggregatorConfig {
	fn default() -> Self {
		Self {
			debounce: Duration::from_secs(1),
			draw_wait_timeout: Duration::from_secs(30),
			draw_poll_interval: Duration::from_millis(100),
		}
	}
}

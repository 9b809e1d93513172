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

mod change;
mod diff;
mod entity;
mod file_graph;
mod snapshot;

pub use change::{ChangeSet, StateChangeReason};
pub use diff::{diff, PeerChange, PeerChanges};
pub use entity::{DrawState, EntityHandle, EntityKind};
pub use file_graph::{FileGraph, FileNode, NodeId};
pub use lg_file_cache::ContentHash;
pub use snapshot::{
	AddonKind, AppearanceFragment, AppearanceSnapshot, DataHash, FileReplacement,
	ReplacementSource, ScaleOffset, SnapshotError,
};

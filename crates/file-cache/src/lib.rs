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

use std::path::Path;

use lg_utils::error::FileIOError;
use thiserror::Error;

mod cache;
mod eviction;
mod hash;
mod path;
mod reconcile;
mod store;

pub use cache::{CacheRecord, CacheStats, ContentCache, ContentCacheConfig};
pub use eviction::EvictionReport;
pub use hash::{hash_file, ContentHash, CONTENT_HASH_LEN};
pub use path::{CacheRoots, Namespace, StoredPath};
pub use reconcile::ReconcileReport;

#[derive(Error, Debug)]
pub enum Error {
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("invalid content hash: '{0}'")]
	InvalidHash(String),
	#[error("failed to encode file cache record: {0}")]
	Encode(#[from] rmp_serde::encode::Error),
	#[error("file cache database error: {0}")]
	Database(#[from] redb::DatabaseError),
	#[error("file cache transaction error: {0}")]
	Transaction(#[from] redb::TransactionError),
	#[error("file cache table error: {0}")]
	Table(#[from] redb::TableError),
	#[error("file cache storage error: {0}")]
	Storage(#[from] redb::StorageError),
	#[error("file cache commit error: {0}")]
	Commit(#[from] redb::CommitError),
	#[error("blocking task failed: {0}")]
	BlockingTask(#[from] tokio::task::JoinError),
	#[error("path is outside both the source tree and cache storage: '{}'", .0.display())]
	OutsideRoots(Box<Path>),
	#[error("not a regular file: '{}'", .0.display())]
	NotAFile(Box<Path>),
	#[error("file was modified while being hashed: '{}'", .0.display())]
	ModifiedWhileHashing(Box<Path>),
	#[error("cache file content doesn't match its name: <path='{}', found='{found}'>", .path.display())]
	HashMismatch { path: Box<Path>, found: ContentHash },
}

use std::{fs::Metadata, io, path::PathBuf, time::SystemTime};

use lg_utils::error::FileIOError;
use tokio::fs;
use tracing::{debug, info, instrument, trace, warn};

use crate::{reconcile::walk_files, ContentCache};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
	pub deleted_files: usize,
	pub freed_bytes: u64,
	pub remaining_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EvictionCandidate {
	pub path: PathBuf,
	pub size: u64,
	pub last_used: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Eviction {
	Deleted,
	/// Used again since the pass was planned
	Spared,
	/// Already gone from disk
	Vanished,
}

fn last_used(metadata: &Metadata) -> SystemTime {
	metadata
		.accessed()
		.or_else(|_| metadata.modified())
		.unwrap_or(SystemTime::UNIX_EPOCH)
}

impl ContentCache {
	/// Deletes cache storage files, least recently accessed first, until the directory holds
	/// at most `max_bytes`. Records pointing at deleted files are dropped with them.
	#[instrument(skip(self))]
	pub async fn enforce_size_budget(&self, max_bytes: u64) -> EvictionReport {
		let candidates = self.eviction_candidates().await;

		let mut report = EvictionReport {
			remaining_bytes: candidates.iter().map(|candidate| candidate.size).sum(),
			..Default::default()
		};

		if report.remaining_bytes <= max_bytes {
			debug!(
				total_bytes = report.remaining_bytes,
				"Cache storage is within budget;"
			);
			return report;
		}

		for candidate in candidates {
			if report.remaining_bytes <= max_bytes {
				break;
			}

			match self.evict(&candidate).await {
				Ok(Eviction::Deleted) => {
					report.deleted_files += 1;
					report.freed_bytes += candidate.size;
					report.remaining_bytes -= candidate.size;
				}
				Ok(Eviction::Vanished) => report.remaining_bytes -= candidate.size,
				Ok(Eviction::Spared) => {
					trace!(path = %candidate.path.display(), "Cache file was used again, sparing it;");
				}
				Err(e) => warn!(?e, "Failed to evict cache file;"),
			}
		}

		info!(?report, "Enforced cache size budget;");

		report
	}

	/// Every cache storage file, least recently used first
	pub(crate) async fn eviction_candidates(&self) -> Vec<EvictionCandidate> {
		let mut candidates = walk_files(&self.roots.cache_dir)
			.await
			.into_iter()
			.map(|(path, metadata)| EvictionCandidate {
				last_used: last_used(&metadata),
				size: metadata.len(),
				path,
			})
			.collect::<Vec<_>>();

		candidates.sort_by_key(|candidate| candidate.last_used);

		candidates
	}

	/// Deletes one candidate and its record while holding the index lock, so a lookup can
	/// never hand out a path that is being deleted
	pub(crate) async fn evict(&self, candidate: &EvictionCandidate) -> Result<Eviction, FileIOError> {
		let mut index = self.index.lock().await;
		let key = self
			.roots
			.classify(&candidate.path)
			.map(|stored| stored.to_string());

		match fs::metadata(&candidate.path).await {
			Ok(metadata) if last_used(&metadata) > candidate.last_used => return Ok(Eviction::Spared),
			Ok(_) => {}
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				if let Some(key) = &key {
					self.delete_locked(&mut index, key, &candidate.path).await?;
				}
				return Ok(Eviction::Vanished);
			}
			Err(e) => {
				return Err(FileIOError::from((
					&candidate.path,
					e,
					"reading metadata to evict",
				)))
			}
		}

		match &key {
			Some(key) => self.delete_locked(&mut index, key, &candidate.path).await?,
			None => fs::remove_file(&candidate.path)
				.await
				.map_err(|e| FileIOError::from((&candidate.path, e, "deleting cache file")))?,
		}

		Ok(Eviction::Deleted)
	}
}

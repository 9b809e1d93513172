use std::{
	collections::HashSet,
	fs::Metadata,
	io,
	path::{Path, PathBuf},
	pin::pin,
};

use futures::{stream, StreamExt};
use lg_utils::error::FileIOError;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::{cache::Validation, ContentCache};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
	pub validated: usize,
	pub removed: usize,
	pub rehashed: usize,
	pub discovered: usize,
}

impl ContentCache {
	/// Validates every record against the disk, then ingests files nobody recorded yet.
	///
	/// A new call supersedes a running one, which then returns `None`. Records are processed
	/// one by one on a pool of half the available cores, so one bad file never ends the pass.
	#[instrument(skip(self), fields(generation))]
	pub async fn reconcile(&self) -> Option<ReconcileReport> {
		let generation = self.reconcile_generation.advance();
		tracing::Span::current().record("generation", generation.id());
		let token = generation.token().clone();

		let keys = self
			.index
			.lock()
			.await
			.by_key
			.keys()
			.cloned()
			.collect::<Vec<_>>();

		let mut report = ReconcileReport::default();

		let mut validations = pin!(stream::iter(keys)
			.map(|key| async move { self.validate_key(&key).await })
			.buffer_unordered(self.parallelism)
			.take_until(token.cancelled()));

		while let Some(validation) = validations.next().await {
			match validation {
				Validation::Valid(_) => report.validated += 1,
				Validation::Rehashed(_) => report.rehashed += 1,
				Validation::Removed => report.removed += 1,
				Validation::Unavailable => {}
			}
		}

		if token.is_cancelled() {
			debug!("Reconciliation superseded during validation;");
			return None;
		}

		let known = self
			.index
			.lock()
			.await
			.by_key
			.keys()
			.cloned()
			.collect::<HashSet<_>>();

		let mut seen = HashSet::new();
		let mut unknown = Vec::new();
		for root in [&self.roots.cache_dir, &self.roots.source_root] {
			for (path, _) in walk_files(root).await {
				if token.is_cancelled() {
					return None;
				}

				if path == self.database_path || !self.accepts_extension(&path) {
					continue;
				}

				if let Some(key) = self.roots.classify(&path).map(|stored| stored.to_string()) {
					if !known.contains(&key) && seen.insert(key) {
						unknown.push(path);
					}
				}
			}
		}

		let mut ingestions = pin!(stream::iter(unknown)
			.map(|path| async move { self.ingest(&path).await })
			.buffer_unordered(self.parallelism)
			.take_until(token.cancelled()));

		while let Some(record) = ingestions.next().await {
			if record.is_some() {
				report.discovered += 1;
			}
		}

		if token.is_cancelled() {
			debug!("Reconciliation superseded during discovery;");
			return None;
		}

		info!(?report, "Reconciled file cache;");

		Some(report)
	}

	/// Stops a running reconciliation without starting another
	pub fn cancel_reconcile(&self) {
		self.reconcile_generation.cancel();
	}

	fn accepts_extension(&self, path: &Path) -> bool {
		self.allowed_extensions.as_ref().map_or(true, |allowed| {
			path.extension()
				.and_then(|ext| ext.to_str())
				.is_some_and(|ext| allowed.contains(&ext.to_lowercase()))
		})
	}
}

/// Every regular file below `root`. Unreadable directories are logged and skipped, a missing
/// root yields nothing.
pub(crate) async fn walk_files(root: &Path) -> Vec<(PathBuf, Metadata)> {
	let mut files = Vec::new();
	let mut to_walk = vec![root.to_path_buf()];

	while let Some(dir) = to_walk.pop() {
		let mut read_dir = match fs::read_dir(&dir).await {
			Ok(read_dir) => read_dir,
			Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
			Err(e) => {
				let e = FileIOError::from((&dir, e, "reading directory"));
				warn!(?e, "Skipping unreadable directory;");
				continue;
			}
		};

		loop {
			let entry = match read_dir.next_entry().await {
				Ok(Some(entry)) => entry,
				Ok(None) => break,
				Err(e) => {
					let e = FileIOError::from((&dir, e, "reading directory entry"));
					warn!(?e, "Stopping walk of directory;");
					break;
				}
			};

			let path = entry.path();
			match entry.metadata().await {
				Ok(metadata) if metadata.is_dir() => to_walk.push(path),
				Ok(metadata) if metadata.is_file() => files.push((path, metadata)),
				Ok(_) => {}
				Err(e) => {
					let e = FileIOError::from((&path, e, "reading entry metadata"));
					warn!(?e, "Skipping entry;");
				}
			}
		}
	}

	files
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::collections::HashSet;

	use crate::{ContentCacheConfig, ContentHash};

	use pretty_assertions::assert_eq;
	use tempfile::tempdir;
	use tracing_test::traced_test;

	#[tokio::test]
	#[traced_test]
	async fn reconcile_discovers_new_files_and_drops_dead_ones() {
		let dir = tempdir().unwrap();
		let source = dir.path().join("source");
		std::fs::create_dir_all(source.join("chara")).unwrap();

		let mut config = ContentCacheConfig::new(&source, dir.path().join("cache"));
		config.allowed_extensions = Some(HashSet::from(["tex".to_string(), "mdl".to_string()]));
		let cache = ContentCache::open(config).await.unwrap();

		let doomed = source.join("chara").join("doomed.tex");
		std::fs::write(&doomed, b"doomed").unwrap();
		cache.ingest(&doomed).await.unwrap();
		std::fs::remove_file(&doomed).unwrap();

		std::fs::write(source.join("chara").join("body.MDL"), b"model").unwrap();
		std::fs::write(source.join("notes.txt"), b"ignored").unwrap();
		let stored_hash = ContentHash::of_bytes(b"stored");
		std::fs::write(cache.storage_path(&stored_hash, "tex"), b"stored").unwrap();

		let report = cache.reconcile().await.unwrap();
		assert_eq!(
			report,
			ReconcileReport {
				validated: 0,
				removed: 1,
				rehashed: 0,
				discovered: 2,
			}
		);

		assert!(cache.lookup(&ContentHash::of_bytes(b"model")).await.is_some());
		assert!(cache.lookup(&stored_hash).await.is_some());
		assert!(cache.lookup(&ContentHash::of_bytes(b"ignored")).await.is_none());

		let again = cache.reconcile().await.unwrap();
		assert_eq!(again.validated, 2);
		assert_eq!(again.discovered, 0);
	}

	#[tokio::test]
	async fn cancelled_reconcile_reports_nothing() {
		let dir = tempdir().unwrap();
		let source = dir.path().join("source");
		std::fs::create_dir_all(&source).unwrap();
		for i in 0..32 {
			std::fs::write(source.join(format!("{i}.tex")), i.to_string()).unwrap();
		}

		let cache = ContentCache::open(ContentCacheConfig::new(&source, dir.path().join("cache")))
			.await
			.unwrap();

		let (first, second) = tokio::join!(cache.reconcile(), async {
			tokio::task::yield_now().await;
			cache.reconcile().await
		});

		assert_eq!(first, None);
		assert!(second.is_some());
	}
}

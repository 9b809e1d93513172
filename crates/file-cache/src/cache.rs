use std::{
	collections::{BTreeSet, HashMap, HashSet},
	fs::{File, FileTimes},
	io,
	num::NonZeroUsize,
	path::{Path, PathBuf},
	thread::available_parallelism,
	time::SystemTime,
};

use lg_utils::{error::FileIOError, generation::GenerationSlot, system_time_to_ticks};
use tokio::{fs, sync::Mutex, task::spawn_blocking};
use tracing::{debug, error, instrument, trace, warn};

use crate::{
	hash::hash_file,
	path::{CacheRoots, StoredPath},
	store::{RecordStore, StoredValue},
	ContentHash, Error,
};

#[derive(Debug, Clone)]
pub struct ContentCacheConfig {
	/// Root of the composition source tree
	pub source_root: PathBuf,
	/// Directory where downloaded content is stored as `<hash>.<ext>`
	pub cache_dir: PathBuf,
	pub database_path: PathBuf,
	/// Lower-case extensions considered during discovery, `None` accepts every file
	pub allowed_extensions: Option<HashSet<String>>,
}

impl ContentCacheConfig {
	/// Puts the database next to the cache storage directory
	pub fn new(source_root: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
		let cache_dir = cache_dir.into();
		let database_path = cache_dir
			.parent()
			.unwrap_or(&cache_dir)
			.join("file_cache.redb");

		Self {
			source_root: source_root.into(),
			cache_dir,
			database_path,
			allowed_extensions: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
	pub hash: ContentHash,
	pub path: PathBuf,
	pub mtime_ticks: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
	pub records: usize,
	pub cache_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IndexEntry {
	pub hash: ContentHash,
	pub mtime_ticks: i64,
}

#[derive(Debug, Default)]
pub(crate) struct Index {
	pub by_key: HashMap<String, IndexEntry>,
	pub by_hash: HashMap<ContentHash, BTreeSet<String>>,
}

impl Index {
	fn insert(&mut self, key: String, entry: IndexEntry) {
		self.remove(&key);
		self.by_hash
			.entry(entry.hash.clone())
			.or_default()
			.insert(key.clone());
		self.by_key.insert(key, entry);
	}

	fn remove(&mut self, key: &str) -> Option<IndexEntry> {
		let entry = self.by_key.remove(key)?;

		if let Some(keys) = self.by_hash.get_mut(&entry.hash) {
			keys.remove(key);
			if keys.is_empty() {
				self.by_hash.remove(&entry.hash);
			}
		}

		Some(entry)
	}
}

/// What validating one stored key against the disk found
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Validation {
	Valid(PathBuf),
	/// Content changed on disk and is now recorded under another hash
	Rehashed(PathBuf),
	Removed,
	/// An I/O error other than "not found"; the record is kept for a later attempt
	Unavailable,
}

/// Content-addressed index over the source tree and cache storage.
///
/// The in-memory index and the redb table are only mutated while holding `index`. File
/// deletions happen under the same lock, in the same step as dropping their records.
pub struct ContentCache {
	pub(crate) roots: CacheRoots,
	pub(crate) allowed_extensions: Option<HashSet<String>>,
	pub(crate) database_path: PathBuf,
	store: RecordStore,
	pub(crate) index: Mutex<Index>,
	pub(crate) reconcile_generation: GenerationSlot,
	pub(crate) parallelism: usize,
}

impl ContentCache {
	#[instrument(skip_all, fields(source_root = %config.source_root.display(), cache_dir = %config.cache_dir.display()))]
	pub async fn open(config: ContentCacheConfig) -> Result<Self, Error> {
		fs::create_dir_all(&config.cache_dir)
			.await
			.map_err(|e| FileIOError::from((&config.cache_dir, e, "creating cache storage")))?;

		if let Some(parent) = config.database_path.parent() {
			fs::create_dir_all(parent)
				.await
				.map_err(|e| FileIOError::from((parent, e, "creating database directory")))?;
		}

		let store = {
			let database_path = config.database_path.clone();
			spawn_blocking(move || RecordStore::open(database_path)).await??
		};

		let mut index = Index::default();
		for (key, value) in store.load()? {
			match value.hash.parse::<ContentHash>() {
				Ok(hash) => index.insert(
					key,
					IndexEntry {
						hash,
						mtime_ticks: value.mtime_ticks,
					},
				),
				Err(e) => warn!(%key, %e, "Skipping file cache row with an invalid hash;"),
			}
		}

		debug!(records = index.by_key.len(), "Opened file cache;");

		Ok(Self {
			roots: CacheRoots {
				source_root: config.source_root,
				cache_dir: config.cache_dir,
			},
			allowed_extensions: config
				.allowed_extensions
				.map(|exts| exts.into_iter().map(|ext| ext.to_lowercase()).collect()),
			database_path: config.database_path,
			store,
			index: Mutex::new(index),
			reconcile_generation: GenerationSlot::new(),
			parallelism: (available_parallelism().map_or(1, NonZeroUsize::get) / 2).max(1),
		})
	}

	#[must_use]
	pub const fn roots(&self) -> &CacheRoots {
		&self.roots
	}

	/// Where content for `hash` lives once placed in cache storage
	#[must_use]
	pub fn storage_path(&self, hash: &ContentHash, extension: &str) -> PathBuf {
		let extension = extension.trim_start_matches('.');
		if extension.is_empty() {
			self.roots.cache_dir.join(hash.as_str())
		} else {
			self.roots
				.cache_dir
				.join(format!("{hash}.{}", extension.to_lowercase()))
		}
	}

	/// A path holding `hash`'s content, checked against the disk before being returned.
	///
	/// Stale candidates are repaired or dropped along the way. Cache storage paths are tried
	/// first and get their access time refreshed on a hit.
	pub async fn lookup(&self, hash: &ContentHash) -> Option<PathBuf> {
		let mut candidates = self
			.index
			.lock()
			.await
			.by_hash
			.get(hash)
			.map(|keys| keys.iter().cloned().collect::<Vec<_>>())
			.unwrap_or_default();

		candidates.sort_by_key(|key| !StoredPath::parse(key).is_cache());

		for key in candidates {
			match self.validate_key(&key).await {
				Validation::Valid(path) => {
					if StoredPath::parse(&key).is_cache() {
						// eviction deletes under the same lock, so a key still indexed here
						// has a file that survives until the touch lands
						let index = self.index.lock().await;
						if !index.by_key.contains_key(&key) {
							trace!(%hash, path = %path.display(), "Candidate evicted while validating;");
							continue;
						}
						touch_accessed(&path).await;
						drop(index);
					}
					return Some(path);
				}
				Validation::Rehashed(path) => {
					trace!(%hash, path = %path.display(), "Candidate content changed;");
				}
				Validation::Removed | Validation::Unavailable => {}
			}
		}

		None
	}

	/// [`lookup`](Self::lookup) for a batch, hits only
	pub async fn lookup_many<'h>(
		&self,
		hashes: impl IntoIterator<Item = &'h ContentHash>,
	) -> HashMap<ContentHash, PathBuf> {
		let mut found = HashMap::new();

		for hash in hashes {
			if found.contains_key(hash) {
				continue;
			}

			if let Some(path) = self.lookup(hash).await {
				found.insert(hash.clone(), path);
			}
		}

		found
	}

	/// Records `path` under its content hash. Failures are logged and reported as `None`.
	pub async fn ingest(&self, path: impl AsRef<Path> + Send) -> Option<CacheRecord> {
		let path = path.as_ref();

		match self.try_ingest(path).await {
			Ok(record) => Some(record),
			Err(e) => {
				warn!(path = %path.display(), ?e, "Failed to ingest file into the cache;");
				None
			}
		}
	}

	async fn try_ingest(&self, path: &Path) -> Result<CacheRecord, Error> {
		let stored = self
			.roots
			.classify(path)
			.ok_or_else(|| Error::OutsideRoots(path.into()))?;

		let metadata = fs::metadata(path)
			.await
			.map_err(|e| FileIOError::from((path, e, "reading metadata to ingest")))?;

		if !metadata.is_file() {
			return Err(Error::NotAFile(path.into()));
		}

		let mtime_ticks = modified_ticks(&metadata, path)?;
		let key = stored.to_string();

		if let Some(entry) = self.index.lock().await.by_key.get(&key) {
			if entry.mtime_ticks == mtime_ticks {
				return Ok(CacheRecord {
					hash: entry.hash.clone(),
					path: path.to_path_buf(),
					mtime_ticks,
				});
			}
		}

		let hash = hash_file(path).await?;

		if stored.is_cache() {
			if let Some(named) = hash_from_file_name(path) {
				if named != hash {
					if let Err(e) = self.delete_stored(&key, path).await {
						warn!(?e, "Failed to remove mismatched cache file;");
					}

					return Err(Error::HashMismatch {
						path: path.into(),
						found: hash,
					});
				}
			}
		}

		self.record_hashed(key, path, hash.clone(), mtime_ticks)
			.await?;

		trace!(%hash, path = %path.display(), "Ingested file;");

		Ok(CacheRecord {
			hash,
			path: path.to_path_buf(),
			mtime_ticks,
		})
	}

	pub async fn stats(&self) -> CacheStats {
		let records = self.index.lock().await.by_key.len();

		let cache_bytes = crate::reconcile::walk_files(&self.roots.cache_dir)
			.await
			.iter()
			.map(|(_, metadata)| metadata.len())
			.sum();

		CacheStats {
			records,
			cache_bytes,
		}
	}

	/// Checks one stored key against the disk, migrating legacy keys first
	pub(crate) async fn validate_key(&self, key: &str) -> Validation {
		let Some(entry) = self.index.lock().await.by_key.get(key).cloned() else {
			return Validation::Removed;
		};

		let mut stored = StoredPath::parse(key);
		if let StoredPath::Legacy(legacy) = &stored {
			match self.migrate(legacy, &entry).await {
				Some(migrated) => stored = migrated,
				None => return Validation::Removed,
			}
		}

		let key = stored.to_string();
		let Some(path) = stored.resolve(&self.roots) else {
			return Validation::Removed;
		};

		let metadata = match fs::metadata(&path).await {
			Ok(metadata) if metadata.is_file() => metadata,
			Ok(_) => {
				debug!(path = %path.display(), "Cached path is no longer a file;");
				return self.forget_if_gone(&key, &path).await;
			}
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				debug!(path = %path.display(), "Cached file disappeared;");
				return self.forget_if_gone(&key, &path).await;
			}
			Err(e) => {
				let e = FileIOError::from((&path, e, "validating cached file"));
				error!(?e, "Cached file is unavailable;");
				return Validation::Unavailable;
			}
		};

		let mtime_ticks = match modified_ticks(&metadata, &path) {
			Ok(ticks) => ticks,
			Err(e) => {
				error!(?e, "Failed to read modification time of cached file;");
				return Validation::Unavailable;
			}
		};

		if mtime_ticks == entry.mtime_ticks {
			return Validation::Valid(path);
		}

		self.rehash(key, &stored, path, &entry, mtime_ticks).await
	}

	async fn rehash(
		&self,
		key: String,
		stored: &StoredPath,
		path: PathBuf,
		previous: &IndexEntry,
		mtime_ticks: i64,
	) -> Validation {
		let hash = match hash_file(&path).await {
			Ok(hash) => hash,
			Err(Error::FileIO(e)) if e.is_not_found() => {
				return self.forget_if_gone(&key, &path).await;
			}
			Err(e) => {
				error!(path = %path.display(), ?e, "Failed to rehash modified file;");
				return Validation::Unavailable;
			}
		};

		// A cache storage file is named after its content, so different content is corruption
		if stored.is_cache() && hash_from_file_name(&path).is_some_and(|named| named != hash) {
			warn!(path = %path.display(), %hash, "Cache file content no longer matches its name, removing;");
			return match self.delete_stored(&key, &path).await {
				Ok(()) => Validation::Removed,
				Err(e) => {
					warn!(?e, "Failed to remove corrupt cache file;");
					Validation::Unavailable
				}
			};
		}

		let changed = hash != previous.hash;
		if changed {
			debug!(
				path = %path.display(),
				old = %previous.hash,
				new = %hash,
				"File content changed, moving record to its new hash;"
			);
		}

		if let Err(e) = self.record_hashed(key, &path, hash, mtime_ticks).await {
			warn!(path = %path.display(), ?e, "Failed to persist rehashed record;");
			return Validation::Unavailable;
		}

		if changed {
			Validation::Rehashed(path)
		} else {
			Validation::Valid(path)
		}
	}

	/// Moves a legacy key to its namespaced form, or drops it when it can't be placed
	async fn migrate(&self, legacy: &str, entry: &IndexEntry) -> Option<StoredPath> {
		let mut index = self.index.lock().await;

		let Some(migrated) = StoredPath::migrate_legacy(legacy, &self.roots) else {
			debug!(%legacy, "Dropping legacy record that can't be placed;");
			self.forget_locked(&mut index, vec![legacy.to_string()])
				.await;
			return None;
		};

		let key = migrated.to_string();
		let value = StoredValue {
			hash: entry.hash.to_string(),
			mtime_ticks: entry.mtime_ticks,
		};

		let already_migrated = index.by_key.contains_key(&key);
		let result = {
			let (legacy, key) = (legacy.to_string(), key.clone());
			self.on_store(move |store| {
				if already_migrated {
					store.remove(&legacy)
				} else {
					store.rename(&legacy, &key, &value)
				}
			})
			.await
		};

		if let Err(e) = result {
			error!(%legacy, %key, ?e, "Failed to migrate legacy record;");
			return None;
		}

		index.remove(legacy);
		if !already_migrated {
			index.insert(key.clone(), entry.clone());
		}

		debug!(%legacy, %key, "Migrated legacy record;");

		Some(migrated)
	}

	/// Records `hash` for `key`, unless `path` was modified since it was stat'ed at
	/// `mtime_ticks`. The check and the write share the index lock, so a concurrent
	/// validation of the same key can't slip an older hash in between.
	async fn record_hashed(
		&self,
		key: String,
		path: &Path,
		hash: ContentHash,
		mtime_ticks: i64,
	) -> Result<(), Error> {
		let mut index = self.index.lock().await;

		let metadata = fs::metadata(path)
			.await
			.map_err(|e| FileIOError::from((path, e, "re-reading metadata after hashing")))?;

		if modified_ticks(&metadata, path)? != mtime_ticks {
			return Err(Error::ModifiedWhileHashing(path.into()));
		}

		self.persist(&mut index, key, hash, mtime_ticks).await
	}

	async fn persist(
		&self,
		index: &mut Index,
		key: String,
		hash: ContentHash,
		mtime_ticks: i64,
	) -> Result<(), Error> {
		let value = StoredValue {
			hash: hash.to_string(),
			mtime_ticks,
		};

		{
			let key = key.clone();
			self.on_store(move |store| store.upsert(&key, &value))
				.await?;
		}

		index.insert(key, IndexEntry { hash, mtime_ticks });

		Ok(())
	}

	/// Drops `key` if `path` is still missing once the index lock is held
	async fn forget_if_gone(&self, key: &str, path: &Path) -> Validation {
		let mut index = self.index.lock().await;

		if fs::metadata(path)
			.await
			.is_ok_and(|metadata| metadata.is_file())
		{
			trace!(path = %path.display(), "File reappeared before its record was dropped;");
			return Validation::Unavailable;
		}

		self.forget_locked(&mut index, vec![key.to_string()])
			.await;

		Validation::Removed
	}

	/// Deletes a cache storage file together with its record
	pub(crate) async fn delete_stored(&self, key: &str, path: &Path) -> Result<(), FileIOError> {
		let mut index = self.index.lock().await;
		self.delete_locked(&mut index, key, path).await
	}

	pub(crate) async fn delete_locked(
		&self,
		index: &mut Index,
		key: &str,
		path: &Path,
	) -> Result<(), FileIOError> {
		match fs::remove_file(path).await {
			Ok(()) => {}
			Err(e) if e.kind() == io::ErrorKind::NotFound => {}
			Err(e) => return Err(FileIOError::from((path, e, "deleting cache file"))),
		}

		self.forget_locked(index, vec![key.to_string()]).await;

		Ok(())
	}

	async fn forget_locked(&self, index: &mut Index, keys: Vec<String>) {
		let keys = keys
			.into_iter()
			.filter(|key| index.remove(key).is_some())
			.collect::<Vec<_>>();

		if keys.is_empty() {
			return;
		}

		let count = keys.len();
		if let Err(e) = self
			.on_store(move |store| store.remove_many(keys.iter().map(String::as_str)))
			.await
		{
			error!(count, ?e, "Failed to remove file cache records;");
		}
	}

	/// Runs a redb transaction on the blocking pool
	async fn on_store<T: Send + 'static>(
		&self,
		f: impl FnOnce(&RecordStore) -> Result<T, Error> + Send + 'static,
	) -> Result<T, Error> {
		let store = self.store.clone();
		spawn_blocking(move || f(&store)).await?
	}

	#[cfg(test)]
	pub(crate) async fn insert_raw(&self, key: &str, hash: &ContentHash, mtime_ticks: i64) {
		let mut index = self.index.lock().await;
		self.persist(&mut index, key.to_string(), hash.clone(), mtime_ticks)
			.await
			.expect("record insert");
	}

	#[cfg(test)]
	pub(crate) fn store(&self) -> &RecordStore {
		&self.store
	}
}

fn modified_ticks(metadata: &std::fs::Metadata, path: &Path) -> Result<i64, Error> {
	metadata
		.modified()
		.map(system_time_to_ticks)
		.map_err(|e| FileIOError::from((path, e, "reading modification time")).into())
}

fn hash_from_file_name(path: &Path) -> Option<ContentHash> {
	path.file_stem()
		.and_then(|stem| stem.to_str())
		.and_then(|stem| stem.parse().ok())
}

async fn touch_accessed(path: &Path) {
	let path = path.to_path_buf();

	let res = spawn_blocking(move || {
		File::options()
			.write(true)
			.open(&path)
			.and_then(|file| file.set_times(FileTimes::new().set_accessed(SystemTime::now())))
			.map_err(|e| FileIOError::from((&path, e, "refreshing access time")))
	})
	.await;

	match res {
		Ok(Ok(())) => {}
		Ok(Err(e)) => warn!(?e, "Failed to refresh cache file access time;"),
		Err(e) => error!(?e, "Access time task panicked;"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use pretty_assertions::assert_eq;
	use tempfile::{tempdir, TempDir};
	use tracing_test::traced_test;

	async fn open_cache(dir: &TempDir) -> ContentCache {
		let source = dir.path().join("source");
		std::fs::create_dir_all(&source).unwrap();
		ContentCache::open(ContentCacheConfig::new(source, dir.path().join("cache")))
			.await
			.unwrap()
	}

	fn write(path: &Path, bytes: &[u8]) -> PathBuf {
		std::fs::create_dir_all(path.parent().unwrap()).unwrap();
		std::fs::write(path, bytes).unwrap();
		path.to_path_buf()
	}

	#[tokio::test]
	#[traced_test]
	async fn ingested_files_are_found_and_survive_reopening() {
		let dir = tempdir().unwrap();
		let hash = {
			let cache = open_cache(&dir).await;
			let path = write(&cache.roots.source_root.join("chara/body.tex"), b"body");

			let record = cache.ingest(&path).await.unwrap();
			assert_eq!(record.hash, ContentHash::of_bytes(b"body"));
			assert_eq!(cache.lookup(&record.hash).await, Some(path));

			record.hash
		};

		let cache = open_cache(&dir).await;
		assert_eq!(
			cache.lookup(&hash).await,
			Some(cache.roots.source_root.join("chara").join("body.tex"))
		);
		assert_eq!(cache.stats().await.records, 1);
	}

	#[tokio::test]
	#[traced_test]
	async fn deleted_files_heal_on_reingest() {
		let dir = tempdir().unwrap();
		let cache = open_cache(&dir).await;
		let hash = ContentHash::of_bytes(b"tex");
		let path = write(&cache.storage_path(&hash, "tex"), b"tex");

		assert_eq!(cache.ingest(&path).await.unwrap().hash, hash);

		std::fs::remove_file(&path).unwrap();
		assert_eq!(cache.lookup(&hash).await, None);
		assert_eq!(cache.stats().await.records, 0);

		write(&path, b"tex");
		assert_eq!(cache.ingest(&path).await.unwrap().hash, hash);
		assert_eq!(cache.lookup(&hash).await, Some(path));
	}

	#[tokio::test]
	#[traced_test]
	async fn modified_content_moves_to_new_hash() {
		let dir = tempdir().unwrap();
		let cache = open_cache(&dir).await;
		let path = write(&cache.roots.source_root.join("mat.mtrl"), b"before");
		let old = cache.ingest(&path).await.unwrap().hash;

		write(&path, b"after");
		File::options()
			.write(true)
			.open(&path)
			.unwrap()
			.set_modified(SystemTime::now() + std::time::Duration::from_secs(5))
			.unwrap();

		assert_eq!(cache.lookup(&old).await, None);
		assert_eq!(
			cache.lookup(&ContentHash::of_bytes(b"after")).await,
			Some(path)
		);
	}

	#[tokio::test]
	#[traced_test]
	async fn cache_storage_is_preferred_over_source() {
		let dir = tempdir().unwrap();
		let cache = open_cache(&dir).await;
		let hash = ContentHash::of_bytes(b"shared");

		let source = write(&cache.roots.source_root.join("a.tex"), b"shared");
		let stored = write(&cache.storage_path(&hash, ".TEX"), b"shared");
		cache.ingest(&source).await.unwrap();
		cache.ingest(&stored).await.unwrap();

		assert_eq!(cache.lookup(&hash).await, Some(stored.clone()));
		assert!(stored.ends_with(format!("{hash}.tex")));

		let missing = ContentHash::of_bytes(b"missing");
		let found = cache.lookup_many([&hash, &missing]).await;
		assert_eq!(found, HashMap::from([(hash, stored)]));
	}

	#[tokio::test]
	#[traced_test]
	async fn files_outside_roots_and_misnamed_downloads_are_rejected() {
		let dir = tempdir().unwrap();
		let cache = open_cache(&dir).await;

		let outside = write(&dir.path().join("elsewhere.tex"), b"x");
		assert_eq!(cache.ingest(&outside).await, None);

		let claimed = ContentHash::of_bytes(b"expected");
		let corrupt = write(&cache.storage_path(&claimed, "tex"), b"truncated");
		assert_eq!(cache.ingest(&corrupt).await, None);
		assert!(!corrupt.exists());
		assert!(logs_contain("HashMismatch"));
	}

	#[tokio::test]
	#[traced_test]
	async fn legacy_keys_migrate_on_lookup() {
		let dir = tempdir().unwrap();
		let cache = open_cache(&dir).await;

		let hash = ContentHash::of_bytes(b"legacy");
		let path = write(&cache.storage_path(&hash, "tex"), b"legacy");
		let mtime = system_time_to_ticks(std::fs::metadata(&path).unwrap().modified().unwrap());

		let legacy_key = format!("/old/install/cache/{hash}.tex");
		cache.insert_raw(&legacy_key, &hash, mtime).await;

		let gone = ContentHash::of_bytes(b"gone");
		cache.insert_raw("chara/never.tex", &gone, 1).await;

		assert_eq!(cache.lookup(&hash).await, Some(path));
		assert_eq!(cache.lookup(&gone).await, None);

		let keys = cache
			.store()
			.load()
			.unwrap()
			.into_iter()
			.map(|(key, _)| key)
			.collect::<Vec<_>>();
		assert_eq!(keys, vec![format!("{{cache}}/{hash}.tex")]);
	}
}

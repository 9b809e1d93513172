//! Node configuration, stored as versioned JSON in the data directory

use std::{
	collections::HashSet,
	path::{Path, PathBuf},
	time::Duration,
};

use anyhow::{anyhow, Result};
use lg_config::{load_json, save_json, Migrate};
use lg_core_peer_sync::PeerSyncConfig;
use lg_core_snapshot_aggregator::AggregatorConfig;
use lg_core_state_tracker::TrackerConfig;
use lg_file_cache::ContentCacheConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CONFIG_FILE_NAME: &str = "looking-glass.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
	/// Config schema version
	pub version: u32,

	pub data_dir: PathBuf,

	/// Fallback log filter when `RUST_LOG` isn't set
	pub log_level: String,

	pub cache: CacheConfig,

	#[serde(default)]
	pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
	/// Tree the local composition reads its files from
	pub source_root: PathBuf,

	/// Where downloaded files are stored, named by content hash
	pub cache_dir: PathBuf,

	pub max_cache_size_bytes: u64,

	pub reconcile_interval_secs: u64,

	/// Only these extensions are picked up when discovering new files; everything when unset
	#[serde(default)]
	pub allowed_extensions: Option<HashSet<String>>,
}

impl CacheConfig {
	fn default_in(data_dir: &Path) -> Self {
		Self {
			source_root: data_dir.join("source"),
			cache_dir: data_dir.join("cache"),
			max_cache_size_bytes: 20 * 1024 * 1024 * 1024, // 20 GiB
			reconcile_interval_secs: 30 * 60,
			allowed_extensions: None,
		}
	}

	#[must_use]
	pub fn content_cache(&self) -> ContentCacheConfig {
		let mut config = ContentCacheConfig::new(&self.source_root, &self.cache_dir);
		config.allowed_extensions = self.allowed_extensions.clone();
		config
	}

	#[must_use]
	pub const fn reconcile_interval(&self) -> Duration {
		Duration::from_secs(self.reconcile_interval_secs)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
	pub debounce_ms: u64,
	pub pet_clear_delay_ms: u64,
	pub draw_wait_timeout_secs: u64,
	pub max_download_attempts: u32,
	pub download_retry_delay_ms: u64,
	pub max_concurrent_applies: usize,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			debounce_ms: 1000,
			pet_clear_delay_ms: 500,
			draw_wait_timeout_secs: 30,
			max_download_attempts: 10,
			download_retry_delay_ms: 2000,
			max_concurrent_applies: 2,
		}
	}
}

impl SyncConfig {
	#[must_use]
	pub fn aggregator(&self) -> AggregatorConfig {
		AggregatorConfig {
			debounce: Duration::from_millis(self.debounce_ms),
			draw_wait_timeout: Duration::from_secs(self.draw_wait_timeout_secs),
			..Default::default()
		}
	}

	#[must_use]
	pub const fn tracker(&self) -> TrackerConfig {
		TrackerConfig {
			transient_clear_delay: Duration::from_millis(self.pet_clear_delay_ms),
		}
	}

	#[must_use]
	pub fn peer_sync(&self) -> PeerSyncConfig {
		PeerSyncConfig {
			max_download_attempts: self.max_download_attempts,
			download_retry_delay: Duration::from_millis(self.download_retry_delay_ms),
			draw_wait_timeout: Duration::from_secs(self.draw_wait_timeout_secs),
			..Default::default()
		}
	}
}

impl AppConfig {
	/// Loads the config from `data_dir`, writing a default one when there is none yet
	pub fn load_or_create(data_dir: &Path) -> Result<Self> {
		let path = data_dir.join(CONFIG_FILE_NAME);

		if let Some(config) = load_json::<Self>(&path)? {
			return Ok(config);
		}

		warn!("No config found, creating default at {}", path.display());
		let config = Self::default_with_dir(data_dir.to_path_buf());
		config.save()?;
		Ok(config)
	}

	#[must_use]
	pub fn default_with_dir(data_dir: PathBuf) -> Self {
		Self {
			version: Self::target_version(),
			log_level: "info".to_string(),
			cache: CacheConfig::default_in(&data_dir),
			sync: SyncConfig::default(),
			data_dir,
		}
	}

	pub fn save(&self) -> Result<()> {
		save_json(&self.data_dir.join(CONFIG_FILE_NAME), self)
	}

	#[must_use]
	pub fn logs_dir(&self) -> PathBuf {
		self.data_dir.join("logs")
	}
}

impl Migrate for AppConfig {
	fn current_version(&self) -> u32 {
		self.version
	}

	fn target_version() -> u32 {
		2
	}

	fn migrate(&mut self) -> Result<()> {
		match self.version {
			1 => {
				// v2 moved sync tuning out of hardcoded defaults
				self.sync = SyncConfig::default();
				self.version = 2;
				Ok(())
			}
			2 => Ok(()),
			v => Err(anyhow!("Unknown config version: {v}")),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use pretty_assertions::assert_eq;
	use tempfile::tempdir;

	#[test]
	fn default_config_is_created_then_reloaded() {
		let dir = tempdir().unwrap();

		let created = AppConfig::load_or_create(dir.path()).unwrap();
		assert!(dir.path().join(CONFIG_FILE_NAME).exists());
		assert_eq!(created.cache.cache_dir, dir.path().join("cache"));
		assert_eq!(created.cache.max_cache_size_bytes, 21_474_836_480);

		let mut changed = created;
		changed.sync.debounce_ms = 250;
		changed.save().unwrap();

		let reloaded = AppConfig::load_or_create(dir.path()).unwrap();
		assert_eq!(reloaded, changed);
		assert_eq!(reloaded.sync.aggregator().debounce, Duration::from_millis(250));
	}

	#[test]
	fn v1_documents_gain_sync_section() {
		let dir = tempdir().unwrap();
		let path = dir.path().join(CONFIG_FILE_NAME);
		let v1 = serde_json::json!({
			"version": 1,
			"data_dir": dir.path(),
			"log_level": "debug",
			"cache": {
				"source_root": dir.path().join("mods"),
				"cache_dir": dir.path().join("files"),
				"max_cache_size_bytes": 1024,
				"reconcile_interval_secs": 60,
			},
		});
		std::fs::write(&path, v1.to_string()).unwrap();

		let config = AppConfig::load_or_create(dir.path()).unwrap();
		assert_eq!(config.version, 2);
		assert_eq!(config.log_level, "debug");
		assert_eq!(config.sync, SyncConfig::default());
		assert_eq!(config.cache.allowed_extensions, None);
		assert_eq!(config.cache.reconcile_interval(), Duration::from_secs(60));

		let on_disk: AppConfig =
			serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
		assert_eq!(on_disk.version, 2);
	}
}

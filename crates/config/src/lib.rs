use anyhow::{anyhow, Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Platform-specific data directory resolution
pub fn default_data_dir() -> Result<PathBuf> {
	#[cfg(target_os = "macos")]
	let dir = dirs::data_dir()
		.ok_or_else(|| anyhow!("Could not determine data directory"))?
		.join("looking-glass");

	#[cfg(target_os = "windows")]
	let dir = dirs::data_dir()
		.ok_or_else(|| anyhow!("Could not determine data directory"))?
		.join("LookingGlass");

	#[cfg(not(any(target_os = "macos", target_os = "windows")))]
	let dir = dirs::data_local_dir()
		.ok_or_else(|| anyhow!("Could not determine data directory"))?
		.join("looking-glass");

	// Create directory if it doesn't exist
	fs::create_dir_all(&dir)?;

	Ok(dir)
}

/// Versioned configuration documents that know how to upgrade themselves
pub trait Migrate: Sized {
	fn current_version(&self) -> u32;

	fn target_version() -> u32;

	/// Upgrade in place until `current_version() == target_version()`
	fn migrate(&mut self) -> Result<()>;
}

/// Loads a JSON config document, migrating and re-saving it when it is older than the
/// current schema. Returns `None` when the file doesn't exist yet.
pub fn load_json<T>(path: &Path) -> Result<Option<T>>
where
	T: Migrate + Serialize + DeserializeOwned,
{
	if !path.exists() {
		return Ok(None);
	}

	info!("Loading config from {}", path.display());
	let json = fs::read_to_string(path)
		.with_context(|| format!("reading config file {}", path.display()))?;
	let mut config: T = serde_json::from_str(&json)
		.with_context(|| format!("parsing config file {}", path.display()))?;

	if config.current_version() < T::target_version() {
		info!(
			"Migrating config from v{} to v{}",
			config.current_version(),
			T::target_version()
		);
		config.migrate()?;
		save_json(path, &config)?;
	} else if config.current_version() > T::target_version() {
		warn!(
			"Config at {} has version v{} which is newer than v{}, loading it as is",
			path.display(),
			config.current_version(),
			T::target_version()
		);
	}

	Ok(Some(config))
}

pub fn save_json<T: Serialize>(path: &Path, config: &T) -> Result<()> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent)?;
	}

	let json = serde_json::to_string_pretty(config)?;
	fs::write(path, json).with_context(|| format!("writing config file {}", path.display()))?;
	info!("Saved config to {}", path.display());
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	use serde::Deserialize;
	use tempfile::tempdir;

	#[derive(Debug, Serialize, Deserialize, PartialEq)]
	struct Sample {
		version: u32,
		#[serde(default)]
		retries: u32,
	}

	impl Migrate for Sample {
		fn current_version(&self) -> u32 {
			self.version
		}

		fn target_version() -> u32 {
			2
		}

		fn migrate(&mut self) -> Result<()> {
			match self.version {
				1 => {
					self.retries = 10;
					self.version = 2;
					Ok(())
				}
				2 => Ok(()),
				v => Err(anyhow!("Unknown config version: {v}")),
			}
		}
	}

	#[test]
	fn missing_file_is_none() {
		let dir = tempdir().unwrap();
		let loaded = load_json::<Sample>(&dir.path().join("nope.json")).unwrap();
		assert!(loaded.is_none());
	}

	#[test]
	fn old_documents_are_migrated_and_saved() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("sample.json");
		fs::write(&path, r#"{ "version": 1 }"#).unwrap();

		let loaded = load_json::<Sample>(&path).unwrap().unwrap();
		assert_eq!(
			loaded,
			Sample {
				version: 2,
				retries: 10
			}
		);

		let on_disk: Sample = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
		assert_eq!(on_disk, loaded);
	}
}

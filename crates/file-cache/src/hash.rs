use std::{fmt, fs::File, path::Path, str::FromStr};

use lg_utils::error::FileIOError;
use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;

use crate::Error;

/// Length of a hex encoded BLAKE3-256 digest
pub const CONTENT_HASH_LEN: usize = 64;

/// Lowercase hex BLAKE3 digest of a file's full contents
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
	#[must_use]
	pub fn of_bytes(bytes: &[u8]) -> Self {
		Self(blake3::hash(bytes).to_hex().to_string())
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Whether `name` has the shape of a hash, which is how files in cache storage are named
	#[must_use]
	pub fn looks_like_hash(name: &str) -> bool {
		name.len() == CONTENT_HASH_LEN && name.bytes().all(|b| b.is_ascii_hexdigit())
	}
}

impl FromStr for ContentHash {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if Self::looks_like_hash(s) {
			Ok(Self(s.to_ascii_lowercase()))
		} else {
			Err(Error::InvalidHash(s.to_string()))
		}
	}
}

impl TryFrom<String> for ContentHash {
	type Error = Error;

	fn try_from(s: String) -> Result<Self, Self::Error> {
		s.parse()
	}
}

impl From<ContentHash> for String {
	fn from(hash: ContentHash) -> Self {
		hash.0
	}
}

impl fmt::Display for ContentHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Hashes the whole file on the blocking pool
pub async fn hash_file(path: impl AsRef<Path>) -> Result<ContentHash, Error> {
	let path = path.as_ref().to_path_buf();

	spawn_blocking(move || {
		let file =
			File::open(&path).map_err(|e| FileIOError::from((&path, e, "opening file to hash")))?;

		let mut hasher = blake3::Hasher::new();
		hasher
			.update_reader(file)
			.map_err(|e| FileIOError::from((&path, e, "reading file to hash")))?;

		Ok::<_, Error>(ContentHash(hasher.finalize().to_hex().to_string()))
	})
	.await?
}

#[cfg(test)]
mod tests {
	use super::*;

	use tempfile::tempdir;

	#[test]
	fn parsing_validates_shape() {
		assert!("abc".parse::<ContentHash>().is_err());
		assert!("g".repeat(64).parse::<ContentHash>().is_err());

		let upper = "AB".repeat(32).parse::<ContentHash>().unwrap();
		assert_eq!(upper.as_str(), "ab".repeat(32));
	}

	#[tokio::test]
	async fn file_hash_matches_byte_hash() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("body.tex");
		std::fs::write(&path, b"texture bytes").unwrap();

		assert_eq!(
			hash_file(&path).await.unwrap(),
			ContentHash::of_bytes(b"texture bytes")
		);
	}

	#[tokio::test]
	async fn hashing_a_missing_file_reports_the_path() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("gone.tex");

		match hash_file(&path).await {
			Err(Error::FileIO(e)) => {
				assert!(e.is_not_found());
				assert_eq!(&*e.path, path.as_path());
			}
			other => panic!("unexpected result: {other:?}"),
		}
	}
}

//! Records never store absolute paths. A stored key is either `{source}/<relative>` for files
//! inside the composition source tree or `{cache}/<relative>` for files in cache storage, so the
//! index survives either root moving. Keys without a prefix come from older databases and are
//! migrated on first access.

use std::{
	fmt,
	path::{Component, Path, PathBuf},
};

use crate::ContentHash;

const SOURCE_PREFIX: &str = "{source}";
const CACHE_PREFIX: &str = "{cache}";

#[derive(Debug, Clone)]
pub struct CacheRoots {
	pub source_root: PathBuf,
	pub cache_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
	Source,
	Cache,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredPath {
	Namespaced { namespace: Namespace, relative: String },
	/// Absolute or root-less path written before namespaces existed
	Legacy(String),
}

impl StoredPath {
	#[must_use]
	pub fn parse(key: &str) -> Self {
		let namespaced = |namespace, rest: &str| {
			rest.strip_prefix('/').and_then(|relative| {
				is_safe_relative(relative).then(|| Self::Namespaced {
					namespace,
					relative: relative.to_string(),
				})
			})
		};

		key.strip_prefix(SOURCE_PREFIX)
			.and_then(|rest| namespaced(Namespace::Source, rest))
			.or_else(|| {
				key.strip_prefix(CACHE_PREFIX)
					.and_then(|rest| namespaced(Namespace::Cache, rest))
			})
			.unwrap_or_else(|| Self::Legacy(key.to_string()))
	}

	#[must_use]
	pub const fn is_cache(&self) -> bool {
		matches!(
			self,
			Self::Namespaced {
				namespace: Namespace::Cache,
				..
			}
		)
	}

	#[must_use]
	pub const fn is_legacy(&self) -> bool {
		matches!(self, Self::Legacy(_))
	}

	/// Absolute location on disk, `None` for legacy keys that still need migrating
	#[must_use]
	pub fn resolve(&self, roots: &CacheRoots) -> Option<PathBuf> {
		match self {
			Self::Namespaced {
				namespace,
				relative,
			} => {
				let root = match namespace {
					Namespace::Source => &roots.source_root,
					Namespace::Cache => &roots.cache_dir,
				};
				Some(relative.split('/').fold(root.clone(), |acc, part| acc.join(part)))
			}
			Self::Legacy(_) => None,
		}
	}

	/// Heuristic migration of a legacy key.
	///
	/// A file whose stem is a content hash was written by the cache itself; anything else is
	/// probed against both roots, first as an absolute path and then as a path relative to the
	/// source tree. `None` means the record can't be placed and must be dropped.
	#[must_use]
	pub fn migrate_legacy(legacy: &str, roots: &CacheRoots) -> Option<Self> {
		let path = Path::new(legacy);

		let hash_named = path
			.file_stem()
			.and_then(|stem| stem.to_str())
			.is_some_and(ContentHash::looks_like_hash);

		if hash_named {
			let file_name = path.file_name()?.to_str()?;
			return Some(Self::Namespaced {
				namespace: Namespace::Cache,
				relative: file_name.to_string(),
			});
		}

		if path.is_absolute() {
			return roots.classify(path);
		}

		let relative = legacy.replace('\\', "/");
		let candidate = Self::Namespaced {
			namespace: Namespace::Source,
			relative: relative.trim_start_matches('/').to_string(),
		};

		candidate
			.resolve(roots)
			.filter(|_| is_safe_relative(relative.trim_start_matches('/')))
			.is_some_and(|resolved| resolved.exists())
			.then_some(candidate)
	}
}

impl fmt::Display for StoredPath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Namespaced {
				namespace: Namespace::Source,
				relative,
			} => write!(f, "{SOURCE_PREFIX}/{relative}"),
			Self::Namespaced {
				namespace: Namespace::Cache,
				relative,
			} => write!(f, "{CACHE_PREFIX}/{relative}"),
			Self::Legacy(legacy) => f.write_str(legacy),
		}
	}
}

impl CacheRoots {
	/// Stored form of an absolute path, or `None` when it lies outside both roots.
	///
	/// Cache storage is checked first since it may be nested inside the source tree.
	#[must_use]
	pub fn classify(&self, path: &Path) -> Option<StoredPath> {
		[
			(Namespace::Cache, &self.cache_dir),
			(Namespace::Source, &self.source_root),
		]
		.into_iter()
		.find_map(|(namespace, root)| {
			let relative = path.strip_prefix(root).ok()?;
			let relative = relative
				.components()
				.map(|component| match component {
					Component::Normal(part) => part.to_str(),
					_ => None,
				})
				.collect::<Option<Vec<_>>>()?
				.join("/");

			(!relative.is_empty()).then_some(StoredPath::Namespaced {
				namespace,
				relative,
			})
		})
	}
}

fn is_safe_relative(relative: &str) -> bool {
	!relative.is_empty()
		&& relative
			.split('/')
			.all(|part| !part.is_empty() && part != "." && part != "..")
}

#[cfg(test)]
mod tests {
	use super::*;

	use pretty_assertions::assert_eq;
	use tempfile::tempdir;

	fn roots(base: &Path) -> CacheRoots {
		CacheRoots {
			source_root: base.join("source"),
			cache_dir: base.join("source").join("cache"),
		}
	}

	#[test]
	fn keys_round_trip_through_display() {
		for key in ["{source}/chara/a.tex", "{cache}/abc.tex", "/old/absolute.tex"] {
			assert_eq!(StoredPath::parse(key).to_string(), key);
		}

		assert!(StoredPath::parse("{cache}/../escape.tex").is_legacy());
		assert!(StoredPath::parse("{source}").is_legacy());
	}

	#[test]
	fn nested_cache_dir_wins_classification() {
		let roots = roots(Path::new("/data"));

		assert_eq!(
			roots.classify(Path::new("/data/source/cache/ab.tex")),
			Some(StoredPath::parse("{cache}/ab.tex"))
		);
		assert_eq!(
			roots.classify(Path::new("/data/source/chara/body.mdl")),
			Some(StoredPath::parse("{source}/chara/body.mdl"))
		);
		assert_eq!(roots.classify(Path::new("/elsewhere/body.mdl")), None);
	}

	#[test]
	fn legacy_keys_migrate_by_shape_then_by_probe() {
		let dir = tempdir().unwrap();
		let roots = roots(dir.path());
		std::fs::create_dir_all(roots.source_root.join("chara")).unwrap();
		std::fs::write(roots.source_root.join("chara").join("body.mdl"), b"m").unwrap();

		let hash_named = format!("C:\\old\\install\\{}.tex", "f".repeat(64));
		assert_eq!(
			StoredPath::migrate_legacy(&hash_named.replace('\\', "/"), &roots),
			Some(StoredPath::parse(&format!("{{cache}}/{}.tex", "f".repeat(64))))
		);

		assert_eq!(
			StoredPath::migrate_legacy("chara/body.mdl", &roots),
			Some(StoredPath::parse("{source}/chara/body.mdl"))
		);
		assert_eq!(StoredPath::migrate_legacy("chara/missing.mdl", &roots), None);
		assert_eq!(StoredPath::migrate_legacy("/nowhere/known.mdl", &roots), None);
	}
}

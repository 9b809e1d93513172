use std::{
	collections::{BTreeMap, BTreeSet},
	path::PathBuf,
};

use lg_appearance::{AppearanceSnapshot, ContentHash, EntityKind, ReplacementSource};
use lg_file_cache::ContentCache;

/// Where every game path of one entity kind gets its content from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPaths {
	/// Game path to the local file holding its content
	pub files: BTreeMap<String, PathBuf>,
	/// Game path to the game path it's redirected to
	pub swaps: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub(crate) struct Resolution {
	pub paths: BTreeMap<EntityKind, ResolvedPaths>,
	pub missing: BTreeSet<ContentHash>,
}

/// Looks up every hash the snapshot references; slots whose content isn't available locally
/// are left out and their hash reported as missing
pub(crate) async fn resolve(cache: &ContentCache, snapshot: &AppearanceSnapshot) -> Resolution {
	let referenced = snapshot.referenced_hashes();
	let found = cache.lookup_many(&referenced).await;

	let mut resolution = Resolution::default();

	for (kind, fragment) in snapshot.fragments() {
		let paths = resolution.paths.entry(kind).or_default();

		for replacement in &fragment.file_replacements {
			match &replacement.source {
				ReplacementSource::Hash(hash) => match found.get(hash) {
					Some(path) => paths.files.extend(
						replacement
							.game_paths
							.iter()
							.map(|game_path| (game_path.clone(), path.clone())),
					),
					None => {
						resolution.missing.insert(hash.clone());
					}
				},
				ReplacementSource::Swap(target) => paths.swaps.extend(
					replacement
						.game_paths
						.iter()
						.map(|game_path| (game_path.clone(), target.clone())),
				),
			}
		}
	}

	resolution
}

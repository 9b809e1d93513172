use std::{
	collections::{BTreeMap, BTreeSet},
	fmt,
};

use lg_file_cache::ContentHash;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::EntityKind;

#[derive(Error, Debug)]
pub enum SnapshotError {
	#[error("failed to encode appearance snapshot for hashing: {0}")]
	Encode(#[from] rmp_serde::encode::Error),
}

/// Where the bytes for a group of game paths come from
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReplacementSource {
	/// Content stored in the file cache, resolved by hash
	Hash(ContentHash),
	/// Another game path that is redirected to, bypassing the cache entirely
	Swap(String),
}

/// One content source filling one or more logical game path slots
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileReplacement {
	pub game_paths: BTreeSet<String>,
	pub source: ReplacementSource,
}

impl FileReplacement {
	pub fn new(
		game_paths: impl IntoIterator<Item = impl Into<String>>,
		source: ReplacementSource,
	) -> Self {
		Self {
			game_paths: game_paths.into_iter().map(Into::into).collect(),
			source,
		}
	}

	#[must_use]
	pub const fn hash(&self) -> Option<&ContentHash> {
		match &self.source {
			ReplacementSource::Hash(hash) => Some(hash),
			ReplacementSource::Swap(_) => None,
		}
	}
}

/// Cosmetic facets carried as opaque strings and applied by optional host plugins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddonKind {
	BodyScale,
	Title,
	Moods,
	PetNames,
}

impl fmt::Display for AddonKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::BodyScale => write!(f, "body_scale"),
			Self::Title => write!(f, "title"),
			Self::Moods => write!(f, "moods"),
			Self::PetNames => write!(f, "pet_names"),
		}
	}
}

/// Height/position offset applied on top of the model
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScaleOffset {
	pub x: f32,
	pub y: f32,
	pub z: f32,
	pub rotation: f32,
}

/// Everything needed to reproduce one entity's appearance
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AppearanceFragment {
	pub file_replacements: Vec<FileReplacement>,
	/// Opaque mod manipulation blob
	pub manipulation_data: String,
	/// Opaque pose/customization string
	pub customization: String,
	pub scale_offset: Option<ScaleOffset>,
	pub addons: BTreeMap<AddonKind, String>,
}

impl AppearanceFragment {
	/// Hashes of every cache-backed file this fragment references, deduplicated
	pub fn referenced_hashes(&self) -> impl Iterator<Item = &ContentHash> {
		self.file_replacements
			.iter()
			.filter_map(FileReplacement::hash)
			.collect::<BTreeSet<_>>()
			.into_iter()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.file_replacements.is_empty()
			&& self.manipulation_data.is_empty()
			&& self.customization.is_empty()
			&& self.scale_offset.is_none()
			&& self.addons.is_empty()
	}
}

/// Hex encoded BLAKE3 digest of a snapshot's serialized form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataHash(String);

impl DataHash {
	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for DataHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Immutable, per-entity-kind appearance state identified by its [`DataHash`].
///
/// Snapshots are shared behind an `Arc` between the aggregator that produced them and every
/// peer engine applying them, so all "mutations" build a new snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct AppearanceSnapshot {
	fragments: BTreeMap<EntityKind, AppearanceFragment>,
	data_hash: DataHash,
}

impl AppearanceSnapshot {
	pub fn new(fragments: BTreeMap<EntityKind, AppearanceFragment>) -> Result<Self, SnapshotError> {
		let mut hasher = blake3::Hasher::new();
		// `BTreeMap`s everywhere keep the encoding, and thus the hash, deterministic
		rmp_serde::encode::write(&mut hasher, &fragments)?;

		Ok(Self {
			data_hash: DataHash(hasher.finalize().to_hex().to_string()),
			fragments,
		})
	}

	pub fn empty() -> Result<Self, SnapshotError> {
		Self::new(BTreeMap::new())
	}

	#[must_use]
	pub const fn data_hash(&self) -> &DataHash {
		&self.data_hash
	}

	#[must_use]
	pub fn fragment(&self, kind: EntityKind) -> Option<&AppearanceFragment> {
		self.fragments.get(&kind)
	}

	/// Fragments in application order
	pub fn fragments(&self) -> impl Iterator<Item = (EntityKind, &AppearanceFragment)> {
		self.fragments.iter().map(|(kind, fragment)| (*kind, fragment))
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.fragments.is_empty()
	}

	/// A new snapshot where `kind`'s fragment fully replaces the previous one
	pub fn with_fragment(
		&self,
		kind: EntityKind,
		fragment: AppearanceFragment,
	) -> Result<Self, SnapshotError> {
		let mut fragments = self.fragments.clone();
		fragments.insert(kind, fragment);
		Self::new(fragments)
	}

	pub fn without_kind(&self, kind: EntityKind) -> Result<Self, SnapshotError> {
		let mut fragments = self.fragments.clone();
		fragments.remove(&kind);
		Self::new(fragments)
	}

	/// Every cache-backed hash referenced by any fragment, deduplicated
	#[must_use]
	pub fn referenced_hashes(&self) -> BTreeSet<ContentHash> {
		self.fragments
			.values()
			.flat_map(AppearanceFragment::referenced_hashes)
			.cloned()
			.collect()
	}
}

impl Serialize for AppearanceSnapshot {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		self.fragments.serialize(serializer)
	}
}

impl<'de> Deserialize<'de> for AppearanceSnapshot {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let fragments = BTreeMap::<EntityKind, AppearanceFragment>::deserialize(deserializer)?;
		Self::new(fragments).map_err(D::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use pretty_assertions::assert_eq;

	fn hash(byte: char) -> ContentHash {
		byte.to_string().repeat(64).parse().unwrap()
	}

	fn fragment() -> AppearanceFragment {
		AppearanceFragment {
			file_replacements: vec![
				FileReplacement::new(["chara/a.tex", "chara/b.tex"], ReplacementSource::Hash(hash('a'))),
				FileReplacement::new(["chara/c.mdl"], ReplacementSource::Swap("chara/d.mdl".into())),
				FileReplacement::new(["chara/e.tex"], ReplacementSource::Hash(hash('a'))),
			],
			manipulation_data: "manip".into(),
			customization: "pose".into(),
			scale_offset: Some(ScaleOffset {
				y: 0.2,
				..Default::default()
			}),
			addons: BTreeMap::from([(AddonKind::Title, "Hero".to_string())]),
		}
	}

	#[test]
	fn data_hash_is_content_derived() {
		let a = AppearanceSnapshot::new(BTreeMap::from([(EntityKind::Player, fragment())])).unwrap();
		let b = AppearanceSnapshot::empty()
			.unwrap()
			.with_fragment(EntityKind::Player, fragment())
			.unwrap();
		assert_eq!(a.data_hash(), b.data_hash());

		let c = b.with_fragment(EntityKind::Pet, AppearanceFragment::default()).unwrap();
		assert_ne!(b.data_hash(), c.data_hash());
		assert_eq!(c.without_kind(EntityKind::Pet).unwrap().data_hash(), a.data_hash());
	}

	#[test]
	fn referenced_hashes_skip_swaps_and_dedupe() {
		let snapshot =
			AppearanceSnapshot::new(BTreeMap::from([(EntityKind::Player, fragment())])).unwrap();
		assert_eq!(snapshot.referenced_hashes(), BTreeSet::from([hash('a')]));
	}

	#[test]
	fn deserializing_recomputes_data_hash() {
		let snapshot =
			AppearanceSnapshot::new(BTreeMap::from([(EntityKind::Player, fragment())])).unwrap();
		let bytes = rmp_serde::to_vec(&snapshot).unwrap();
		let decoded: AppearanceSnapshot = rmp_serde::from_slice(&bytes).unwrap();

		assert_eq!(decoded, snapshot);
	}
}

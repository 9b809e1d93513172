use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{AddonKind, AppearanceFragment, AppearanceSnapshot, EntityKind};

/// A facet that has to be (re)applied or reverted on a peer's entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PeerChange {
	ModFiles,
	ModManipulation,
	Customization,
	ScaleOffset,
	Addon(AddonKind),
	ForcedRedraw,
}

pub type PeerChanges = BTreeMap<EntityKind, BTreeSet<PeerChange>>;

/// Computes, per entity kind, which facets differ between the last applied snapshot and a
/// new one.
///
/// With `forced` every facet present in the new snapshot is reported, plus a redraw. Kinds
/// that disappeared report the facets they used to have, so they can be reverted.
#[must_use]
pub fn diff(
	old: Option<&AppearanceSnapshot>,
	new: &AppearanceSnapshot,
	forced: bool,
) -> PeerChanges {
	let mut changes = PeerChanges::new();

	for kind in EntityKind::ALL {
		let old_fragment = old.and_then(|old| old.fragment(kind));
		let new_fragment = new.fragment(kind);

		let kind_changes = match (old_fragment, new_fragment) {
			(None, None) => continue,
			(_, Some(new_fragment)) if forced => everything_in(new_fragment, true),
			(None, Some(new_fragment)) => everything_in(new_fragment, false),
			(Some(old_fragment), None) => everything_in(old_fragment, false),
			(Some(old_fragment), Some(new_fragment)) => between(old_fragment, new_fragment),
		};

		if !kind_changes.is_empty() {
			changes.insert(kind, kind_changes);
		}
	}

	changes
}

fn everything_in(fragment: &AppearanceFragment, forced: bool) -> BTreeSet<PeerChange> {
	let mut changes = BTreeSet::new();

	if forced || !fragment.file_replacements.is_empty() {
		changes.extend([PeerChange::ModFiles, PeerChange::ForcedRedraw]);
	}

	if forced || !fragment.manipulation_data.is_empty() {
		changes.extend([PeerChange::ModManipulation, PeerChange::ForcedRedraw]);
	}

	if !fragment.customization.is_empty() {
		changes.insert(PeerChange::Customization);
	}

	if fragment.scale_offset.is_some() {
		changes.insert(PeerChange::ScaleOffset);
	}

	changes.extend(fragment.addons.keys().copied().map(PeerChange::Addon));

	changes
}

fn between(old: &AppearanceFragment, new: &AppearanceFragment) -> BTreeSet<PeerChange> {
	let mut changes = BTreeSet::new();

	// Order inside a fragment carries no meaning, only the set of replacements does
	let old_files = old.file_replacements.iter().collect::<BTreeSet<_>>();
	let new_files = new.file_replacements.iter().collect::<BTreeSet<_>>();
	if old_files != new_files {
		changes.extend([PeerChange::ModFiles, PeerChange::ForcedRedraw]);
	}

	if old.manipulation_data != new.manipulation_data {
		changes.extend([PeerChange::ModManipulation, PeerChange::ForcedRedraw]);
	}

	if old.customization != new.customization {
		changes.insert(PeerChange::Customization);
	}

	if old.scale_offset != new.scale_offset {
		changes.insert(PeerChange::ScaleOffset);
	}

	for addon in old.addons.keys().chain(new.addons.keys()) {
		if old.addons.get(addon) != new.addons.get(addon) {
			changes.insert(PeerChange::Addon(*addon));
		}
	}

	changes
}

#[cfg(test)]
mod tests {
	use super::*;

	use crate::{FileReplacement, ReplacementSource, ScaleOffset};

	use pretty_assertions::assert_eq;

	fn snapshot(fragments: impl IntoIterator<Item = (EntityKind, AppearanceFragment)>) -> AppearanceSnapshot {
		AppearanceSnapshot::new(fragments.into_iter().collect()).unwrap()
	}

	fn files(paths: &[&str]) -> Vec<FileReplacement> {
		paths
			.iter()
			.map(|path| {
				FileReplacement::new([*path], ReplacementSource::Hash("b".repeat(64).parse().unwrap()))
			})
			.collect()
	}

	#[test]
	fn identical_snapshots_have_no_changes() {
		let fragment = AppearanceFragment {
			file_replacements: files(&["a", "b"]),
			customization: "pose".into(),
			..Default::default()
		};
		let old = snapshot([(EntityKind::Player, fragment.clone())]);

		let mut reordered = fragment;
		reordered.file_replacements.reverse();
		let new = snapshot([(EntityKind::Player, reordered)]);

		assert!(diff(Some(&old), &new, false).is_empty());
	}

	#[test]
	fn only_changed_facets_are_reported() {
		let old = snapshot([(
			EntityKind::Player,
			AppearanceFragment {
				file_replacements: files(&["a"]),
				customization: "pose".into(),
				addons: BTreeMap::from([(AddonKind::Title, "Hero".to_string())]),
				..Default::default()
			},
		)]);
		let new = snapshot([(
			EntityKind::Player,
			AppearanceFragment {
				file_replacements: files(&["a"]),
				customization: "other pose".into(),
				scale_offset: Some(ScaleOffset::default()),
				..Default::default()
			},
		)]);

		assert_eq!(
			diff(Some(&old), &new, false),
			PeerChanges::from([(
				EntityKind::Player,
				BTreeSet::from([
					PeerChange::Customization,
					PeerChange::ScaleOffset,
					PeerChange::Addon(AddonKind::Title),
				])
			)])
		);
	}

	#[test]
	fn file_changes_force_a_redraw_and_removed_kinds_revert() {
		let old = snapshot([
			(
				EntityKind::Player,
				AppearanceFragment {
					file_replacements: files(&["a"]),
					..Default::default()
				},
			),
			(
				EntityKind::Pet,
				AppearanceFragment {
					customization: "pet pose".into(),
					..Default::default()
				},
			),
		]);
		let new = snapshot([(
			EntityKind::Player,
			AppearanceFragment {
				file_replacements: files(&["a", "b"]),
				..Default::default()
			},
		)]);

		assert_eq!(
			diff(Some(&old), &new, false),
			PeerChanges::from([
				(
					EntityKind::Player,
					BTreeSet::from([PeerChange::ModFiles, PeerChange::ForcedRedraw])
				),
				(EntityKind::Pet, BTreeSet::from([PeerChange::Customization])),
			])
		);
	}

	#[test]
	fn forced_reports_mods_even_when_unchanged() {
		let fragment = AppearanceFragment {
			customization: "pose".into(),
			..Default::default()
		};
		let old = snapshot([(EntityKind::Player, fragment.clone())]);
		let new = snapshot([(EntityKind::Player, fragment)]);

		assert_eq!(
			diff(Some(&old), &new, true),
			PeerChanges::from([(
				EntityKind::Player,
				BTreeSet::from([
					PeerChange::ModFiles,
					PeerChange::ModManipulation,
					PeerChange::Customization,
					PeerChange::ForcedRedraw,
				])
			)])
		);
	}
}

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::EntityKind;

/// What the state tracker saw change on an entity during a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StateChangeReason {
	AddressChanged,
	EquipmentChanged,
	DrawObjectChanged,
	NameChanged,
	RedrawForced,
}

/// Pending change reasons per entity kind, accumulated between two aggregation rounds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet(HashMap<EntityKind, HashSet<StateChangeReason>>);

impl ChangeSet {
	pub fn insert(&mut self, kind: EntityKind, reasons: impl IntoIterator<Item = StateChangeReason>) {
		self.0.entry(kind).or_default().extend(reasons);
	}

	pub fn merge(&mut self, other: Self) {
		for (kind, reasons) in other.0 {
			self.insert(kind, reasons);
		}
	}

	/// Moves everything out, leaving this set empty
	pub fn take(&mut self) -> Self {
		Self(std::mem::take(&mut self.0))
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	#[must_use]
	pub fn contains_kind(&self, kind: EntityKind) -> bool {
		self.0.contains_key(&kind)
	}

	#[must_use]
	pub fn reasons(&self, kind: EntityKind) -> Option<&HashSet<StateChangeReason>> {
		self.0.get(&kind)
	}

	/// Kinds in application order
	#[must_use]
	pub fn kinds(&self) -> Vec<EntityKind> {
		let mut kinds = self.0.keys().copied().collect::<Vec<_>>();
		kinds.sort_unstable();
		kinds
	}
}

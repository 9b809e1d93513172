use std::sync::Arc;

use tokio::sync::watch;

/// Host conditions during which appearance must not be touched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeCondition {
	pub in_combat: bool,
	pub performing: bool,
	pub zoning: bool,
	pub in_cutscene: bool,
}

impl RuntimeCondition {
	#[must_use]
	pub const fn is_unsafe(&self) -> bool {
		self.in_combat || self.performing || self.zoning || self.in_cutscene
	}
}

/// Shared view of the host's [`RuntimeCondition`], updated by the tick loop
#[derive(Debug, Clone)]
pub struct RuntimeMonitor {
	condition_tx: Arc<watch::Sender<RuntimeCondition>>,
}

impl RuntimeMonitor {
	#[must_use]
	pub fn new() -> Self {
		Self {
			condition_tx: Arc::new(watch::channel(RuntimeCondition::default()).0),
		}
	}

	/// Publishes `condition`, waking subscribers only when it actually changed
	pub fn set(&self, condition: RuntimeCondition) {
		self.condition_tx.send_if_modified(|current| {
			let changed = *current != condition;
			*current = condition;
			changed
		});
	}

	pub fn update(&self, f: impl FnOnce(&mut RuntimeCondition)) {
		let mut condition = self.current();
		f(&mut condition);
		self.set(condition);
	}

	#[must_use]
	pub fn current(&self) -> RuntimeCondition {
		*self.condition_tx.borrow()
	}

	#[must_use]
	pub fn subscribe(&self) -> watch::Receiver<RuntimeCondition> {
		self.condition_tx.subscribe()
	}
}

impl Default for RuntimeMonitor {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn subscribers_only_wake_on_real_changes() {
		let monitor = RuntimeMonitor::new();
		let mut rx = monitor.subscribe();

		monitor.set(RuntimeCondition::default());
		assert!(!rx.has_changed().unwrap());

		monitor.update(|condition| condition.in_combat = true);
		assert!(rx.has_changed().unwrap());
		assert!(rx.borrow_and_update().is_unsafe());
	}
}

use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Process-wide bound on how many peers may mutate the render host at the same time
#[derive(Debug, Clone)]
pub struct ApplyGate {
	permits: Arc<Semaphore>,
}

impl ApplyGate {
	#[must_use]
	pub fn new(max_concurrent: usize) -> Self {
		Self {
			permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
		}
	}

	pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
		Arc::clone(&self.permits).acquire_owned().await
	}

	#[must_use]
	pub fn available(&self) -> usize {
		self.permits.available_permits()
	}
}

impl Default for ApplyGate {
	fn default() -> Self {
		Self::new(2)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn permits_are_returned_on_drop() {
		let gate = ApplyGate::default();
		let first = gate.acquire().await.unwrap();
		let _second = gate.clone().acquire().await.unwrap();
		assert_eq!(gate.available(), 0);

		drop(first);
		assert_eq!(gate.available(), 1);
	}
}

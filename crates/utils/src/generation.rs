//! Bookkeeping for operations where every new trigger supersedes the work started by the
//! previous one: each trigger advances the generation, which cancels the old token before a
//! new one is issued.

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Generation {
	id: u64,
	token: CancellationToken,
}

impl Generation {
	#[must_use]
	pub const fn id(&self) -> u64 {
		self.id
	}

	#[must_use]
	pub const fn token(&self) -> &CancellationToken {
		&self.token
	}

	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.token.is_cancelled()
	}
}

#[derive(Debug)]
pub struct GenerationSlot {
	parent: CancellationToken,
	current: Mutex<Generation>,
}

impl GenerationSlot {
	#[must_use]
	pub fn new() -> Self {
		Self::with_parent(CancellationToken::new())
	}

	/// Every issued token is a child of `parent`, so cancelling the parent stops whatever
	/// generation is running
	#[must_use]
	pub fn with_parent(parent: CancellationToken) -> Self {
		let token = parent.child_token();
		Self {
			parent,
			current: Mutex::new(Generation { id: 0, token }),
		}
	}

	/// Cancels the current generation and issues the next one
	pub fn advance(&self) -> Generation {
		let mut current = self.current.lock();
		current.token.cancel();

		*current = Generation {
			id: current.id.wrapping_add(1),
			token: self.parent.child_token(),
		};

		current.clone()
	}

	#[must_use]
	pub fn current(&self) -> Generation {
		self.current.lock().clone()
	}

	#[must_use]
	pub fn is_current(&self, generation: &Generation) -> bool {
		self.current.lock().id == generation.id
	}

	/// Cancels the running generation without issuing a new one
	pub fn cancel(&self) {
		self.current.lock().token.cancel();
	}
}

impl Default for GenerationSlot {
	fn default() -> Self {
		Self::new()
	}
}

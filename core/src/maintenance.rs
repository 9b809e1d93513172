use std::{sync::Arc, time::Duration};

use futures_concurrency::future::Race;
use lg_file_cache::ContentCache;
use tokio::{
	spawn,
	task::JoinHandle,
	time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Periodically reconciles the cache against the disk and then trims it to `max_bytes`.
///
/// The first pass runs right away. A reconcile that gets superseded skips eviction for that
/// round, since its view of the disk is incomplete.
pub fn spawn_cache_maintenance(
	cache: Arc<ContentCache>,
	every: Duration,
	max_bytes: u64,
	stop: CancellationToken,
) -> JoinHandle<()> {
	spawn(async move {
		enum Event {
			Tick,
			Stop,
		}

		let mut ticker = interval_at(Instant::now(), every.max(Duration::from_secs(1)));
		ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

		loop {
			let event = (
				async {
					ticker.tick().await;
					Event::Tick
				},
				async {
					stop.cancelled().await;
					Event::Stop
				},
			)
				.race()
				.await;

			if matches!(event, Event::Stop) {
				cache.cancel_reconcile();
				debug!("Cache maintenance stopped;");
				break;
			}

			run_pass(&cache, max_bytes).await;
		}
	})
}

#[instrument(skip(cache))]
async fn run_pass(cache: &ContentCache, max_bytes: u64) {
	let Some(reconciled) = cache.reconcile().await else {
		debug!("Reconciliation superseded, skipping eviction this round;");
		return;
	};

	let evicted = cache.enforce_size_budget(max_bytes).await;

	info!(?reconciled, ?evicted, "Cache maintenance pass done;");
}

#[cfg(test)]
mod tests {
	use super::*;

	use lg_file_cache::ContentCacheConfig;
	use tempfile::tempdir;

	#[tokio::test]
	async fn first_pass_discovers_and_trims() {
		let dir = tempdir().unwrap();
		let source = dir.path().join("source");
		std::fs::create_dir_all(&source).unwrap();

		let cache = Arc::new(
			ContentCache::open(ContentCacheConfig::new(&source, dir.path().join("cache")))
				.await
				.unwrap(),
		);

		let stored = cache.storage_path(&lg_file_cache::ContentHash::of_bytes(b"abc"), "tex");
		std::fs::write(&stored, b"abc").unwrap();
		std::fs::write(source.join("body.mdl"), b"model").unwrap();

		let stop = CancellationToken::new();
		let maintenance =
			spawn_cache_maintenance(Arc::clone(&cache), Duration::from_secs(3600), 0, stop.clone());

		// wait for the first pass to evict the stored file
		while stored.exists() {
			tokio::time::sleep(Duration::from_millis(10)).await;
		}

		stop.cancel();
		maintenance.await.unwrap();

		let stats = cache.stats().await;
		assert_eq!(stats.cache_bytes, 0);
		assert_eq!(stats.records, 1);
	}
}

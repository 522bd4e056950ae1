//! Dead-letter queue lifecycle: locks, audit trail, resolution, replay.

mod common;

use serde_json::json;
use vanopticon_mimir::dlq::{DeadLetterInsert, DeadLetterQueue, DeadLetterReason};
use vanopticon_mimir::event::EventProcessor;

use common::sqlite_store;

fn letter(offset: i64, payload: serde_json::Value) -> DeadLetterInsert {
	DeadLetterInsert::new("ing-1", "cowrie.json", offset, None, DeadLetterReason::Validation, payload)
}

#[tokio::test]
async fn insert_preserves_payload_and_checksum() {
	let dir = tempfile::tempdir().unwrap();
	let store = sqlite_store(dir.path()).await;
	let queue = DeadLetterQueue::new(&store);

	let inserted = queue
		.insert_batch(&[
			letter(0, json!({"malformed": "{oops"})),
			letter(1, json!("bare string")),
			letter(2, json!({})),
		])
		.await
		.unwrap();
	assert_eq!(inserted, 3);

	let rows = queue.fetch_unresolved(10).await.unwrap();
	assert_eq!(rows.len(), 3);
	for row in &rows {
		// Payload is never empty, and the stored checksum matches it.
		assert!(!row.payload.as_object().unwrap().is_empty());
		assert!(DeadLetterQueue::checksum_valid(row));
		assert!(row.retry_count >= 0);
		assert!((1..=10).contains(&row.priority));
	}
	assert_eq!(rows[0].payload["_malformed_content"], "{oops");
}

#[tokio::test]
async fn locks_are_exclusive_until_released_or_expired() {
	let dir = tempfile::tempdir().unwrap();
	let store = sqlite_store(dir.path()).await;
	let queue = DeadLetterQueue::new(&store);
	queue.insert_batch(&[letter(0, json!({"x": 1}))]).await.unwrap();
	let id = queue.fetch_unresolved(1).await.unwrap()[0].id;

	let lock = queue.acquire_lock(id, 30).await.unwrap().expect("first lock");
	// Second claim fails while the lock is live.
	assert!(queue.acquire_lock(id, 30).await.unwrap().is_none());

	assert!(queue.release_lock(id, &lock).await.unwrap());
	assert!(queue.acquire_lock(id, 30).await.unwrap().is_some());
}

#[tokio::test]
async fn error_and_attempt_records_accumulate() {
	let dir = tempfile::tempdir().unwrap();
	let store = sqlite_store(dir.path()).await;
	let queue = DeadLetterQueue::new(&store);
	queue.insert_batch(&[letter(0, json!({"x": 1}))]).await.unwrap();
	let id = queue.fetch_unresolved(1).await.unwrap()[0].id;

	queue.record_attempt(id, "manual", false, Some(12)).await.unwrap();
	queue
		.record_error(id, "validation", "missing eventid", "manual")
		.await
		.unwrap();
	queue
		.record_error(id, "validation", "still missing", "manual")
		.await
		.unwrap();

	let row = queue.fetch(id).await.unwrap().unwrap();
	assert_eq!(row.retry_count, 2);
	assert_eq!(row.error_history.len(), 2);
	assert_eq!(row.processing_attempts.len(), 1);
	assert_eq!(row.error_history[0]["error_type"], "validation");
}

#[tokio::test]
async fn resolution_clears_the_lock() {
	let dir = tempfile::tempdir().unwrap();
	let store = sqlite_store(dir.path()).await;
	let queue = DeadLetterQueue::new(&store);
	queue.insert_batch(&[letter(0, json!({"x": 1}))]).await.unwrap();
	let id = queue.fetch_unresolved(1).await.unwrap()[0].id;

	queue.acquire_lock(id, 30).await.unwrap().unwrap();
	queue.mark_resolved(id, "manual").await.unwrap();

	let row = queue.fetch(id).await.unwrap().unwrap();
	assert!(row.resolved);
	assert!(row.resolved_at.is_some());
	assert_eq!(row.resolution_method.as_deref(), Some("manual"));
	assert!(row.processing_lock.is_none());
	assert!(queue.fetch_unresolved(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn idempotency_keys_are_lazy_and_stable() {
	let dir = tempfile::tempdir().unwrap();
	let store = sqlite_store(dir.path()).await;
	let queue = DeadLetterQueue::new(&store);
	queue.insert_batch(&[letter(7, json!({"x": 1}))]).await.unwrap();
	let id = queue.fetch_unresolved(1).await.unwrap()[0].id;

	assert!(queue.fetch(id).await.unwrap().unwrap().idempotency_key.is_none());
	let key = queue.ensure_idempotency_key(id).await.unwrap().unwrap();
	let again = queue.ensure_idempotency_key(id).await.unwrap().unwrap();
	assert_eq!(key, again);
	assert_eq!(key.len(), 64);
}

#[tokio::test]
async fn replay_resolves_events_that_now_validate() {
	let dir = tempfile::tempdir().unwrap();
	let store = sqlite_store(dir.path()).await;
	let queue = DeadLetterQueue::new(&store);

	// One event that will validate on replay, one that never will.
	queue
		.insert_batch(&[
			letter(
				0,
				json!({
					"session": "A",
					"eventid": "cowrie.session.connect",
					"timestamp": "2024-01-01T00:00:00Z",
				}),
			),
			letter(1, json!({"malformed": "{oops"})),
		])
		.await
		.unwrap();

	let outcome = queue
		.replay(&EventProcessor::default(), 10, 30)
		.await
		.unwrap();
	assert_eq!(outcome.resolved, 1);
	assert_eq!(outcome.failed, 1);

	let unresolved = queue.fetch_unresolved(10).await.unwrap();
	assert_eq!(unresolved.len(), 1);
	assert_eq!(unresolved[0].retry_count, 1);

	// The repaired event landed in raw_events.
	let count = store
		.fetch_optional("SELECT COUNT(*) AS n FROM raw_events", &[])
		.await
		.unwrap()
		.unwrap();
	assert_eq!(count.i64("n").unwrap(), 1);
}

//! Unicode sanitization at ingest time and retroactively.

mod common;

use serde_json::json;
use vanopticon_mimir::db::{maintenance, SqlParam};
use vanopticon_mimir::event::sanitize::payload_hash;
use vanopticon_mimir::loader::bulk::BulkLoader;
use vanopticon_mimir::loader::{BulkLoaderConfig, LoaderCallbacks};

use common::{sqlite_store, write_log};

#[tokio::test]
async fn control_characters_are_stripped_at_ingest() {
	let dir = tempfile::tempdir().unwrap();
	let store = sqlite_store(dir.path()).await;
	// NUL and ESC inside the filename field of a download event.
	let line = "{\"session\":\"A\",\"eventid\":\"cowrie.session.file_download\",\"timestamp\":\"2024-01-01T00:00:00Z\",\"filename\":\"mal\\u0000ware\\u001b.sh\",\"url\":\"http://evil\\u0000.example/x\"}";
	let log = write_log(dir.path(), "events.json", &[line]);

	let loader = BulkLoader::new(&store, BulkLoaderConfig::default());
	loader
		.load_paths(&[log], None, &LoaderCallbacks::default())
		.await
		.unwrap();

	let row = store
		.fetch_optional("SELECT payload, payload_hash FROM raw_events", &[])
		.await
		.unwrap()
		.expect("raw event");
	let payload = row.json("payload").unwrap();
	assert_eq!(payload["filename"], "malware.sh");
	assert_eq!(payload["url"], "http://evil.example/x");
	// Stored hash is over the sanitized document.
	assert_eq!(row.text("payload_hash").unwrap(), payload_hash(&payload));
}

#[tokio::test]
async fn retroactive_sanitization_repairs_old_rows() {
	let dir = tempfile::tempdir().unwrap();
	let store = sqlite_store(dir.path()).await;

	// A row persisted before sanitization existed.
	let dirty = json!({
		"eventid": "cowrie.command.input",
		"input": "echo\u{0000} pwned\u{001b}[0m",
	});
	store
		.execute(
			"INSERT INTO raw_events
				(ingest_id, source, source_offset, source_inode, source_generation,
				 payload, payload_hash, risk_score, quarantined)
			 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
			&[
				SqlParam::Text("ing".to_string()),
				SqlParam::Text("legacy.json".to_string()),
				SqlParam::I64(0),
				SqlParam::Text("1".to_string()),
				SqlParam::I64(0),
				SqlParam::Json(dirty.clone()),
				SqlParam::Text(payload_hash(&dirty)),
				SqlParam::I64(0),
				SqlParam::Bool(false),
			],
		)
		.await
		.unwrap();
	store
		.execute(
			"INSERT INTO session_summaries (session_id, source_files)
			 VALUES ($1, $2)",
			&[
				SqlParam::Text("A".to_string()),
				SqlParam::Json(json!(["log\u{0001}.json"])),
			],
		)
		.await
		.unwrap();

	// Dry run reports but does not modify.
	let dry = maintenance::sanitize_existing(&store, true).await.unwrap();
	assert_eq!(dry.raw_events_updated, 1);
	assert_eq!(dry.summaries_updated, 1);
	let untouched = store
		.fetch_optional("SELECT payload FROM raw_events", &[])
		.await
		.unwrap()
		.unwrap();
	assert_eq!(untouched.json("payload").unwrap()["input"], "echo\u{0000} pwned\u{001b}[0m");

	// The real pass rewrites payloads and rehashes them.
	let report = maintenance::sanitize_existing(&store, false).await.unwrap();
	assert_eq!(report.raw_events_updated, 1);
	assert_eq!(report.summaries_updated, 1);

	let row = store
		.fetch_optional("SELECT payload, payload_hash FROM raw_events", &[])
		.await
		.unwrap()
		.unwrap();
	let payload = row.json("payload").unwrap();
	assert_eq!(payload["input"], "echo pwned[0m");
	assert_eq!(row.text("payload_hash").unwrap(), payload_hash(&payload));

	let summary = store
		.fetch_optional("SELECT source_files FROM session_summaries", &[])
		.await
		.unwrap()
		.unwrap();
	assert_eq!(summary.json("source_files").unwrap(), json!(["log.json"]));

	// A second pass finds nothing left to fix.
	let clean = maintenance::sanitize_existing(&store, false).await.unwrap();
	assert_eq!(clean.raw_events_updated, 0);
	assert_eq!(clean.summaries_updated, 0);
}

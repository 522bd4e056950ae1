//! Session snapshot population and immutability.

mod common;

use chrono::Utc;
use serde_json::json;
use vanopticon_mimir::db::SqlParam;
use vanopticon_mimir::loader::bulk::BulkLoader;
use vanopticon_mimir::loader::{BulkLoaderConfig, LoaderCallbacks};

use common::{connect_event, sqlite_store, write_log};

async fn seed_inventory(
	store: &vanopticon_mimir::db::Store,
	ip: &str,
	asn: Option<&str>,
	enrichment: serde_json::Value,
) {
	store
		.execute(
			"INSERT INTO ip_inventory (ip_address, session_count, enrichment, current_asn, enrichment_updated_at)
			 VALUES ($1, $2, $3, $4, $5)
			 ON CONFLICT (ip_address) DO UPDATE SET
				enrichment = excluded.enrichment,
				current_asn = excluded.current_asn,
				enrichment_updated_at = excluded.enrichment_updated_at",
			&[
				SqlParam::Text(ip.to_string()),
				SqlParam::I64(0),
				SqlParam::Json(enrichment),
				SqlParam::opt_text(asn.map(|s| s.to_string())),
				SqlParam::Timestamp(Utc::now()),
			],
		)
		.await
		.unwrap();
}

async fn snapshot_columns(
	store: &vanopticon_mimir::db::Store,
	session: &str,
) -> (Option<String>, Option<String>, Option<String>) {
	let row = store
		.fetch_optional(
			"SELECT snapshot_asn, snapshot_country, snapshot_ip_type
			 FROM session_summaries WHERE session_id = $1",
			&[SqlParam::Text(session.to_string())],
		)
		.await
		.unwrap()
		.expect("summary row");
	(
		row.opt_text("snapshot_asn").unwrap(),
		row.opt_text("snapshot_country").unwrap(),
		row.opt_text("snapshot_ip_type").unwrap(),
	)
}

#[tokio::test]
async fn snapshots_capture_enrichment_state_at_ingest_time() {
	let dir = tempfile::tempdir().unwrap();
	let store = sqlite_store(dir.path()).await;
	seed_inventory(
		&store,
		"1.2.3.4",
		Some("AS64496"),
		json!({
			"dshield": {"ascountry": "NL"},
			"ip_classification": {"ip_type": "datacenter"},
		}),
	)
	.await;

	let log = write_log(
		dir.path(),
		"events.json",
		&[&connect_event("A", "1.2.3.4", "2024-01-01T00:00:00Z")],
	);
	let loader = BulkLoader::new(&store, BulkLoaderConfig::default());
	loader
		.load_paths(&[log], None, &LoaderCallbacks::default())
		.await
		.unwrap();

	let (asn, country, ip_type) = snapshot_columns(&store, "A").await;
	assert_eq!(asn.as_deref(), Some("AS64496"));
	assert_eq!(country.as_deref(), Some("NL"));
	assert_eq!(ip_type.as_deref(), Some("datacenter"));
}

#[tokio::test]
async fn snapshots_are_immutable_after_first_write() {
	let dir = tempfile::tempdir().unwrap();
	let store = sqlite_store(dir.path()).await;
	seed_inventory(
		&store,
		"1.2.3.4",
		Some("AS64496"),
		json!({"dshield": {"ascountry": "NL"}}),
	)
	.await;

	let first = write_log(
		dir.path(),
		"first.json",
		&[&connect_event("A", "1.2.3.4", "2024-01-01T00:00:00Z")],
	);
	let loader = BulkLoader::new(&store, BulkLoaderConfig::default());
	loader
		.load_paths(&[first], None, &LoaderCallbacks::default())
		.await
		.unwrap();

	// The world changes: re-enrichment says the IP moved.
	seed_inventory(
		&store,
		"1.2.3.4",
		Some("AS65551"),
		json!({"dshield": {"ascountry": "US"}}),
	)
	.await;

	let second = write_log(
		dir.path(),
		"second.json",
		&[&connect_event("A", "1.2.3.4", "2024-01-02T00:00:00Z")],
	);
	loader
		.load_paths(&[second], None, &LoaderCallbacks::default())
		.await
		.unwrap();

	// The session keeps what enrichment said when it was first seen.
	let (asn, country, _) = snapshot_columns(&store, "A").await;
	assert_eq!(asn.as_deref(), Some("AS64496"));
	assert_eq!(country.as_deref(), Some("NL"));

	// A new session from the same IP sees the new state.
	let third = write_log(
		dir.path(),
		"third.json",
		&[&connect_event("B", "1.2.3.4", "2024-01-03T00:00:00Z")],
	);
	loader
		.load_paths(&[third], None, &LoaderCallbacks::default())
		.await
		.unwrap();
	let (asn_b, country_b, _) = snapshot_columns(&store, "B").await;
	assert_eq!(asn_b.as_deref(), Some("AS65551"));
	assert_eq!(country_b.as_deref(), Some("US"));
}

#[tokio::test]
async fn unknown_country_sentinel_stays_null() {
	let dir = tempfile::tempdir().unwrap();
	let store = sqlite_store(dir.path()).await;
	seed_inventory(&store, "1.2.3.4", None, json!({"dshield": {"ascountry": "XX"}})).await;

	let log = write_log(
		dir.path(),
		"events.json",
		&[&connect_event("A", "1.2.3.4", "2024-01-01T00:00:00Z")],
	);
	let loader = BulkLoader::new(&store, BulkLoaderConfig::default());
	loader
		.load_paths(&[log], None, &LoaderCallbacks::default())
		.await
		.unwrap();

	let (asn, country, ip_type) = snapshot_columns(&store, "A").await;
	assert!(asn.is_none());
	assert!(country.is_none());
	assert!(ip_type.is_none());
}

#[tokio::test]
async fn sightings_accumulate_in_ip_inventory() {
	let dir = tempfile::tempdir().unwrap();
	let store = sqlite_store(dir.path()).await;

	let log = write_log(
		dir.path(),
		"events.json",
		&[
			&connect_event("A", "1.2.3.4", "2024-01-01T00:00:00Z"),
			&connect_event("B", "1.2.3.4", "2024-01-01T01:00:00Z"),
			&connect_event("C", "5.6.7.8", "2024-01-01T02:00:00Z"),
		],
	);
	let loader = BulkLoader::new(&store, BulkLoaderConfig::default());
	loader
		.load_paths(&[log], None, &LoaderCallbacks::default())
		.await
		.unwrap();

	let row = store
		.fetch_optional(
			"SELECT session_count, first_seen, last_seen FROM ip_inventory WHERE ip_address = $1",
			&[SqlParam::Text("1.2.3.4".to_string())],
		)
		.await
		.unwrap()
		.expect("inventory row");
	assert_eq!(row.i64("session_count").unwrap(), 2);
	assert!(row.opt_timestamp("first_seen").unwrap().unwrap() < row.opt_timestamp("last_seen").unwrap().unwrap());
}

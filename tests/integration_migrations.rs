//! Migrator behavior: idempotence and corrupt-version recovery.

mod common;

use vanopticon_mimir::db::{migrations, SqlParam, Store};

async fn fresh_store(dir: &std::path::Path) -> Store {
	let url = format!("sqlite://{}", dir.join("migrations.db").display());
	Store::connect(&url).await.unwrap()
}

#[tokio::test]
async fn migrate_is_idempotent() {
	let dir = tempfile::tempdir().unwrap();
	let store = fresh_store(dir.path()).await;

	let first = migrations::migrate(&store).await.unwrap();
	assert_eq!(first, migrations::CURRENT_VERSION);

	let second = migrations::migrate(&store).await.unwrap();
	assert_eq!(second, migrations::CURRENT_VERSION);
	assert_eq!(
		migrations::current_version(&store).await.unwrap(),
		migrations::CURRENT_VERSION
	);
	assert!(migrations::verify(&store).await.unwrap().is_empty());
}

#[tokio::test]
async fn unparseable_version_is_treated_as_zero_and_recovers() {
	let dir = tempfile::tempdir().unwrap();
	let store = fresh_store(dir.path()).await;
	migrations::migrate(&store).await.unwrap();

	// Corrupt the version row.
	store
		.execute(
			"UPDATE schema_state SET value = $1 WHERE key = $2",
			&[
				SqlParam::Text("not-a-number".to_string()),
				SqlParam::Text("schema_version".to_string()),
			],
		)
		.await
		.unwrap();
	assert_eq!(migrations::current_version(&store).await.unwrap(), 0);

	// Re-running restores the recorded version without clobbering tables.
	let version = migrations::migrate(&store).await.unwrap();
	assert_eq!(version, migrations::CURRENT_VERSION);
	assert!(migrations::verify(&store).await.unwrap().is_empty());
}

#[tokio::test]
async fn migrated_schema_enforces_the_natural_key() {
	let dir = tempfile::tempdir().unwrap();
	let store = fresh_store(dir.path()).await;
	migrations::migrate(&store).await.unwrap();

	let insert = "INSERT INTO raw_events
			(ingest_id, source, source_offset, source_inode, source_generation,
			 payload, payload_hash, risk_score, quarantined)
		 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)";
	let params = |offset: i64| {
		vec![
			SqlParam::Text("ing".to_string()),
			SqlParam::Text("log".to_string()),
			SqlParam::I64(offset),
			SqlParam::Text("123".to_string()),
			SqlParam::I64(0),
			SqlParam::Text("{}".to_string()),
			SqlParam::Text("hash".to_string()),
			SqlParam::I64(0),
			SqlParam::Bool(false),
		]
	};
	store.execute(insert, &params(0)).await.unwrap();
	// Same natural key: rejected by the unique constraint.
	assert!(store.execute(insert, &params(0)).await.is_err());
	// Different offset: accepted.
	store.execute(insert, &params(1)).await.unwrap();
}

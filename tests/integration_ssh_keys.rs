//! SSH key extraction: ingest-time aggregation, backfill, export.

mod common;

use vanopticon_mimir::db::SqlParam;
use vanopticon_mimir::enrich::ssh_keys;
use vanopticon_mimir::loader::delta::DeltaLoader;
use vanopticon_mimir::loader::{DeltaLoaderConfig, LoaderCallbacks};

use common::{connect_event, sqlite_store, write_log};

const KEY_B64: &str = "AAAAB3NzaC1yc2EAAAADAQABAAABAQDexampleexampleexampleexampleexample";

fn injection_event(session: &str) -> String {
	format!(
		r#"{{"session":"{session}","eventid":"cowrie.command.input","timestamp":"2024-01-01T00:00:01Z","input":"echo 'ssh-rsa {KEY_B64} bot@net' >> ~/.ssh/authorized_keys"}}"#
	)
}

#[tokio::test]
async fn ingest_time_extraction_populates_session_aggregates() {
	let dir = tempfile::tempdir().unwrap();
	let store = sqlite_store(dir.path()).await;
	let log = write_log(
		dir.path(),
		"cowrie.json",
		&[
			&connect_event("A", "1.2.3.4", "2024-01-01T00:00:00Z"),
			&injection_event("A"),
			&injection_event("A"),
		],
	);

	let loader = DeltaLoader::new(&store, DeltaLoaderConfig::default());
	loader
		.load_paths(&[log], None, &LoaderCallbacks::default())
		.await
		.unwrap();

	let row = store
		.fetch_optional(
			"SELECT ssh_key_injections, unique_ssh_keys FROM session_summaries WHERE session_id = $1",
			&[SqlParam::Text("A".to_string())],
		)
		.await
		.unwrap()
		.expect("summary row");
	assert_eq!(row.i64("ssh_key_injections").unwrap(), 2);
	let keys = row.json("unique_ssh_keys").unwrap();
	assert_eq!(keys.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn backfill_recomputes_from_stored_events() {
	let dir = tempfile::tempdir().unwrap();
	let store = sqlite_store(dir.path()).await;
	let log = write_log(
		dir.path(),
		"cowrie.json",
		&[
			&connect_event("A", "1.2.3.4", "2024-01-01T00:00:00Z"),
			&injection_event("A"),
		],
	);
	let loader = DeltaLoader::new(&store, DeltaLoaderConfig::default());
	loader
		.load_paths(&[log], None, &LoaderCallbacks::default())
		.await
		.unwrap();

	// Simulate drift: wipe the aggregates, then backfill from raw events.
	store
		.execute(
			"UPDATE session_summaries SET ssh_key_injections = 0, unique_ssh_keys = NULL",
			&[],
		)
		.await
		.unwrap();

	let report = ssh_keys::backfill_session_keys(&store).await.unwrap();
	assert_eq!(report.injections_found, 1);
	assert_eq!(report.sessions_updated, 1);

	let row = store
		.fetch_optional(
			"SELECT ssh_key_injections FROM session_summaries WHERE session_id = $1",
			&[SqlParam::Text("A".to_string())],
		)
		.await
		.unwrap()
		.unwrap();
	assert_eq!(row.i64("ssh_key_injections").unwrap(), 1);
}

#[tokio::test]
async fn export_lists_unique_keys_with_sessions() {
	let dir = tempfile::tempdir().unwrap();
	let store = sqlite_store(dir.path()).await;
	let log = write_log(
		dir.path(),
		"cowrie.json",
		&[&injection_event("A"), &injection_event("B")],
	);
	let loader = DeltaLoader::new(&store, DeltaLoaderConfig::default());
	loader
		.load_paths(&[log], None, &LoaderCallbacks::default())
		.await
		.unwrap();

	let keys = ssh_keys::export_unique_keys(&store).await.unwrap();
	assert_eq!(keys.len(), 1);
	assert_eq!(keys[0]["key_type"], "ssh-rsa");
	let sessions = keys[0]["sessions"].as_array().unwrap();
	assert_eq!(sessions.len(), 2);
}

#![allow(dead_code)]

//! Shared helpers for integration tests.
//!
//! Tests run against a temporary SQLite database by default. Set
//! `MIM_PG_TEST_URL` to also exercise the PostgreSQL paths where a test
//! opts in.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use vanopticon_mimir::db::{migrations, Store};

/// Open a migrated store on a fresh SQLite file inside `dir`.
pub async fn sqlite_store(dir: &Path) -> Arc<Store> {
	let db_path = dir.join("mimir-test.db");
	let url = format!("sqlite://{}", db_path.display());
	let store = Store::connect(&url).await.expect("connect sqlite store");
	migrations::migrate(&store).await.expect("apply migrations");
	Arc::new(store)
}

/// Write a JSON-lines log file and return its path.
pub fn write_log(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
	let path = dir.join(name);
	let mut content = String::new();
	for line in lines {
		content.push_str(line);
		content.push('\n');
	}
	std::fs::write(&path, content).expect("write log file");
	path
}

/// A benign connect event for session `session` from `src_ip`.
pub fn connect_event(session: &str, src_ip: &str, timestamp: &str) -> String {
	format!(
		r#"{{"session":"{session}","eventid":"cowrie.session.connect","timestamp":"{timestamp}","src_ip":"{src_ip}","sensor":"s1"}}"#
	)
}

/// A command-input event with the given command text.
pub fn command_event(session: &str, command: &str, timestamp: &str) -> String {
	format!(
		r#"{{"session":"{session}","eventid":"cowrie.command.input","timestamp":"{timestamp}","input":"{command}"}}"#
	)
}

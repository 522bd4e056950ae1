//! Forward-only schema migrations.
//!
//! `schema_state` holds one row (`schema_version`) naming the current
//! version. On startup the migrator applies every newer migration in order,
//! one transaction per migration, updating the version row inside the same
//! transaction. Re-running a completed migration is a no-op; a version value
//! that fails to parse is treated as version 0 and the whole chain re-runs
//! (DDL statements are written to survive that).

use tracing::info;

use crate::db::{Dialect, SqlParam, Store, StoreError, StoreResult};

/// A numbered migration and the statements it executes per dialect.
struct Migration {
	version: i64,
	name: &'static str,
	statements: fn(Dialect) -> Vec<String>,
}

const MIGRATIONS: &[Migration] = &[
	Migration {
		version: 1,
		name: "core ingest tables",
		statements: core_ingest_tables,
	},
	Migration {
		version: 2,
		name: "dead letter queue",
		statements: dead_letter_queue,
	},
	Migration {
		version: 3,
		name: "enrichment cache and ip inventory",
		statements: enrichment_tables,
	},
	Migration {
		version: 4,
		name: "session snapshots and ssh key aggregates",
		statements: session_snapshots,
	},
];

/// The schema version this build of the crate expects.
pub const CURRENT_VERSION: i64 = 4;

fn pk(dialect: Dialect) -> &'static str {
	match dialect {
		Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
		Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
	}
}

fn boolean(dialect: Dialect, default_false: bool) -> &'static str {
	match (dialect, default_false) {
		(Dialect::Sqlite, true) => "INTEGER NOT NULL DEFAULT 0",
		(Dialect::Sqlite, false) => "INTEGER",
		(Dialect::Postgres, true) => "BOOLEAN NOT NULL DEFAULT FALSE",
		(Dialect::Postgres, false) => "BOOLEAN",
	}
}

fn timestamp(dialect: Dialect) -> &'static str {
	match dialect {
		Dialect::Sqlite => "TEXT",
		Dialect::Postgres => "TIMESTAMPTZ",
	}
}

fn core_ingest_tables(d: Dialect) -> Vec<String> {
	vec![
		format!(
			"CREATE TABLE IF NOT EXISTS raw_events (
				id {pk},
				ingest_id TEXT NOT NULL,
				source TEXT NOT NULL,
				source_offset BIGINT NOT NULL,
				source_inode TEXT NOT NULL DEFAULT '',
				source_generation BIGINT NOT NULL DEFAULT 0,
				payload TEXT NOT NULL,
				payload_hash TEXT NOT NULL,
				risk_score BIGINT NOT NULL DEFAULT 0,
				quarantined {quarantined} ,
				session_id TEXT,
				event_type TEXT,
				event_timestamp {ts},
				ingested_at {ts},
				CONSTRAINT uq_raw_events_natural_key
					UNIQUE (source, source_inode, source_generation, source_offset)
			)",
			pk = pk(d),
			quarantined = boolean(d, true),
			ts = timestamp(d),
		),
		"CREATE INDEX IF NOT EXISTS ix_raw_events_session ON raw_events (session_id)".to_string(),
		"CREATE INDEX IF NOT EXISTS ix_raw_events_event_type ON raw_events (event_type)"
			.to_string(),
		"CREATE INDEX IF NOT EXISTS ix_raw_events_ingest ON raw_events (ingest_id)".to_string(),
		format!(
			"CREATE TABLE IF NOT EXISTS session_summaries (
				session_id TEXT PRIMARY KEY,
				event_count BIGINT NOT NULL DEFAULT 0,
				command_count BIGINT NOT NULL DEFAULT 0,
				file_downloads BIGINT NOT NULL DEFAULT 0,
				login_attempts BIGINT NOT NULL DEFAULT 0,
				first_event_at {ts},
				last_event_at {ts},
				risk_score BIGINT NOT NULL DEFAULT 0,
				source_files TEXT,
				matcher TEXT,
				vt_flagged {flag},
				dshield_flagged {flag},
				created_at {ts},
				updated_at {ts}
			)",
			ts = timestamp(d),
			flag = boolean(d, true),
		),
		format!(
			"CREATE TABLE IF NOT EXISTS ingest_cursors (
				source TEXT PRIMARY KEY,
				inode TEXT,
				last_offset BIGINT NOT NULL DEFAULT -1,
				last_ingest_id TEXT,
				metadata TEXT,
				last_ingest_at {ts}
			)",
			ts = timestamp(d),
		),
	]
}

fn dead_letter_queue(d: Dialect) -> Vec<String> {
	vec![
		format!(
			"CREATE TABLE IF NOT EXISTS dead_letter_events (
				id {pk},
				ingest_id TEXT,
				source TEXT,
				source_offset BIGINT,
				source_inode TEXT,
				reason TEXT NOT NULL,
				payload TEXT NOT NULL,
				metadata TEXT,
				payload_checksum TEXT,
				retry_count BIGINT NOT NULL DEFAULT 0,
				error_history TEXT,
				processing_attempts TEXT,
				resolved {flag},
				resolved_at {ts},
				resolution_method TEXT,
				idempotency_key TEXT UNIQUE,
				processing_lock TEXT,
				lock_expires_at {ts},
				priority BIGINT NOT NULL DEFAULT 5,
				classification TEXT,
				created_at {ts},
				updated_at {ts},
				last_processed_at {ts},
				CONSTRAINT ck_dead_letter_retry_count CHECK (retry_count >= 0),
				CONSTRAINT ck_dead_letter_priority CHECK (priority BETWEEN 1 AND 10)
			)",
			pk = pk(d),
			flag = boolean(d, true),
			ts = timestamp(d),
		),
		"CREATE INDEX IF NOT EXISTS ix_dead_letter_resolved_created
			ON dead_letter_events (resolved, created_at)"
			.to_string(),
		"CREATE INDEX IF NOT EXISTS ix_dead_letter_priority_resolved
			ON dead_letter_events (priority, resolved)"
			.to_string(),
		"CREATE INDEX IF NOT EXISTS ix_dead_letter_lock_expires
			ON dead_letter_events (lock_expires_at)"
			.to_string(),
		"CREATE INDEX IF NOT EXISTS ix_dead_letter_classification
			ON dead_letter_events (classification)"
			.to_string(),
	]
}

fn enrichment_tables(d: Dialect) -> Vec<String> {
	vec![
		format!(
			"CREATE TABLE IF NOT EXISTS enrichment_cache (
				id {pk},
				service TEXT NOT NULL,
				cache_key TEXT NOT NULL,
				cache_value TEXT NOT NULL,
				created_at {ts} NOT NULL,
				expires_at {ts} NOT NULL,
				CONSTRAINT uq_enrichment_cache_service_key UNIQUE (service, cache_key)
			)",
			pk = pk(d),
			ts = timestamp(d),
		),
		"CREATE INDEX IF NOT EXISTS ix_enrichment_cache_expires
			ON enrichment_cache (expires_at)"
			.to_string(),
		format!(
			"CREATE TABLE IF NOT EXISTS ip_inventory (
				ip_address TEXT PRIMARY KEY,
				first_seen {ts},
				last_seen {ts},
				session_count BIGINT NOT NULL DEFAULT 0,
				enrichment TEXT,
				current_asn TEXT,
				enrichment_updated_at {ts}
			)",
			ts = timestamp(d),
		),
	]
}

fn session_snapshots(d: Dialect) -> Vec<String> {
	// SQLite has no ADD COLUMN IF NOT EXISTS; the runner tolerates
	// duplicate-column errors so a corrupt-version re-run still completes.
	let if_absent = match d {
		Dialect::Sqlite => "",
		Dialect::Postgres => "IF NOT EXISTS ",
	};
	let ts = timestamp(d);
	let mut statements: Vec<String> = [
		"source_ip TEXT".to_string(),
		"snapshot_asn TEXT".to_string(),
		"snapshot_country TEXT".to_string(),
		"snapshot_ip_type TEXT".to_string(),
		format!("enrichment_at {ts}"),
		"ssh_key_injections BIGINT NOT NULL DEFAULT 0".to_string(),
		"unique_ssh_keys TEXT".to_string(),
	]
	.into_iter()
	.map(|col| format!("ALTER TABLE session_summaries ADD COLUMN {if_absent}{col}"))
	.collect();
	statements.push(
		"CREATE INDEX IF NOT EXISTS ix_session_summaries_source_ip
			ON session_summaries (source_ip)"
			.to_string(),
	);
	statements
}

async fn ensure_schema_state(store: &Store) -> StoreResult<()> {
	store
		.execute(
			"CREATE TABLE IF NOT EXISTS schema_state (
				key TEXT PRIMARY KEY,
				value TEXT NOT NULL
			)",
			&[],
		)
		.await?;
	Ok(())
}

/// Read the current schema version. Missing or unparseable values are
/// version 0.
pub async fn current_version(store: &Store) -> StoreResult<i64> {
	ensure_schema_state(store).await?;
	let row = store
		.fetch_optional(
			"SELECT value FROM schema_state WHERE key = $1",
			&[SqlParam::Text("schema_version".to_string())],
		)
		.await?;
	Ok(row
		.and_then(|r| r.text("value").ok())
		.and_then(|v| v.trim().parse::<i64>().ok())
		.unwrap_or(0))
}

/// Apply all migrations newer than the recorded version.
///
/// Returns the version the schema ends at. Safe to call on every startup and
/// safe to call twice: a schema already at [`CURRENT_VERSION`] is untouched.
pub async fn migrate(store: &Store) -> StoreResult<i64> {
	ensure_schema_state(store).await?;
	let mut version = current_version(store).await?;

	for migration in MIGRATIONS {
		if migration.version <= version {
			continue;
		}
		let mut tx = store.begin().await?;
		for statement in (migration.statements)(tx.dialect()) {
			if let Err(e) = tx.execute(&statement, &[]).await {
				// A corrupt version string resets the chain to 0; column
				// additions from already-applied migrations then collide.
				if e.to_string().contains("duplicate column") {
					continue;
				}
				return Err(StoreError::Migration {
					version: migration.version,
					message: e.to_string(),
				});
			}
		}
		let updated = tx
			.execute(
				"UPDATE schema_state SET value = $1 WHERE key = $2",
				&[
					SqlParam::Text(migration.version.to_string()),
					SqlParam::Text("schema_version".to_string()),
				],
			)
			.await?;
		if updated == 0 {
			tx.execute(
				"INSERT INTO schema_state (key, value) VALUES ($1, $2)",
				&[
					SqlParam::Text("schema_version".to_string()),
					SqlParam::Text(migration.version.to_string()),
				],
			)
			.await?;
		}
		tx.commit().await?;
		info!(version = migration.version, name = migration.name, "applied migration");
		version = migration.version;
	}

	Ok(version)
}

/// Verify the schema: version matches, every expected table answers a probe.
pub async fn verify(store: &Store) -> StoreResult<Vec<String>> {
	let mut problems = Vec::new();
	let version = current_version(store).await?;
	if version != CURRENT_VERSION {
		problems.push(format!(
			"schema version is {} but this build expects {}",
			version, CURRENT_VERSION
		));
	}
	for table in [
		"raw_events",
		"session_summaries",
		"ingest_cursors",
		"dead_letter_events",
		"enrichment_cache",
		"ip_inventory",
	] {
		let probe = format!("SELECT COUNT(*) AS n FROM {table}");
		if store.fetch_optional(&probe, &[]).await.is_err() {
			problems.push(format!("table {table} is missing or unreadable"));
		}
	}
	Ok(problems)
}

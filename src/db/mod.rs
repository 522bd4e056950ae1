//! Dialect-aware storage access.
//!
//! One deployment uses exactly one relational backend: the embedded engine
//! (SQLite in WAL mode, a single file) or a server engine (PostgreSQL).
//! Feature modules write their own SQL; this module provides the connection
//! handling, a small parameter/row value bridge so the same statement text
//! can run against either driver, and transactions.
//!
//! SQL convention: placeholders are written `$1..$n`, strictly increasing and
//! never repeated. Both drivers assign parameter indexes in order of first
//! occurrence under that convention, so one statement string serves both.

pub mod maintenance;
pub mod migrations;
pub mod models;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::sqlite::{
	SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use thiserror::Error;

/// Errors surfaced by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("unsupported database url: {0}")]
	UnsupportedUrl(String),

	#[error("database error: {0}")]
	Sqlx(#[from] sqlx::Error),

	#[error("column {0} missing or of unexpected type")]
	Column(String),

	#[error("stored JSON document is invalid: {0}")]
	Json(#[from] serde_json::Error),

	#[error("migration {version} failed: {message}")]
	Migration { version: i64, message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The SQL dialect behind a [`Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
	Sqlite,
	Postgres,
}

impl Dialect {
	/// `GREATEST(a, b)` for the server engine, two-argument `MAX(a, b)` for
	/// the embedded one.
	pub fn greatest(&self, a: &str, b: &str) -> String {
		match self {
			Dialect::Sqlite => format!("max({a}, {b})"),
			Dialect::Postgres => format!("greatest({a}, {b})"),
		}
	}

	/// `LEAST(a, b)` / two-argument `MIN(a, b)`.
	pub fn least(&self, a: &str, b: &str) -> String {
		match self {
			Dialect::Sqlite => format!("min({a}, {b})"),
			Dialect::Postgres => format!("least({a}, {b})"),
		}
	}
}

enum Pool {
	Sqlite(SqlitePool),
	Postgres(PgPool),
}

/// A connected database handle.
pub struct Store {
	pool: Pool,
	dialect: Dialect,
}

/// Owned bind parameter accepted by every statement helper.
#[derive(Debug, Clone)]
pub enum SqlParam {
	Null,
	I64(i64),
	Bool(bool),
	Text(String),
	Timestamp(DateTime<Utc>),
	/// Serialized to canonical JSON text at bind time.
	Json(Value),
}

impl SqlParam {
	pub fn opt_text(value: Option<String>) -> Self {
		match value {
			Some(v) => Self::Text(v),
			None => Self::Null,
		}
	}

	pub fn opt_i64(value: Option<i64>) -> Self {
		match value {
			Some(v) => Self::I64(v),
			None => Self::Null,
		}
	}

	pub fn opt_timestamp(value: Option<DateTime<Utc>>) -> Self {
		match value {
			Some(v) => Self::Timestamp(v),
			None => Self::Null,
		}
	}
}

/// A fetched row, decodable by column name regardless of backend.
pub struct DbRow(RowInner);

enum RowInner {
	Sqlite(SqliteRow),
	Postgres(PgRow),
}

macro_rules! row_get {
	($self:ident, $col:ident, $ty:ty) => {
		match &$self.0 {
			RowInner::Sqlite(row) => row
				.try_get::<$ty, _>($col)
				.map_err(|_| StoreError::Column($col.to_string())),
			RowInner::Postgres(row) => row
				.try_get::<$ty, _>($col)
				.map_err(|_| StoreError::Column($col.to_string())),
		}
	};
}

impl DbRow {
	pub fn i64(&self, col: &str) -> StoreResult<i64> {
		row_get!(self, col, i64)
	}

	pub fn opt_i64(&self, col: &str) -> StoreResult<Option<i64>> {
		row_get!(self, col, Option<i64>)
	}

	pub fn bool(&self, col: &str) -> StoreResult<bool> {
		row_get!(self, col, bool)
	}

	pub fn text(&self, col: &str) -> StoreResult<String> {
		row_get!(self, col, String)
	}

	pub fn opt_text(&self, col: &str) -> StoreResult<Option<String>> {
		row_get!(self, col, Option<String>)
	}

	pub fn timestamp(&self, col: &str) -> StoreResult<DateTime<Utc>> {
		row_get!(self, col, DateTime<Utc>)
	}

	pub fn opt_timestamp(&self, col: &str) -> StoreResult<Option<DateTime<Utc>>> {
		row_get!(self, col, Option<DateTime<Utc>>)
	}

	/// Decode a TEXT column containing a JSON document.
	pub fn json(&self, col: &str) -> StoreResult<Value> {
		let raw = self.text(col)?;
		Ok(serde_json::from_str(&raw)?)
	}

	pub fn opt_json(&self, col: &str) -> StoreResult<Option<Value>> {
		match self.opt_text(col)? {
			Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
			None => Ok(None),
		}
	}

}

macro_rules! bind_params {
	($query:expr, $params:expr) => {{
		let mut q = $query;
		for p in $params {
			q = match p {
				SqlParam::Null => q.bind(Option::<String>::None),
				SqlParam::I64(v) => q.bind(*v),
				SqlParam::Bool(v) => q.bind(*v),
				SqlParam::Text(v) => q.bind(v.clone()),
				SqlParam::Timestamp(v) => q.bind(*v),
				SqlParam::Json(v) => q.bind(v.to_string()),
			};
		}
		q
	}};
}

impl Store {
	/// Connect to a database by URL. `sqlite:` URLs open the embedded engine
	/// with WAL journaling; `postgres:`/`postgresql:` URLs open a server pool.
	pub async fn connect(database_url: &str) -> StoreResult<Self> {
		if database_url.starts_with("sqlite:") {
			let options = SqliteConnectOptions::from_str(database_url)?
				.create_if_missing(true)
				.journal_mode(SqliteJournalMode::Wal)
				.busy_timeout(Duration::from_secs(30));
			let pool = SqlitePoolOptions::new()
				.max_connections(8)
				.connect_with(options)
				.await?;
			Ok(Self {
				pool: Pool::Sqlite(pool),
				dialect: Dialect::Sqlite,
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.max_connections(8)
				.acquire_timeout(Duration::from_secs(30))
				.connect(database_url)
				.await?;
			Ok(Self {
				pool: Pool::Postgres(pool),
				dialect: Dialect::Postgres,
			})
		} else {
			Err(StoreError::UnsupportedUrl(database_url.to_string()))
		}
	}

	pub fn dialect(&self) -> Dialect {
		self.dialect
	}

	/// Execute a statement, returning the affected row count.
	pub async fn execute(&self, sql: &str, params: &[SqlParam]) -> StoreResult<u64> {
		match &self.pool {
			Pool::Sqlite(pool) => {
				let q = bind_params!(sqlx::query(sql), params);
				Ok(q.execute(pool).await?.rows_affected())
			}
			Pool::Postgres(pool) => {
				let q = bind_params!(sqlx::query(sql), params);
				Ok(q.execute(pool).await?.rows_affected())
			}
		}
	}

	pub async fn fetch_all(&self, sql: &str, params: &[SqlParam]) -> StoreResult<Vec<DbRow>> {
		match &self.pool {
			Pool::Sqlite(pool) => {
				let q = bind_params!(sqlx::query(sql), params);
				Ok(q.fetch_all(pool)
					.await?
					.into_iter()
					.map(|r| DbRow(RowInner::Sqlite(r)))
					.collect())
			}
			Pool::Postgres(pool) => {
				let q = bind_params!(sqlx::query(sql), params);
				Ok(q.fetch_all(pool)
					.await?
					.into_iter()
					.map(|r| DbRow(RowInner::Postgres(r)))
					.collect())
			}
		}
	}

	pub async fn fetch_optional(
		&self,
		sql: &str,
		params: &[SqlParam],
	) -> StoreResult<Option<DbRow>> {
		match &self.pool {
			Pool::Sqlite(pool) => {
				let q = bind_params!(sqlx::query(sql), params);
				Ok(q.fetch_optional(pool)
					.await?
					.map(|r| DbRow(RowInner::Sqlite(r))))
			}
			Pool::Postgres(pool) => {
				let q = bind_params!(sqlx::query(sql), params);
				Ok(q.fetch_optional(pool)
					.await?
					.map(|r| DbRow(RowInner::Postgres(r))))
			}
		}
	}

	/// Begin a transaction. Batched loader flushes commit raw events,
	/// session summaries and snapshots atomically through one of these.
	pub async fn begin(&self) -> StoreResult<StoreTransaction<'_>> {
		match &self.pool {
			Pool::Sqlite(pool) => Ok(StoreTransaction {
				inner: TxInner::Sqlite(pool.begin().await?),
				dialect: self.dialect,
			}),
			Pool::Postgres(pool) => Ok(StoreTransaction {
				inner: TxInner::Postgres(pool.begin().await?),
				dialect: self.dialect,
			}),
		}
	}

	/// Execute a statement without preparing it. Utility commands such as
	/// `VACUUM` refuse to run in the prepared/transactional path on the
	/// server engine.
	pub async fn execute_unprepared(&self, sql: &str) -> StoreResult<()> {
		use sqlx::Executor;
		match &self.pool {
			Pool::Sqlite(pool) => {
				pool.execute(sql).await?;
			}
			Pool::Postgres(pool) => {
				pool.execute(sql).await?;
			}
		}
		Ok(())
	}

	/// Lightweight connectivity probe.
	pub async fn ping(&self) -> StoreResult<()> {
		self.execute("SELECT 1", &[]).await?;
		Ok(())
	}

	pub async fn close(&self) {
		match &self.pool {
			Pool::Sqlite(pool) => pool.close().await,
			Pool::Postgres(pool) => pool.close().await,
		}
	}
}

enum TxInner<'c> {
	Sqlite(sqlx::Transaction<'c, sqlx::Sqlite>),
	Postgres(sqlx::Transaction<'c, sqlx::Postgres>),
}

/// An open transaction sharing the statement helpers of [`Store`].
pub struct StoreTransaction<'c> {
	inner: TxInner<'c>,
	dialect: Dialect,
}

impl StoreTransaction<'_> {
	pub fn dialect(&self) -> Dialect {
		self.dialect
	}

	pub async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> StoreResult<u64> {
		match &mut self.inner {
			TxInner::Sqlite(tx) => {
				let q = bind_params!(sqlx::query(sql), params);
				Ok(q.execute(&mut **tx).await?.rows_affected())
			}
			TxInner::Postgres(tx) => {
				let q = bind_params!(sqlx::query(sql), params);
				Ok(q.execute(&mut **tx).await?.rows_affected())
			}
		}
	}

	pub async fn fetch_all(&mut self, sql: &str, params: &[SqlParam]) -> StoreResult<Vec<DbRow>> {
		match &mut self.inner {
			TxInner::Sqlite(tx) => {
				let q = bind_params!(sqlx::query(sql), params);
				Ok(q.fetch_all(&mut **tx)
					.await?
					.into_iter()
					.map(|r| DbRow(RowInner::Sqlite(r)))
					.collect())
			}
			TxInner::Postgres(tx) => {
				let q = bind_params!(sqlx::query(sql), params);
				Ok(q.fetch_all(&mut **tx)
					.await?
					.into_iter()
					.map(|r| DbRow(RowInner::Postgres(r)))
					.collect())
			}
		}
	}

	pub async fn fetch_optional(
		&mut self,
		sql: &str,
		params: &[SqlParam],
	) -> StoreResult<Option<DbRow>> {
		match &mut self.inner {
			TxInner::Sqlite(tx) => {
				let q = bind_params!(sqlx::query(sql), params);
				Ok(q.fetch_optional(&mut **tx)
					.await?
					.map(|r| DbRow(RowInner::Sqlite(r))))
			}
			TxInner::Postgres(tx) => {
				let q = bind_params!(sqlx::query(sql), params);
				Ok(q.fetch_optional(&mut **tx)
					.await?
					.map(|r| DbRow(RowInner::Postgres(r))))
			}
		}
	}

	pub async fn commit(self) -> StoreResult<()> {
		match self.inner {
			TxInner::Sqlite(tx) => tx.commit().await?,
			TxInner::Postgres(tx) => tx.commit().await?,
		}
		Ok(())
	}

	pub async fn rollback(self) -> StoreResult<()> {
		match self.inner {
			TxInner::Sqlite(tx) => tx.rollback().await?,
			TxInner::Postgres(tx) => tx.rollback().await?,
		}
		Ok(())
	}
}

/// Build a `VALUES` placeholder block: `rows` tuples of `cols` placeholders,
/// numbered from `start` upward. Used by the batched UPSERTs.
pub fn values_placeholders(start: usize, rows: usize, cols: usize) -> String {
	let mut out = String::new();
	let mut n = start;
	for row in 0..rows {
		if row > 0 {
			out.push_str(", ");
		}
		out.push('(');
		for col in 0..cols {
			if col > 0 {
				out.push_str(", ");
			}
			out.push_str(&format!("${}", n));
			n += 1;
		}
		out.push(')');
	}
	out
}

/// True when the error is a uniqueness/integrity violation; the loaders use
/// this to fall back from batched inserts to per-row inserts.
pub fn is_unique_violation(err: &StoreError) -> bool {
	match err {
		StoreError::Sqlx(sqlx::Error::Database(db)) => db.is_unique_violation(),
		_ => false,
	}
}

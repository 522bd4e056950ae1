//! `mimir` — command-line front-end over the ingestion and enrichment core.
//!
//! Exit codes: 0 on success, 1 on operational failure, 2 on argument
//! validation failure (clap's default).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::error;

use vanopticon_mimir::config::{self, Settings};
use vanopticon_mimir::db::{maintenance, migrations, Store};
use vanopticon_mimir::dlq::DeadLetterQueue;
use vanopticon_mimir::enrich::ssh_keys;
use vanopticon_mimir::enrich::{EnrichmentService, HybridCache, SessionEnricher};
use vanopticon_mimir::ipclass::IpClassifier;
use vanopticon_mimir::loader::bulk::BulkLoader;
use vanopticon_mimir::loader::delta::DeltaLoader;
use vanopticon_mimir::loader::LoaderCallbacks;
use vanopticon_mimir::status::StatusEmitter;

#[derive(Parser)]
#[command(name = "mimir", version, about = "Honeypot telemetry ingestion and enrichment")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Ingest honeypot log files
	Ingest {
		#[command(subcommand)]
		mode: IngestMode,
	},
	/// Database maintenance
	Db {
		#[command(subcommand)]
		op: DbOp,
	},
	/// Classify a single IP address
	ClassifyIp {
		ip: String,
		#[arg(long)]
		asn: Option<i64>,
		#[arg(long)]
		as_name: Option<String>,
	},
	/// Dead-letter queue operations
	Dlq {
		#[command(subcommand)]
		op: DlqOp,
	},
	/// SSH key extraction over stored events
	SshKeys {
		#[command(subcommand)]
		op: SshKeysOp,
	},
	/// Enrichment cache operations
	Cache {
		#[command(subcommand)]
		op: CacheOp,
	},
}

#[derive(Subcommand)]
enum IngestMode {
	/// Full-file batch ingestion
	Bulk {
		/// Log files (plain, .gz or .bz2)
		#[arg(required = true)]
		paths: Vec<PathBuf>,
		/// Correlation id stamped on every event (random if omitted)
		#[arg(long)]
		ingest_id: Option<String>,
		/// Resolve session enrichment flags during flushes
		#[arg(long)]
		enrich: bool,
	},
	/// Cursor-tracked incremental ingestion
	Delta {
		#[arg(required = true)]
		paths: Vec<PathBuf>,
		#[arg(long)]
		ingest_id: Option<String>,
		#[arg(long)]
		enrich: bool,
	},
}

#[derive(Subcommand)]
enum DbOp {
	/// Apply pending schema migrations
	Migrate,
	/// Reclaim storage space
	Vacuum,
	/// Check schema version and table integrity
	Verify,
	/// Retroactively strip control characters from stored rows
	Sanitize {
		#[arg(long)]
		dry_run: bool,
	},
}

#[derive(Subcommand)]
enum DlqOp {
	/// Reprocess unresolved dead-letter events
	Replay {
		#[arg(long, default_value_t = 100)]
		limit: i64,
		#[arg(long, default_value_t = 30)]
		lock_ttl_minutes: i64,
	},
}

#[derive(Subcommand)]
enum SshKeysOp {
	/// Recompute per-session SSH key aggregates from stored events
	Backfill,
	/// Dump unique injected keys as JSON lines
	Export {
		#[arg(long)]
		output: Option<PathBuf>,
	},
}

#[derive(Subcommand)]
enum CacheOp {
	/// Delete expired L2 cache rows
	Cleanup {
		#[arg(long)]
		dry_run: bool,
	},
}

fn main() -> ExitCode {
	let cli = Cli::parse();
	let runtime = match tokio::runtime::Runtime::new() {
		Ok(rt) => rt,
		Err(e) => {
			eprintln!("failed to start runtime: {e}");
			return ExitCode::FAILURE;
		}
	};
	match runtime.block_on(run(cli)) {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			error!(error = %e, "command failed");
			eprintln!("error: {e:#}");
			ExitCode::FAILURE
		}
	}
}

async fn run(cli: Cli) -> anyhow::Result<()> {
	let settings = config::load().unwrap_or_else(|e| {
		eprintln!("warning: failed to load config: {e}; using defaults");
		Settings::default()
	});
	let _ = vanopticon_mimir::observability::init_logging(&settings.log_level);

	let store = Arc::new(
		Store::connect(&settings.database_url)
			.await
			.with_context(|| format!("connect to {}", settings.database_url))?,
	);

	match cli.command {
		Command::Ingest { mode } => {
			migrations::migrate(&store).await?;
			match mode {
				IngestMode::Bulk {
					paths,
					ingest_id,
					enrich,
				} => ingest(&settings, &store, paths, ingest_id, enrich, "bulk").await?,
				IngestMode::Delta {
					paths,
					ingest_id,
					enrich,
				} => ingest(&settings, &store, paths, ingest_id, enrich, "delta").await?,
			}
		}
		Command::Db { op } => match op {
			DbOp::Migrate => {
				let version = migrations::migrate(&store).await?;
				println!("schema at version {version}");
			}
			DbOp::Vacuum => {
				maintenance::vacuum(&store).await?;
				println!("vacuum complete");
			}
			DbOp::Verify => {
				store.ping().await?;
				let problems = migrations::verify(&store).await?;
				for (table, count) in maintenance::table_counts(&store).await? {
					println!("{table}: {count} rows");
				}
				if problems.is_empty() {
					println!("schema ok");
				} else {
					for problem in &problems {
						eprintln!("problem: {problem}");
					}
					anyhow::bail!("schema verification failed ({} problems)", problems.len());
				}
			}
			DbOp::Sanitize { dry_run } => {
				let report = maintenance::sanitize_existing(&store, dry_run).await?;
				println!(
					"raw events: {}/{} updated; summaries: {}/{} updated{}",
					report.raw_events_updated,
					report.raw_events_scanned,
					report.summaries_updated,
					report.summaries_scanned,
					if dry_run { " (dry run)" } else { "" }
				);
			}
		},
		Command::ClassifyIp { ip, asn, as_name } => {
			let cache = Arc::new(HybridCache::new(
				settings.hybrid_cache_config(),
				Some(store.clone()),
			));
			let mut classifier = IpClassifier::new(settings.classifier_config(), cache)?;
			let verdict = classifier.classify(&ip, asn, as_name.as_deref()).await?;
			println!("{}", serde_json::to_string_pretty(&verdict)?);
		}
		Command::Dlq { op } => match op {
			DlqOp::Replay {
				limit,
				lock_ttl_minutes,
			} => {
				let queue = DeadLetterQueue::new(&store);
				let processor = settings.bulk_loader_config().processor;
				let outcome = queue.replay(&processor, limit, lock_ttl_minutes).await?;
				let backlog = queue.unresolved_count().await?;
				println!(
					"resolved {}, failed {}, locked {}; {} unresolved remaining",
					outcome.resolved, outcome.failed, outcome.locked, backlog
				);
			}
		},
		Command::SshKeys { op } => match op {
			SshKeysOp::Backfill => {
				let report = ssh_keys::backfill_session_keys(&store).await?;
				println!(
					"scanned {} events, found {} injections, updated {} sessions",
					report.events_scanned, report.injections_found, report.sessions_updated
				);
			}
			SshKeysOp::Export { output } => {
				let keys = ssh_keys::export_unique_keys(&store).await?;
				let mut lines = String::new();
				for key in &keys {
					lines.push_str(&key.to_string());
					lines.push('\n');
				}
				match output {
					Some(path) => std::fs::write(&path, lines)
						.with_context(|| format!("write {}", path.display()))?,
					None => print!("{lines}"),
				}
				eprintln!("exported {} unique keys", keys.len());
			}
		},
		Command::Cache { op } => match op {
			CacheOp::Cleanup { dry_run } => {
				let cache = HybridCache::new(settings.hybrid_cache_config(), Some(store.clone()));
				let count = cache.cleanup_expired(dry_run).await?;
				if dry_run {
					println!("{count} expired entries would be deleted");
				} else {
					println!("deleted {count} expired entries");
				}
			}
		},
	}

	store.close().await;
	Ok(())
}

async fn ingest(
	settings: &Settings,
	store: &Arc<Store>,
	paths: Vec<PathBuf>,
	ingest_id: Option<String>,
	enrich: bool,
	phase: &str,
) -> anyhow::Result<()> {
	let emitter = StatusEmitter::new(phase, &settings.status_dir)
		.with_context(|| format!("create status dir {}", settings.status_dir.display()))?;

	// Enrichment is opt-in at the CLI: it spends rate-limit tokens and
	// network time during flushes.
	let enricher: Option<EnrichmentService> = if enrich {
		let cache = Arc::new(HybridCache::new(
			settings.hybrid_cache_config(),
			Some(store.clone()),
		));
		let classifier = IpClassifier::new(settings.classifier_config(), cache.clone())?;
		Some(EnrichmentService::new(
			settings.enrichment_config(),
			cache,
			Some(classifier),
		)?)
	} else {
		None
	};

	let telemetry = |metrics: &vanopticon_mimir::loader::LoaderMetrics| {
		emitter.record_metrics(metrics);
	};
	let checkpoint = |checkpoint: &vanopticon_mimir::loader::LoaderCheckpoint| {
		emitter.record_checkpoint(checkpoint);
	};
	let dead_letter = |count: u64, reason: Option<&str>, source: Option<&str>| {
		emitter.record_dead_letters(count, reason, source);
	};
	let callbacks = LoaderCallbacks {
		telemetry: Some(&telemetry),
		checkpoint: Some(&checkpoint),
		dead_letter: Some(&dead_letter),
	};

	// Ctrl-C lets the in-flight flush commit, then the pipeline exits; the
	// cursor only ever reflects committed work.
	let cancel = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
	{
		let cancel = cancel.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				eprintln!("interrupt received; finishing the current batch");
				cancel.store(true, std::sync::atomic::Ordering::Relaxed);
			}
		});
	}

	let metrics = match phase {
		"bulk" => {
			let mut loader =
				BulkLoader::new(store, settings.bulk_loader_config()).with_cancel_flag(cancel);
			if let Some(service) = enricher.as_ref() {
				loader = loader.with_enricher(service as &dyn SessionEnricher);
			}
			loader.load_paths(&paths, ingest_id, &callbacks).await?
		}
		_ => {
			let mut loader =
				DeltaLoader::new(store, settings.delta_loader_config()).with_cancel_flag(cancel);
			if let Some(service) = enricher.as_ref() {
				loader = loader.with_enricher(service as &dyn SessionEnricher);
			}
			loader.load_paths(&paths, ingest_id, &callbacks).await?
		}
	};

	if let Some(service) = enricher.as_ref() {
		emitter.record_extra("cache", service.cache().stats.snapshot());
		emitter.record_extra("provider_errors", service.error_counts());
	}

	println!(
		"{phase}: read {} events from {} files; inserted {}, duplicates {}, quarantined {}, invalid {}, dead letters {} ({} batches, {:.2}s)",
		metrics.events_read,
		metrics.files_processed,
		metrics.events_inserted,
		metrics.duplicates_skipped,
		metrics.events_quarantined,
		metrics.events_invalid,
		metrics.dead_letters,
		metrics.batches_committed,
		metrics.duration_seconds,
	);
	Ok(())
}

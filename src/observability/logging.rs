use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured logging to stderr with contextual span fields.
///
/// The level comes from `RUST_LOG` (or the provided default). Loader and
/// enrichment hot paths are wrapped in named spans (`mimir.delta.load`,
/// `mimir.delta.flush`, `mimir.enrich.session`) so per-operation timing is
/// visible without extra plumbing.
pub fn init_logging(default_level: &str) -> anyhow::Result<()> {
	let env_filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(default_level))
		.unwrap_or_else(|_| EnvFilter::new("info"));

	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_writer(std::io::stderr)
		.with_target(true)
		.with_level(true);

	tracing_subscriber::registry()
		.with(env_filter)
		.with(fmt_layer)
		.try_init()
		.map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

	Ok(())
}

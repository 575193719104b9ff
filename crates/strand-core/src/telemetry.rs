use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Install the process-wide tracing subscriber. Safe to call repeatedly;
/// only the first call takes effect. Filtering follows `STRAND_LOG`, falling
/// back to `RUST_LOG`, falling back to `info`.
pub fn setup_logging() {
	static ONCE: Once = Once::new();
	ONCE.call_once(|| {
		let filter = std::env::var("STRAND_LOG")
			.map(EnvFilter::new)
			.or_else(|_| EnvFilter::try_from_default_env())
			.unwrap_or_else(|_| EnvFilter::new("info"));
		let _ = tracing_subscriber::fmt()
			.with_env_filter(filter)
			.with_writer(std::io::stderr)
			.try_init();
	});
}

// vim: noet

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

fn default_level(debug: bool) -> LevelFilter
{
	if debug {
		LevelFilter::DEBUG
	} else {
		LevelFilter::INFO
	}
}

/// Log to stderr so the device listing and prompts on stdout stay readable. `RUST_LOG` takes
/// precedence over the debug flag.
pub fn init(debug: bool)
{
	let filter = EnvFilter::builder()
		.with_default_directive(default_level(debug).into())
		.from_env_lossy();

	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.with_target(false)
		.init();
}

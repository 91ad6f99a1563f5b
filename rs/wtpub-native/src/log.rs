use serde_with::{DisplayFromStr, serde_as};
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Logging configuration, shared by every binary.
#[serde_as]
#[derive(Clone, Debug, clap::Args, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct Log {
	/// The minimum level to log, unless overridden by `RUST_LOG`.
	#[arg(id = "log-level", long = "log-level", default_value = "info", env = "WTPUB_LOG_LEVEL")]
	#[serde_as(as = "DisplayFromStr")]
	pub level: Level,
}

impl Default for Log {
	fn default() -> Self {
		Self { level: Level::INFO }
	}
}

impl Log {
	pub fn new(level: Level) -> Self {
		Self { level }
	}

	/// Install the global subscriber, writing to stderr.
	///
	/// Does nothing if a subscriber was already installed.
	pub fn init(&self) {
		let filter = EnvFilter::builder()
			.with_default_directive(LevelFilter::from_level(self.level).into())
			.from_env_lossy();

		let _ = tracing_subscriber::fmt()
			.with_env_filter(filter)
			.with_writer(std::io::stderr)
			.try_init();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::Parser;

	#[derive(clap::Parser)]
	struct Cli {
		#[command(flatten)]
		log: Log,
	}

	#[test]
	fn level_from_cli() {
		let cli = Cli::parse_from(["test", "--log-level", "debug"]);
		assert_eq!(cli.log.level, Level::DEBUG);

		let cli = Cli::parse_from(["test"]);
		assert_eq!(cli.log.level, Level::INFO);
	}

	#[test]
	fn level_from_toml() {
		let log: Log = toml::from_str(r#"level = "warn""#).unwrap();
		assert_eq!(log.level, Level::WARN);
		assert_eq!(toml::from_str::<Log>("").unwrap().level, Level::INFO);
	}
}

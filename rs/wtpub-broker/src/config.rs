use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Clone, Debug, Serialize, Deserialize, Default)]
#[command(version, about = "Publish/subscribe broker over WebTransport")]
#[serde(deny_unknown_fields, default)]
#[non_exhaustive]
pub struct Config {
	/// The QUIC/TLS configuration for the server.
	#[command(flatten)]
	pub server: wtpub_native::ServerConfig,

	/// Log configuration. Only settable on the command line or via the environment.
	#[command(flatten)]
	#[serde(skip)]
	pub log: wtpub_native::Log,

	/// Broker behaviour.
	#[command(flatten)]
	pub broker: BrokerConfig,

	/// Load the rest of the configuration from this TOML file.
	/// Command line arguments and environment variables take precedence.
	#[arg(long = "config", env = "WTPUB_BROKER_CONFIG")]
	#[serde(skip)]
	pub file: Option<PathBuf>,
}

#[derive(clap::Args, Clone, Debug, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
#[non_exhaustive]
pub struct BrokerConfig {
	/// The permission file listing topics and who may use them.
	/// Without one, no topics exist and every session is refused.
	#[arg(long = "permissions", env = "WTPUB_BROKER_PERMISSIONS")]
	#[serde(skip_serializing_if = "Option::is_none")]
	pub permissions: Option<PathBuf>,

	/// The deflate window, as a power of two between 9 and 15.
	/// Defaults to 15 if not provided.
	#[arg(long = "window-bits", env = "WTPUB_BROKER_WINDOW_BITS")]
	#[serde(skip_serializing_if = "Option::is_none")]
	pub window_bits: Option<u8>,

	/// How long to wait for each session to wind down on shutdown.
	/// Defaults to 5s if not provided.
	#[arg(
		long = "finish-timeout",
		value_parser = humantime::parse_duration,
		env = "WTPUB_BROKER_FINISH_TIMEOUT"
	)]
	#[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
	pub finish_timeout: Option<Duration>,
}

impl BrokerConfig {
	pub const DEFAULT_WINDOW_BITS: u8 = 15;
	pub const DEFAULT_FINISH_TIMEOUT: Duration = Duration::from_secs(5);
}

impl Config {
	pub fn load() -> anyhow::Result<Self> {
		Self::load_from(std::env::args_os())
	}

	/// Parse the arguments, then layer them over the config file if one was given.
	pub fn load_from<I, T>(args: I) -> anyhow::Result<Self>
	where
		I: IntoIterator<Item = T>,
		T: Into<OsString> + Clone,
	{
		let args: Vec<T> = args.into_iter().collect();
		let config = Self::try_parse_from(args.clone())?;

		let Some(file) = config.file.clone() else {
			return Ok(config);
		};

		let contents = std::fs::read_to_string(&file).with_context(|| format!("failed to read {}", file.display()))?;
		let mut config: Self = toml::from_str(&contents).with_context(|| format!("failed to parse {}", file.display()))?;

		// Arguments win over the file.
		config.try_update_from(args)?;

		Ok(config)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn arguments_only() {
		let config = Config::load_from([
			"wtpub-broker",
			"--listen",
			"127.0.0.1:4443",
			"--tls-generate",
			"localhost",
			"--window-bits",
			"12",
			"--log-level",
			"debug",
		])
		.unwrap();

		assert_eq!(config.server.bind, Some("127.0.0.1:4443".parse().unwrap()));
		assert_eq!(config.server.tls.generate, vec!["localhost".to_string()]);
		assert_eq!(config.broker.window_bits, Some(12));
		assert_eq!(config.broker.finish_timeout, None);
		assert_eq!(config.log.level, tracing::Level::DEBUG);
	}

	#[test]
	fn file_then_arguments() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(
			br#"
				[server]
				listen = "127.0.0.1:4443"
				idle_timeout = "1m"

				[server.tls]
				generate = ["localhost"]

				[broker]
				permissions = "permissions.toml"
				window_bits = 10
				finish_timeout = "2s"
			"#,
		)
		.unwrap();

		let path = file.path().to_str().unwrap();
		let config = Config::load_from(["wtpub-broker", "--config", path, "--window-bits", "11"]).unwrap();

		assert_eq!(config.server.bind, Some("127.0.0.1:4443".parse().unwrap()));
		assert_eq!(config.server.idle_timeout, Some(Duration::from_secs(60)));
		assert_eq!(config.server.tls.generate, vec!["localhost".to_string()]);
		assert_eq!(config.broker.permissions, Some(PathBuf::from("permissions.toml")));
		assert_eq!(config.broker.finish_timeout, Some(Duration::from_secs(2)));
		assert_eq!(config.file.as_deref(), Some(file.path()));

		// The argument overrides the file.
		assert_eq!(config.broker.window_bits, Some(11));
	}

	#[test]
	fn unknown_field() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(b"[broker]\nwindow = 10\n").unwrap();

		let path = file.path().to_str().unwrap();
		assert!(Config::load_from(["wtpub-broker", "--config", path]).is_err());
	}
}

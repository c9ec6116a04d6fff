//! Proxy server configuration handling
//!
//! The burrow proxy server currently accepts the following configuration
//! options:
//!
//! - `hostname` - IP address to bind the listening socket to. **Default
//!   `127.0.0.1`**.
//! - `port` - TCP port to listen on. **Default `8899`**.
//! - `num-workers` - Number of worker threads (one single-threaded event
//!   loop each). **Default \[logical CPU count\]**.
//! - `backlog` - Listening socket backlog. **Default `128`**.
//! - `client-recvbuf-size` / `server-recvbuf-size` - Per-connection buffer
//!   caps in bytes for the client and upstream side. **Default `65536`**.
//! - `max-concurrent-connections` - Cap on simultaneously open client
//!   connections. **Default `1024`**.
//! - `timeout` - Idle timeout in seconds (no bytes in either direction).
//!   **Default `30`**.
//! - `connect-timeout` - Upstream connect timeout in seconds. **Default
//!   `10`**.
//! - `shutdown-grace` - Seconds granted to in-flight connections on
//!   graceful shutdown. **Default `10`**.
//! - `ca-cert-file` / `ca-key-file` - CA certificate and private key (PEM).
//!   Setting both enables TLS interception. **Default unset**.
//! - `ca-signing-key-file` - Dedicated private key reused for every minted
//!   leaf certificate. **Default unset** (a fresh key per hostname).
//! - `ca-cert-dir` - Directory mirroring minted leaf certificates across
//!   restarts. **Default unset**.
//! - `cert-validity-days` - Validity window of minted leafs. **Default
//!   `365`**.
//! - `tls-intercept-hosts` - Hosts whose CONNECT tunnels are intercepted;
//!   an empty list intercepts all. **Default empty**.
//! - `tls-insecure-upstream` - Disable upstream certificate validation
//!   (testing only). **Default `false`**.
//! - `plugins` - Ordered list of plugin identifiers (`name` or
//!   `name:args`). **Default empty**.
//! - `pid-file` - File the server writes its PID into. **Default unset**.
//! - `log-level` - Tracing log level: `trace`, `debug`, `verbose`, `info`,
//!   `warn`, `error`. **Default `info`**.
//! - `log-file` - Log destination; reopened on `SIGUSR1`. **Default
//!   stdout**.
//! - `disable-http-proxy` - Route non-CONNECT requests as raw tunnels
//!   instead of parsing them. **Default `false`**.
//! - `enable-web-server` - Serve origin-form requests with the embedded
//!   web collaborator instead of rejecting them. **Default `false`**.
//! - `basic-auth` - `user:password` credentials required in
//!   `Proxy-Authorization`. **Default unset**.
//! - `upstream-proxy` - `host:port` of a parent proxy to chain through.
//!   **Default unset** (connect to origins directly).
//! - `via` - Pseudonym appended as a `Via` header on forwarded requests.
//!   **Default unset** (no `Via` header).

mod global;
mod partial;

use serde::{Deserialize, Serialize};
use strum::{Display as EnumDisplay, EnumString};
use tracing::Level;

pub use self::{
	global::{Config, ConfigValidateError, Tuning},
	partial::{IntoPartialError, Partial},
};

/// Log level, corresponding roughly to `tracing`'s, but with the addition
/// of [`Verbose`][`LogLevel::Verbose`] between debug and info.
#[derive(
	Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, EnumDisplay,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogLevel {
	/// Lowest log level. Log everything, including very verbose debug/trace
	/// info. May expose private/secret information in logs.
	Trace,
	/// Log most things, including more verbose debug info. May expose
	/// private/secret information in logs.
	Debug,
	/// Logs more verbose information (`debug`-level or higher) from burrow,
	/// while only logging `info`-level or higher information from
	/// dependencies. May expose private/secret information in logs.
	Verbose,
	/// Recommended log level. Logs general information, warnings, and
	/// errors.
	#[default]
	Info,
	/// Log only warnings and errors. Generally not recommended, as this
	/// hides a lot of useful information from logs.
	Warn,
	/// Log only critical errors. Generally not recommended, as this hides a
	/// lot of useful information from logs.
	Error,
}

impl From<LogLevel> for Level {
	fn from(log_level: LogLevel) -> Self {
		match log_level {
			LogLevel::Trace => Self::TRACE,
			LogLevel::Debug => Self::DEBUG,
			LogLevel::Verbose | LogLevel::Info => Self::INFO,
			LogLevel::Warn => Self::WARN,
			LogLevel::Error => Self::ERROR,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn log_level() {
		assert_eq!("verbose".parse(), Ok(LogLevel::Verbose));
		assert_eq!("info".parse(), Ok(LogLevel::Info));
		assert_eq!("warn".parse(), Ok(LogLevel::Warn));

		assert_eq!("info".parse::<LogLevel>().map(Into::into), Ok(Level::INFO));
		assert_eq!(
			"verbose".parse::<LogLevel>().map(Into::into),
			Ok(Level::INFO)
		);
		assert_eq!(
			"error".parse::<LogLevel>().map(Into::into),
			Ok(Level::ERROR)
		);
	}
}

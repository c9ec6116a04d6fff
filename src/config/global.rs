//! Global proxy server configuration.

use std::{
	fmt::{Display, Formatter, Result as FmtResult},
	net::IpAddr,
	num::NonZeroUsize,
	path::PathBuf,
	thread,
	time::Duration,
};

use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use super::{partial::Partial, LogLevel};
use crate::http::{parse_authority, Authority, Limits, ParseError};

/// The error returned when derived settings can not be built from the
/// current configuration values
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidateError {
	/// The `upstream-proxy` option is not a valid `host:port` authority
	#[error("invalid upstream-proxy address: {0}")]
	UpstreamProxy(#[source] ParseError),
	/// The `basic-auth` option is not of the form `user:password`
	#[error("basic-auth must be of the form user:password")]
	BasicAuth,
}

/// Global configuration for the burrow proxy server. This is the more
/// idiomatic, easier to use (in rust code), and shareable-across-threads
/// version, which can be updated from a [`Partial`].
#[derive(Debug)]
pub struct Config {
	inner: RwLock<ConfigInner>,
	file: Option<PathBuf>,
}

impl Config {
	/// Create a new `Config` instance using the provided file path as the
	/// configuration file. Configuration data is parsed from environment
	/// variables, the config file, and command-line arguments, in that
	/// order. If there is an error with the configuration file or any other
	/// configuration source, no error is emitted. Instead, a warning is
	/// logged, and the other configuration sources are used.
	///
	/// # IO
	/// This function performs synchronous file IO, and should therefore not
	/// be used inside of an asynchronous context.
	#[must_use]
	pub fn new(file: Option<PathBuf>) -> Self {
		let config = Self {
			inner: RwLock::new(ConfigInner::default()),
			file,
		};
		config.update();
		config
	}

	/// Create a new static reference to a new `Config` instance using the
	/// provided file path as the configuration file.
	///
	/// # Memory
	/// Because this function leaks memory with no (safe) way of freeing it,
	/// care should be taken not to call this function an unbounded number
	/// of times.
	///
	/// # IO
	/// This function performs synchronous file IO, and should therefore not
	/// be used inside of an asynchronous context.
	#[must_use]
	pub fn new_static(file: Option<PathBuf>) -> &'static Self {
		Box::leak(Box::new(Self::new(file)))
	}

	/// Update this config from environment variables, config file, and
	/// command-line arguments. This function starts with defaults for each
	/// option, then updates those from environment variables, then from the
	/// config file, then from command-line arguments, and finally
	/// overwrites this `Config`'s options with those newly-parsed ones.
	///
	/// # IO
	/// This function performs synchronous file IO, and should therefore not
	/// be used inside of an asynchronous context.
	#[instrument(level = "info", skip(self))]
	pub fn update(&self) {
		let mut config = ConfigInner::default();

		config.update_from_partial(&Partial::from_env_vars());

		if let Some(ref file) = self.file {
			match Partial::from_file(file) {
				Ok(partial) => config.update_from_partial(&partial),
				Err(err) => warn!("Could not read configuration from file: {err}"),
			}
		}

		config.update_from_partial(&Partial::from_args());

		debug!(new_config = ?config, "Configuration reloaded");

		*self.inner.write() = config;
	}

	/// Build the per-connection tuning snapshot from the current
	/// configuration values.
	///
	/// # Errors
	/// Returns an error if `upstream-proxy` or `basic-auth` are present but
	/// unparseable.
	pub fn tuning(&self) -> Result<Tuning, ConfigValidateError> {
		let inner = self.inner.read();

		let upstream_proxy = inner
			.upstream_proxy
			.as_deref()
			.map(|addr| parse_authority(addr, 8899).map_err(ConfigValidateError::UpstreamProxy))
			.transpose()?;

		if let Some(ref auth) = inner.basic_auth {
			if !auth.contains(':') {
				return Err(ConfigValidateError::BasicAuth);
			}
		}

		Ok(Tuning {
			limits: Limits::default(),
			client_recvbuf: inner.client_recvbuf_size,
			server_recvbuf: inner.server_recvbuf_size,
			idle_timeout: Duration::from_secs(inner.timeout),
			connect_timeout: Duration::from_secs(inner.connect_timeout),
			basic_auth: inner.basic_auth.clone(),
			via: inner.via.clone(),
			disable_http_proxy: inner.disable_http_proxy,
			upstream_proxy,
		})
	}

	/// Get the address to bind the listening socket to
	#[must_use]
	pub fn hostname(&self) -> IpAddr {
		self.inner.read().hostname
	}

	/// Get the port to listen on
	#[must_use]
	pub fn port(&self) -> u16 {
		self.inner.read().port
	}

	/// Get the number of worker threads
	#[must_use]
	pub fn num_workers(&self) -> usize {
		self.inner.read().num_workers
	}

	/// Get the listening socket backlog
	#[must_use]
	pub fn backlog(&self) -> u32 {
		self.inner.read().backlog
	}

	/// Get the cap on simultaneously open client connections
	#[must_use]
	pub fn max_concurrent_connections(&self) -> usize {
		self.inner.read().max_concurrent_connections
	}

	/// Get the grace period granted to in-flight connections on shutdown
	#[must_use]
	pub fn shutdown_grace(&self) -> Duration {
		Duration::from_secs(self.inner.read().shutdown_grace)
	}

	/// Get the CA certificate file path, if TLS interception is configured
	#[must_use]
	pub fn ca_cert_file(&self) -> Option<PathBuf> {
		self.inner.read().ca_cert_file.clone()
	}

	/// Get the CA private key file path, if TLS interception is configured
	#[must_use]
	pub fn ca_key_file(&self) -> Option<PathBuf> {
		self.inner.read().ca_key_file.clone()
	}

	/// Get the dedicated leaf signing key file path
	#[must_use]
	pub fn ca_signing_key_file(&self) -> Option<PathBuf> {
		self.inner.read().ca_signing_key_file.clone()
	}

	/// Get the leaf certificate mirror directory
	#[must_use]
	pub fn ca_cert_dir(&self) -> Option<PathBuf> {
		self.inner.read().ca_cert_dir.clone()
	}

	/// Get the validity window of minted leaf certificates, in days
	#[must_use]
	pub fn cert_validity_days(&self) -> u32 {
		self.inner.read().cert_validity_days
	}

	/// Get the list of hosts whose CONNECT tunnels are intercepted (empty =
	/// all hosts)
	#[must_use]
	pub fn tls_intercept_hosts(&self) -> Vec<String> {
		self.inner.read().tls_intercept_hosts.clone()
	}

	/// Get whether upstream certificate validation is disabled
	#[must_use]
	pub fn tls_insecure_upstream(&self) -> bool {
		self.inner.read().tls_insecure_upstream
	}

	/// Get the ordered plugin identifiers
	#[must_use]
	pub fn plugins(&self) -> Vec<String> {
		self.inner.read().plugins.clone()
	}

	/// Get the PID file path
	#[must_use]
	pub fn pid_file(&self) -> Option<PathBuf> {
		self.inner.read().pid_file.clone()
	}

	/// Get the configured log level
	#[must_use]
	pub fn log_level(&self) -> LogLevel {
		self.inner.read().log_level
	}

	/// Get the log file path (`None` logs to stdout)
	#[must_use]
	pub fn log_file(&self) -> Option<PathBuf> {
		self.inner.read().log_file.clone()
	}

	/// Get whether the embedded web server handles origin-form requests
	#[must_use]
	pub fn enable_web_server(&self) -> bool {
		self.inner.read().enable_web_server
	}

	/// Get the configuration file path
	#[must_use]
	pub const fn file(&self) -> &Option<PathBuf> {
		&self.file
	}
}

impl Display for Config {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		let inner = self.inner.read();

		fmt.debug_struct("Config")
			.field("hostname", &inner.hostname)
			.field("port", &inner.port)
			.field("num_workers", &inner.num_workers)
			.field("backlog", &inner.backlog)
			.field("client_recvbuf_size", &inner.client_recvbuf_size)
			.field("server_recvbuf_size", &inner.server_recvbuf_size)
			.field(
				"max_concurrent_connections",
				&inner.max_concurrent_connections,
			)
			.field("timeout", &inner.timeout)
			.field("connect_timeout", &inner.connect_timeout)
			.field("shutdown_grace", &inner.shutdown_grace)
			.field("ca_cert_file", &inner.ca_cert_file)
			.field("ca_key_file", &inner.ca_key_file.as_ref().map(|_| "[set]"))
			.field(
				"ca_signing_key_file",
				&inner.ca_signing_key_file.as_ref().map(|_| "[set]"),
			)
			.field("ca_cert_dir", &inner.ca_cert_dir)
			.field("cert_validity_days", &inner.cert_validity_days)
			.field("tls_intercept_hosts", &inner.tls_intercept_hosts)
			.field("tls_insecure_upstream", &inner.tls_insecure_upstream)
			.field("plugins", &inner.plugins)
			.field("pid_file", &inner.pid_file)
			.field("log_level", &inner.log_level.to_string())
			.field("log_file", &inner.log_file)
			.field("disable_http_proxy", &inner.disable_http_proxy)
			.field("enable_web_server", &inner.enable_web_server)
			.field(
				"basic_auth",
				&inner.basic_auth.as_ref().map(|_| "[REDACTED]"),
			)
			.field("upstream_proxy", &inner.upstream_proxy)
			.field("via", &inner.via)
			.field("file", &self.file)
			.finish()
	}
}

/// Actual configuration storage inside of a [`Config`]
#[derive(Debug, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
struct ConfigInner {
	/// IP address the listening socket binds to
	pub hostname: IpAddr,
	/// TCP port the listening socket binds to
	pub port: u16,
	/// Number of worker threads, each hosting one event loop
	pub num_workers: usize,
	/// Listening socket backlog
	pub backlog: u32,
	/// Client-side connection buffer cap in bytes
	pub client_recvbuf_size: usize,
	/// Upstream-side connection buffer cap in bytes
	pub server_recvbuf_size: usize,
	/// Cap on simultaneously open client connections
	pub max_concurrent_connections: usize,
	/// Idle timeout in seconds
	pub timeout: u64,
	/// Upstream connect timeout in seconds
	pub connect_timeout: u64,
	/// Grace period for in-flight connections on shutdown, in seconds
	pub shutdown_grace: u64,
	/// CA certificate (PEM); with `ca_key_file`, enables TLS interception
	pub ca_cert_file: Option<PathBuf>,
	/// CA private key (PEM)
	pub ca_key_file: Option<PathBuf>,
	/// Dedicated key reused for every minted leaf
	pub ca_signing_key_file: Option<PathBuf>,
	/// Directory mirroring minted leaf certificates
	pub ca_cert_dir: Option<PathBuf>,
	/// Validity window of minted leafs in days
	pub cert_validity_days: u32,
	/// Hosts whose CONNECT tunnels are intercepted (empty = all)
	pub tls_intercept_hosts: Vec<String>,
	/// Disable upstream certificate validation (testing only)
	pub tls_insecure_upstream: bool,
	/// Ordered plugin identifiers
	pub plugins: Vec<String>,
	/// File the server writes its PID into
	pub pid_file: Option<PathBuf>,
	/// Minimum level of logs to be collected/displayed
	pub log_level: LogLevel,
	/// Log destination, reopened on `SIGUSR1`
	pub log_file: Option<PathBuf>,
	/// Route non-CONNECT requests as raw tunnels
	pub disable_http_proxy: bool,
	/// Serve origin-form requests with the embedded web server
	pub enable_web_server: bool,
	/// `user:password` required in `Proxy-Authorization`
	pub basic_auth: Option<String>,
	/// Parent proxy to chain through
	pub upstream_proxy: Option<String>,
	/// Pseudonym for the `Via` header
	pub via: Option<String>,
}

impl ConfigInner {
	/// Update the config from a [`Partial`]. This overwrites all fields of
	/// this config from the provided [`Partial`], if they are set in that
	/// partial config.
	#[allow(clippy::cognitive_complexity)]
	fn update_from_partial(&mut self, partial: &Partial) {
		if let Some(hostname) = partial.hostname {
			self.hostname = hostname;
		}

		if let Some(port) = partial.port {
			self.port = port;
		}

		if let Some(num_workers) = partial.num_workers {
			self.num_workers = num_workers;
		}

		if let Some(backlog) = partial.backlog {
			self.backlog = backlog;
		}

		if let Some(size) = partial.client_recvbuf_size {
			self.client_recvbuf_size = size;
		}

		if let Some(size) = partial.server_recvbuf_size {
			self.server_recvbuf_size = size;
		}

		if let Some(max) = partial.max_concurrent_connections {
			self.max_concurrent_connections = max;
		}

		if let Some(timeout) = partial.timeout {
			self.timeout = timeout;
		}

		if let Some(timeout) = partial.connect_timeout {
			self.connect_timeout = timeout;
		}

		if let Some(grace) = partial.shutdown_grace {
			self.shutdown_grace = grace;
		}

		if let Some(ref path) = partial.ca_cert_file {
			self.ca_cert_file = Some(path.clone());
		}

		if let Some(ref path) = partial.ca_key_file {
			self.ca_key_file = Some(path.clone());
		}

		if let Some(ref path) = partial.ca_signing_key_file {
			self.ca_signing_key_file = Some(path.clone());
		}

		if let Some(ref path) = partial.ca_cert_dir {
			self.ca_cert_dir = Some(path.clone());
		}

		if let Some(days) = partial.cert_validity_days {
			self.cert_validity_days = days;
		}

		if let Some(ref hosts) = partial.tls_intercept_hosts {
			self.tls_intercept_hosts = hosts.clone();
		}

		if let Some(insecure) = partial.tls_insecure_upstream {
			self.tls_insecure_upstream = insecure;
		}

		if let Some(ref plugins) = partial.plugins {
			self.plugins = plugins.clone();
		}

		if let Some(ref path) = partial.pid_file {
			self.pid_file = Some(path.clone());
		}

		if let Some(log_level) = partial.log_level {
			self.log_level = log_level;
		}

		if let Some(ref path) = partial.log_file {
			self.log_file = Some(path.clone());
		}

		if let Some(disable) = partial.disable_http_proxy {
			self.disable_http_proxy = disable;
		}

		if let Some(enable) = partial.enable_web_server {
			self.enable_web_server = enable;
		}

		if let Some(ref auth) = partial.basic_auth {
			self.basic_auth = Some(auth.clone());
		}

		if let Some(ref proxy) = partial.upstream_proxy {
			self.upstream_proxy = Some(proxy.clone());
		}

		if let Some(ref via) = partial.via {
			self.via = Some(via.clone());
		}
	}
}

impl Default for ConfigInner {
	fn default() -> Self {
		Self {
			hostname: IpAddr::from([127, 0, 0, 1]),
			port: 8899,
			num_workers: thread::available_parallelism()
				.map(NonZeroUsize::get)
				.unwrap_or(1),
			backlog: 128,
			client_recvbuf_size: 64 * 1024,
			server_recvbuf_size: 64 * 1024,
			max_concurrent_connections: 1024,
			timeout: 30,
			connect_timeout: 10,
			shutdown_grace: 10,
			ca_cert_file: None,
			ca_key_file: None,
			ca_signing_key_file: None,
			ca_cert_dir: None,
			cert_validity_days: 365,
			tls_intercept_hosts: Vec::new(),
			tls_insecure_upstream: false,
			plugins: Vec::new(),
			pid_file: None,
			log_level: LogLevel::default(),
			log_file: None,
			disable_http_proxy: false,
			enable_web_server: false,
			basic_auth: None,
			upstream_proxy: None,
			via: None,
		}
	}
}

/// Per-connection settings snapshot. Separate from the actual [`Config`]
/// because it shouldn't/can't change during the course of one connection.
#[derive(Debug, Clone)]
pub struct Tuning {
	/// Parser size limits
	pub limits: Limits,
	/// Client-side buffer cap in bytes
	pub client_recvbuf: usize,
	/// Upstream-side buffer cap in bytes
	pub server_recvbuf: usize,
	/// Idle timeout (no bytes in either direction)
	pub idle_timeout: Duration,
	/// Upstream connect timeout
	pub connect_timeout: Duration,
	/// Required `user:password` credentials, when proxy auth is enabled
	pub basic_auth: Option<String>,
	/// `Via` header pseudonym, when configured
	pub via: Option<String>,
	/// Route non-CONNECT requests as raw tunnels
	pub disable_http_proxy: bool,
	/// Parent proxy to chain through
	pub upstream_proxy: Option<Authority>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn config_inner_update_from_partial_all() {
		let mut inner = ConfigInner::default();
		let empty_partial = Partial::default();

		inner.update_from_partial(&empty_partial);
		assert_eq!(inner, ConfigInner::default());

		let full_partial = Partial {
			port: Some(9000),
			basic_auth: Some("user:pass".to_string()),
			plugins: Some(vec!["block-hosts:bad.example".to_string()]),
			..Default::default()
		};

		inner.update_from_partial(&full_partial);
		assert_eq!(inner.port, 9000);
		assert_eq!(inner.basic_auth.as_deref(), Some("user:pass"));
		assert_eq!(inner.plugins.len(), 1);

		// Unset fields keep their previous values
		assert_eq!(inner.hostname, IpAddr::from([127, 0, 0, 1]));
	}

	#[test]
	fn config_inner_update_overwrites_lists() {
		let mut inner = ConfigInner::default();

		inner.update_from_partial(&Partial {
			tls_intercept_hosts: Some(vec!["a.example".to_string()]),
			..Default::default()
		});
		assert_eq!(inner.tls_intercept_hosts, ["a.example"]);

		inner.update_from_partial(&Partial {
			tls_intercept_hosts: Some(vec![]),
			..Default::default()
		});
		assert!(inner.tls_intercept_hosts.is_empty());
	}

	#[test]
	fn tuning_validation() {
		let config = Config {
			inner: RwLock::new(ConfigInner {
				upstream_proxy: Some("parent.example:3128".to_string()),
				basic_auth: Some("user:pass".to_string()),
				..Default::default()
			}),
			file: None,
		};

		let tuning = config.tuning().unwrap();
		assert_eq!(
			tuning.upstream_proxy,
			Some(Authority {
				host: "parent.example".to_string(),
				port: 3128
			})
		);

		let bad = Config {
			inner: RwLock::new(ConfigInner {
				basic_auth: Some("no-colon".to_string()),
				..Default::default()
			}),
			file: None,
		};
		assert!(matches!(
			bad.tuning(),
			Err(ConfigValidateError::BasicAuth)
		));
	}
}

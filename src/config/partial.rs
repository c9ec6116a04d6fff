//! Proxy server configuration as seen by the user

use std::{
	env,
	ffi::OsStr,
	fs,
	io::Error as IoError,
	net::IpAddr,
	path::{Path, PathBuf},
	str::FromStr,
};

use basic_toml::Error as TomlError;
use pico_args::Arguments;
use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use serde_yaml::Error as YamlError;
use thiserror::Error;
use tracing::{instrument, warn};

use super::LogLevel;

/// The error returned by fallible conversions into a [`Partial`]
#[derive(Debug, Error)]
pub enum IntoPartialError {
	/// Failed to parse from toml
	#[error("failed to parse from toml")]
	Toml(#[from] TomlError),
	/// Failed to parse from yaml
	#[error("failed to parse from yaml")]
	Yaml(#[from] YamlError),
	/// Failed to parse from json
	#[error("failed to parse from json")]
	Json(#[from] JsonError),
	/// Failed to read config file
	#[error("failed to read config file")]
	Io(#[from] IoError),
	/// File extension unknown, could not determine format
	#[error("file extension unknown, could not determine format")]
	UnknownExtension,
}

/// Parse the provided environment variable, returning `Some(...)` if it is
/// present, has a value, and was successfully parsed, and `None` otherwise
fn parse_env_var<T: FromStr>(key: &'static str) -> Option<T> {
	env::var(key).map_or(None, |s| s.parse().ok())
}

/// Parse the provided environment variable as a JSON string list
fn parse_env_var_list(key: &'static str) -> Option<Vec<String>> {
	env::var(key).map_or(None, |s| {
		serde_json::from_str(&s)
			.map_err(|err| {
				warn!(
					%err,
					"Error parsing configuration from environment variable '{key}'"
				);
			})
			.ok()
	})
}

/// Parse a command-line option as a JSON string list
fn parse_arg_list(args: &mut Arguments, key: &'static str) -> Option<Vec<String>> {
	args.opt_value_from_fn(key, |s| serde_json::from_str::<Vec<String>>(s))
		.map_err(|err| {
			warn!(
				%err,
				"Error parsing configuration from command-line argument '{key}'"
			);
		})
		.ok()
		.flatten()
}

/// Burrow configuration as seen from the user's perspective. This is easier
/// to parse, but less idiomatic and not as easy to use as [`Config`]. As
/// this is a representation of the configuration from one source only, all
/// fields are optional, which allows incremental updates to the actual
/// [`Config`] struct.
///
/// [`Config`]: super::Config
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct Partial {
	/// IP address the listening socket binds to
	pub hostname: Option<IpAddr>,
	/// TCP port the listening socket binds to
	pub port: Option<u16>,
	/// Number of worker threads
	pub num_workers: Option<usize>,
	/// Listening socket backlog
	pub backlog: Option<u32>,
	/// Client-side connection buffer cap in bytes
	pub client_recvbuf_size: Option<usize>,
	/// Upstream-side connection buffer cap in bytes
	pub server_recvbuf_size: Option<usize>,
	/// Cap on simultaneously open client connections
	pub max_concurrent_connections: Option<usize>,
	/// Idle timeout in seconds
	pub timeout: Option<u64>,
	/// Upstream connect timeout in seconds
	pub connect_timeout: Option<u64>,
	/// Grace period for in-flight connections on shutdown, in seconds
	pub shutdown_grace: Option<u64>,
	/// CA certificate (PEM)
	pub ca_cert_file: Option<PathBuf>,
	/// CA private key (PEM)
	pub ca_key_file: Option<PathBuf>,
	/// Dedicated key reused for every minted leaf
	pub ca_signing_key_file: Option<PathBuf>,
	/// Directory mirroring minted leaf certificates
	pub ca_cert_dir: Option<PathBuf>,
	/// Validity window of minted leafs in days
	pub cert_validity_days: Option<u32>,
	/// Hosts whose CONNECT tunnels are intercepted (empty = all)
	pub tls_intercept_hosts: Option<Vec<String>>,
	/// Disable upstream certificate validation (testing only)
	pub tls_insecure_upstream: Option<bool>,
	/// Ordered plugin identifiers
	pub plugins: Option<Vec<String>>,
	/// File the server writes its PID into
	pub pid_file: Option<PathBuf>,
	/// Minimum level of logs to be collected/displayed. Debug and trace
	/// levels may expose secret information, so are not recommended for
	/// production deployments.
	pub log_level: Option<LogLevel>,
	/// Log destination, reopened on `SIGUSR1`
	pub log_file: Option<PathBuf>,
	/// Route non-CONNECT requests as raw tunnels
	pub disable_http_proxy: Option<bool>,
	/// Serve origin-form requests with the embedded web server
	pub enable_web_server: Option<bool>,
	/// `user:password` required in `Proxy-Authorization`
	pub basic_auth: Option<String>,
	/// Parent proxy (`host:port`) to chain through
	pub upstream_proxy: Option<String>,
	/// Pseudonym for the `Via` header
	pub via: Option<String>,
}

impl Partial {
	/// Parse a [`Partial`] from a [toml](https://toml.io/en/) string
	///
	/// # Errors
	/// Returns an `IntoPartialError::Toml` if deserialization fails.
	pub fn from_toml(toml: &str) -> Result<Self, IntoPartialError> {
		Ok(basic_toml::from_str(toml)?)
	}

	/// Parse a [`Partial`] from a [yaml](https://yaml.org/) string
	///
	/// # Errors
	/// Returns an `IntoPartialError::Yaml` if deserialization fails.
	pub fn from_yaml(yaml: &str) -> Result<Self, IntoPartialError> {
		Ok(serde_yaml::from_str(yaml)?)
	}

	/// Parse a [`Partial`] from a [json](https://json.org/) string
	///
	/// # Errors
	/// Returns an `IntoPartialError::Json` if deserialization fails.
	pub fn from_json(json: &str) -> Result<Self, IntoPartialError> {
		Ok(serde_json::from_str(json)?)
	}

	/// Read and parse a configuration file into a [`Partial`]. The format
	/// of the file is determined from its extension:
	/// - `*.toml` files are parsed as [toml](https://toml.io/en/)
	/// - `*.yaml` and `*.yml` files are parsed as [yaml](https://yaml.org/)
	/// - `*.json` files are parsed as [json](https://json.org/)
	///
	/// # IO
	/// This function performs synchronous file IO, and should not be used
	/// in an asynchronous context.
	///
	/// # Errors
	/// Returns an error when reading or parsing the file fails.
	#[instrument(level = "debug", ret, err)]
	pub fn from_file(path: &Path) -> Result<Self, IntoPartialError> {
		let parse = match path.extension().map(OsStr::to_str) {
			Some(Some("toml")) => Self::from_toml,
			Some(Some("yaml" | "yml")) => Self::from_yaml,
			Some(Some("json")) => Self::from_json,
			_ => return Err(IntoPartialError::UnknownExtension),
		};

		parse(&fs::read_to_string(path)?)
	}

	/// Parse command-line arguments into a [`Partial`]. List-valued options
	/// are parsed from json strings.
	#[must_use]
	#[instrument(level = "debug", ret)]
	pub fn from_args() -> Self {
		let mut args = Arguments::from_env();

		let tls_intercept_hosts = parse_arg_list(&mut args, "--tls-intercept-hosts");
		let plugins = parse_arg_list(&mut args, "--plugins");

		Self {
			hostname: args.opt_value_from_str("--hostname").unwrap_or(None),
			port: args.opt_value_from_str("--port").unwrap_or(None),
			num_workers: args.opt_value_from_str("--num-workers").unwrap_or(None),
			backlog: args.opt_value_from_str("--backlog").unwrap_or(None),
			client_recvbuf_size: args
				.opt_value_from_str("--client-recvbuf-size")
				.unwrap_or(None),
			server_recvbuf_size: args
				.opt_value_from_str("--server-recvbuf-size")
				.unwrap_or(None),
			max_concurrent_connections: args
				.opt_value_from_str("--max-concurrent-connections")
				.unwrap_or(None),
			timeout: args.opt_value_from_str("--timeout").unwrap_or(None),
			connect_timeout: args
				.opt_value_from_str("--connect-timeout")
				.unwrap_or(None),
			shutdown_grace: args.opt_value_from_str("--shutdown-grace").unwrap_or(None),
			ca_cert_file: args.opt_value_from_str("--ca-cert-file").unwrap_or(None),
			ca_key_file: args.opt_value_from_str("--ca-key-file").unwrap_or(None),
			ca_signing_key_file: args
				.opt_value_from_str("--ca-signing-key-file")
				.unwrap_or(None),
			ca_cert_dir: args.opt_value_from_str("--ca-cert-dir").unwrap_or(None),
			cert_validity_days: args
				.opt_value_from_str("--cert-validity-days")
				.unwrap_or(None),
			tls_intercept_hosts,
			tls_insecure_upstream: args
				.opt_value_from_str("--tls-insecure-upstream")
				.unwrap_or(None),
			plugins,
			pid_file: args.opt_value_from_str("--pid-file").unwrap_or(None),
			log_level: args.opt_value_from_str("--log-level").unwrap_or(None),
			log_file: args.opt_value_from_str("--log-file").unwrap_or(None),
			disable_http_proxy: args
				.opt_value_from_str("--disable-http-proxy")
				.unwrap_or(None),
			enable_web_server: args
				.opt_value_from_str("--enable-web-server")
				.unwrap_or(None),
			basic_auth: args.opt_value_from_str("--basic-auth").unwrap_or(None),
			upstream_proxy: args.opt_value_from_str("--upstream-proxy").unwrap_or(None),
			via: args.opt_value_from_str("--via").unwrap_or(None),
		}
	}

	/// Parse environment variables with the prefix `BURROW_` into a
	/// [`Partial`]. List-valued options are parsed from json strings.
	#[must_use]
	#[instrument(level = "debug", ret)]
	pub fn from_env_vars() -> Self {
		Self {
			hostname: parse_env_var("BURROW_HOSTNAME"),
			port: parse_env_var("BURROW_PORT"),
			num_workers: parse_env_var("BURROW_NUM_WORKERS"),
			backlog: parse_env_var("BURROW_BACKLOG"),
			client_recvbuf_size: parse_env_var("BURROW_CLIENT_RECVBUF_SIZE"),
			server_recvbuf_size: parse_env_var("BURROW_SERVER_RECVBUF_SIZE"),
			max_concurrent_connections: parse_env_var("BURROW_MAX_CONCURRENT_CONNECTIONS"),
			timeout: parse_env_var("BURROW_TIMEOUT"),
			connect_timeout: parse_env_var("BURROW_CONNECT_TIMEOUT"),
			shutdown_grace: parse_env_var("BURROW_SHUTDOWN_GRACE"),
			ca_cert_file: parse_env_var("BURROW_CA_CERT_FILE"),
			ca_key_file: parse_env_var("BURROW_CA_KEY_FILE"),
			ca_signing_key_file: parse_env_var("BURROW_CA_SIGNING_KEY_FILE"),
			ca_cert_dir: parse_env_var("BURROW_CA_CERT_DIR"),
			cert_validity_days: parse_env_var("BURROW_CERT_VALIDITY_DAYS"),
			tls_intercept_hosts: parse_env_var_list("BURROW_TLS_INTERCEPT_HOSTS"),
			tls_insecure_upstream: parse_env_var("BURROW_TLS_INSECURE_UPSTREAM"),
			plugins: parse_env_var_list("BURROW_PLUGINS"),
			pid_file: parse_env_var("BURROW_PID_FILE"),
			log_level: parse_env_var("BURROW_LOG_LEVEL"),
			log_file: parse_env_var("BURROW_LOG_FILE"),
			disable_http_proxy: parse_env_var("BURROW_DISABLE_HTTP_PROXY"),
			enable_web_server: parse_env_var("BURROW_ENABLE_WEB_SERVER"),
			basic_auth: parse_env_var("BURROW_BASIC_AUTH"),
			upstream_proxy: parse_env_var("BURROW_UPSTREAM_PROXY"),
			via: parse_env_var("BURROW_VIA"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn from_toml() {
		let partial = Partial::from_toml(
			r#"
			hostname = "0.0.0.0"
			port = 8080
			num_workers = 2
			timeout = 60
			plugins = ["stamp-headers:X-Seen=1"]
			tls_intercept_hosts = ["example.test"]
			basic_auth = "user:pass"
			"#,
		)
		.unwrap();

		assert_eq!(partial.hostname, Some(IpAddr::from([0, 0, 0, 0])));
		assert_eq!(partial.port, Some(8080));
		assert_eq!(partial.num_workers, Some(2));
		assert_eq!(partial.timeout, Some(60));
		assert_eq!(
			partial.plugins,
			Some(vec!["stamp-headers:X-Seen=1".to_string()])
		);
		assert_eq!(
			partial.tls_intercept_hosts,
			Some(vec!["example.test".to_string()])
		);
		assert_eq!(partial.basic_auth.as_deref(), Some("user:pass"));
		assert_eq!(partial.ca_cert_file, None);
	}

	#[test]
	fn from_json() {
		let partial =
			Partial::from_json(r#"{ "port": 9000, "log_level": "warn", "via": "burrow-1" }"#)
				.unwrap();

		assert_eq!(partial.port, Some(9000));
		assert_eq!(partial.log_level, Some(LogLevel::Warn));
		assert_eq!(partial.via.as_deref(), Some("burrow-1"));
	}

	#[test]
	fn from_yaml() {
		let partial = Partial::from_yaml("port: 9001\ndisable_http_proxy: true\n").unwrap();

		assert_eq!(partial.port, Some(9001));
		assert_eq!(partial.disable_http_proxy, Some(true));
	}

	#[test]
	fn from_file_unknown_extension() {
		assert!(matches!(
			Partial::from_file(Path::new("config.ini")),
			Err(IntoPartialError::UnknownExtension)
		));
	}
}

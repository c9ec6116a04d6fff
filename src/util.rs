//! Miscellaneous statics and utilities used throughout burrow.

/// A string representation of this crate's version. In debug builds, this
/// is in the form of `[full semver crate version]+debug`. In release
/// builds this gets shortened to `MAJOR.MINOR`.
pub const VERSION: &str = if cfg!(debug_assertions) {
	concat!(env!("CARGO_PKG_VERSION"), "+debug")
} else {
	concat!(
		env!("CARGO_PKG_VERSION_MAJOR"),
		".",
		env!("CARGO_PKG_VERSION_MINOR")
	)
};

/// The name of the proxy server implemented by this crate, as used in e.g.
/// the `Proxy-Agent` header of synthesized responses and the status page of
/// the embedded web server.
pub const SERVER_NAME: &str = if cfg!(debug_assertions) {
	concat!("burrow/", env!("CARGO_PKG_VERSION"), "+debug")
} else {
	concat!(
		"burrow/",
		env!("CARGO_PKG_VERSION_MAJOR"),
		".",
		env!("CARGO_PKG_VERSION_MINOR")
	)
};

/// Help string for the server CLI
pub const SERVER_HELP: &str = r#"burrow proxy server

USAGE:
    server [FLAGS] [OPTIONS] [CONFIGURATION]

EXAMPLE:
    server -c ./burrow.toml --port 8899 --log-level warn

FLAGS:
 -h --help                   Print this and exit

OPTIONS:
 -c --config PATH            Configuration file path. Supported formats: toml (*.toml), yaml/json (*.yaml, *.yml, *.json)

CONFIGURATION:
    --[OPTION] VALUE         Configuration option (in "kebab-case"), see documentation for possible options and values

Configuration options are parsed first from environment variables ("BURROW_[CONFIG_OPTION]"), then from the configuration file, then from command-line arguments ("--[config-option]"), later ones overwriting earlier ones.
List-valued options (--plugins, --tls-intercept-hosts) take JSON arrays of strings.

EXIT CODES:
    0    clean shutdown
    1    configuration error
    2    could not bind the listening socket
    3    CA material missing or invalid while TLS interception is enabled
"#;

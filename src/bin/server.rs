//! # burrow server
//!
//! The burrow server is the proxy daemon: it binds the listening socket,
//! spawns the worker pool, and relays or intercepts client connections
//! until it is told to stop.
//!
//! ## Signals
//! - `SIGINT` / `SIGTERM` start a graceful shutdown: the acceptor stops,
//!   idle connections close immediately, in-flight ones get the configured
//!   grace period.
//! - `SIGHUP` re-reads the configuration and reloads the plugin registry
//!   and CA material for future connections.
//! - `SIGUSR1` reopens the log file (for log rotation).
//!
//! ## Exit codes
//! `0` clean shutdown, `1` configuration error, `2` bind failure, `3` CA
//! material missing or invalid while TLS interception is enabled.

use std::{
	fs,
	io::{self, Write},
	path::Path,
	process,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
};

use burrow::{
	config::{Config, LogLevel},
	server::{ProxyServer, Shared},
	util::{SERVER_HELP, SERVER_NAME},
};
use parking_lot::RwLock;
use pico_args::Arguments;
use tokio::{runtime::Builder, sync::watch};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{filter::DynFilterFn, prelude::*, FmtSubscriber};

/// Where log lines currently go; swapped out on `SIGUSR1`
enum LogOutput {
	/// Standard output
	Stdout(io::Stdout),
	/// An opened log file
	File(fs::File),
}

/// A `Write` implementation over the swappable [`LogOutput`], handed to the
/// non-blocking appender
struct LogSink(Arc<RwLock<LogOutput>>);

impl Write for LogSink {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match &mut *self.0.write() {
			LogOutput::Stdout(out) => out.write(buf),
			LogOutput::File(file) => file.write(buf),
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match &mut *self.0.write() {
			LogOutput::Stdout(out) => out.flush(),
			LogOutput::File(file) => file.flush(),
		}
	}
}

/// Open (creating or appending) the configured log file
fn open_log_file(path: &Path) -> io::Result<LogOutput> {
	fs::OpenOptions::new()
		.create(true)
		.append(true)
		.open(path)
		.map(LogOutput::File)
}

fn main() -> Result<(), anyhow::Error> {
	// Create a temporary tracing subscriber to collect and show logs on
	// startup
	let tracing_subscriber = FmtSubscriber::builder()
		.with_level(true)
		.with_max_level(if cfg!(debug_assertions) {
			Level::DEBUG
		} else {
			Level::INFO
		})
		.finish();

	// Set the subscriber as the current default so logs are sent there
	let subscriber_guard = tracing::subscriber::set_default(tracing_subscriber);

	info!(server = SERVER_NAME, "Starting burrow");

	// Parse cli args
	let mut args = Arguments::from_env();

	if args.contains(["-h", "--help"]) {
		println!("{SERVER_HELP}");
		return Ok(());
	}

	info!("Getting server configuration");

	// Configure the server
	let config = Config::new_static(args.opt_value_from_str(["-c", "--config"])?);

	debug!(%config, "Server configuration parsed");

	// Set a tracing filter which can change the minimum log level on the
	// fly
	let tracing_filter = DynFilterFn::new(move |metadata, _| {
		let log_level = config.log_level();
		let level = metadata.level();
		if log_level == LogLevel::Verbose {
			let module = metadata.module_path();
			level <= &Level::INFO
				|| (module.is_some()
					&& (module.unwrap().starts_with("burrow") || module.unwrap() == "server")
					&& level <= &Level::DEBUG)
		} else {
			level <= &Level::from(log_level)
		}
	});

	// Set up the (reopenable) log destination and the permanent global
	// subscriber
	let log_output = match config.log_file() {
		Some(ref path) => match open_log_file(path) {
			Ok(output) => output,
			Err(err) => {
				error!(%err, path = %path.display(), "Could not open log file");
				process::exit(1);
			}
		},
		None => LogOutput::Stdout(io::stdout()),
	};
	let log_handle = Arc::new(RwLock::new(log_output));

	let (non_blocking, _tracing_appender_guard) =
		tracing_appender::non_blocking(LogSink(Arc::clone(&log_handle)));
	let tracing_subscriber = FmtSubscriber::builder()
		.with_level(true)
		.with_max_level(Level::TRACE)
		.with_writer(non_blocking)
		.finish()
		.with(tracing_filter);

	drop(subscriber_guard);
	tracing::subscriber::set_global_default(tracing_subscriber)
		.expect("setting tracing default subscriber failed");

	// Assemble the shared state (plugin registry, CA material, tuning);
	// failures here map to the documented exit codes
	let shared = match Shared::from_config(config) {
		Ok(shared) => shared,
		Err(err) => {
			error!(%err, "Server setup failed");
			process::exit(err.exit_code());
		}
	};

	// Write the PID file before accepting any traffic
	if let Some(pid_file) = config.pid_file() {
		if let Err(err) = fs::write(&pid_file, format!("{}\n", process::id())) {
			error!(%err, path = %pid_file.display(), "Could not write PID file");
			process::exit(1);
		}
	}

	// The graceful-shutdown flag, flipped by the signal handler
	let (stop_tx, stop_rx) = watch::channel(false);
	let stop_tx = Arc::new(stop_tx);

	// Bind the listening socket and spawn the worker pool
	let mut server = match ProxyServer::bind(config, Arc::clone(&shared), stop_rx) {
		Ok(server) => server,
		Err(err) => {
			error!(%err, "Server setup failed");
			process::exit(err.exit_code());
		}
	};

	// Start the control runtime (acceptor + signal handling)
	let runtime = Builder::new_multi_thread()
		.worker_threads(2)
		.enable_all()
		.thread_name_fn(|| {
			static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
			let id = ATOMIC_ID.fetch_add(1, Ordering::Relaxed);
			format!("burrow-control-{id:#04x}")
		})
		.build()
		.expect("async runtime initialization");

	info!(%config, "Burrow proxy server started");

	let serve_result = runtime.block_on(async {
		tokio::spawn(handle_signals(
			config,
			Arc::clone(&shared),
			Arc::clone(&stop_tx),
			log_handle,
		));
		server.serve().await
	});

	if let Err(err) = serve_result {
		error!(%err, "Acceptor failed");
		// Make sure the workers stop even though no signal arrived
		let _ = stop_tx.send(true);
	}

	// Let the workers drain within their grace deadline, then clean up
	server.join();
	runtime.shutdown_background();

	if let Some(pid_file) = config.pid_file() {
		if let Err(err) = fs::remove_file(&pid_file) {
			warn!(%err, path = %pid_file.display(), "Could not remove PID file");
		}
	}

	info!("Burrow proxy server stopped");
	Ok(())
}

/// React to the process signals: TERM/INT start a graceful shutdown, HUP
/// reloads configuration and CA material, USR1 reopens the log file
#[cfg(unix)]
async fn handle_signals(
	config: &'static Config,
	shared: Arc<Shared>,
	stop: Arc<watch::Sender<bool>>,
	log_handle: Arc<RwLock<LogOutput>>,
) {
	use tokio::signal::unix::{signal, SignalKind};

	let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
	let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
	let mut sighup = signal(SignalKind::hangup()).expect("installing SIGHUP handler");
	let mut sigusr1 = signal(SignalKind::user_defined1()).expect("installing SIGUSR1 handler");

	loop {
		tokio::select! {
			_ = sigterm.recv() => {
				info!("SIGTERM received, shutting down");
				let _ = stop.send(true);
				return;
			}
			_ = sigint.recv() => {
				info!("SIGINT received, shutting down");
				let _ = stop.send(true);
				return;
			}
			_ = sighup.recv() => {
				info!("SIGHUP received, reloading configuration");
				config.update();
				shared.reload();
			}
			_ = sigusr1.recv() => {
				match config.log_file() {
					Some(ref path) => match open_log_file(path) {
						Ok(output) => {
							*log_handle.write() = output;
							info!("SIGUSR1 received, log file reopened");
						}
						Err(err) => {
							error!(%err, path = %path.display(), "Could not reopen log file");
						}
					},
					None => debug!("SIGUSR1 received, but no log file is configured"),
				}
			}
		}
	}
}

/// Fallback signal handling on platforms without Unix signals: Ctrl-C
/// starts a graceful shutdown
#[cfg(not(unix))]
async fn handle_signals(
	_config: &'static Config,
	_shared: Arc<Shared>,
	stop: Arc<watch::Sender<bool>>,
	_log_handle: Arc<RwLock<LogOutput>>,
) {
	if tokio::signal::ctrl_c().await.is_ok() {
		info!("Ctrl-C received, shutting down");
		let _ = stop.send(true);
	}
}

//! Proxy server assembly: listener, acceptor, and the worker pool.
//!
//! # Listener and acceptor
//! One listening socket (set up via `socket2` with `SO_REUSEADDR`,
//! `SO_REUSEPORT` where supported, and the configured backlog) is served by
//! one acceptor task. The acceptor does no protocol work: it accepts a
//! connection, picks the next worker round-robin, and hands the raw socket
//! across that worker's inbox. Inboxes have depth one, so a busy worker
//! briefly blocks the acceptor, which is the load-shedding mechanism. A
//! worker whose inbox has closed is respawned.
//!
//! # Workers
//! Each worker is an OS thread running its own single-threaded tokio
//! runtime (the readiness loop). The worker re-registers received sockets
//! with its own reactor, wraps them into [`WorkUnit`]s, and drives them as
//! tasks; connections never migrate between workers. On shutdown a worker
//! stops taking new work, lets in-flight connections drain until the grace
//! deadline, and then tears its runtime (and the remaining tasks) down.

use std::{
	io::{Error as IoError, Result as IoResult},
	net::{SocketAddr, TcpStream as StdTcpStream},
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
	thread,
};

use parking_lot::RwLock;
use socket2::{Domain, Protocol as SocketProtocol, Socket, Type};
use tokio::{
	net::{TcpListener, TcpStream},
	runtime::Builder,
	sync::{mpsc, watch, Notify, Semaphore},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
	certs::{CaAuthority, CertError, TlsInterceptor},
	config::{Config, Tuning},
	plugin::Registry,
	proxy::WorkUnit,
	resolver::DnsCache,
	web::{StatusPage, WebServer},
};

/// How long positive DNS answers are reused for upstream connects
const DNS_TTL: std::time::Duration = std::time::Duration::from_secs(60);

/// The error returned when server setup fails, mapped onto the process exit
/// codes
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
	/// The configuration is invalid (exit code 1)
	#[error("configuration error: {0}")]
	Config(#[source] anyhow::Error),
	/// The listening socket could not be bound (exit code 2)
	#[error("could not bind {addr}: {source}")]
	Bind {
		/// The address that could not be bound
		addr: SocketAddr,
		/// The underlying socket error
		source: IoError,
	},
	/// CA material is missing or invalid while TLS interception is enabled
	/// (exit code 3)
	#[error("CA material missing or invalid: {0}")]
	Ca(#[source] CertError),
}

impl SetupError {
	/// The process exit code for this failure
	#[must_use]
	pub const fn exit_code(&self) -> i32 {
		match self {
			Self::Config(_) => 1,
			Self::Bind { .. } => 2,
			Self::Ca(_) => 3,
		}
	}
}

/// State shared by the acceptor and all workers. The reloadable parts
/// (tuning snapshot, plugin registry, TLS interceptor) are swapped out on
/// `SIGHUP` for future connections; in-flight connections keep what they
/// started with.
pub struct Shared {
	config: &'static Config,
	tuning: RwLock<Tuning>,
	registry: RwLock<Arc<Registry>>,
	interceptor: RwLock<Option<Arc<TlsInterceptor>>>,
	resolver: Arc<DnsCache>,
	web: Option<Arc<dyn WebServer>>,
}

impl Shared {
	/// Build the shared state from the configuration.
	///
	/// # Errors
	/// Returns a [`SetupError`] when the configuration is invalid or CA
	/// material can not be loaded.
	pub fn from_config(config: &'static Config) -> Result<Arc<Self>, SetupError> {
		let tuning = config.tuning().map_err(|err| SetupError::Config(err.into()))?;

		let registry = Registry::from_specs(&config.plugins())
			.map_err(|err| SetupError::Config(err.into()))?;

		let interceptor = build_interceptor(config)?;

		let web: Option<Arc<dyn WebServer>> = config
			.enable_web_server()
			.then(|| Arc::new(StatusPage) as Arc<dyn WebServer>);

		Ok(Arc::new(Self {
			config,
			tuning: RwLock::new(tuning),
			registry: RwLock::new(Arc::new(registry)),
			interceptor: RwLock::new(interceptor),
			resolver: Arc::new(DnsCache::new(DNS_TTL)),
			web,
		}))
	}

	/// Re-derive the reloadable parts from the (already re-read)
	/// configuration. Failures keep the previous state and are logged.
	pub fn reload(&self) {
		match self.config.tuning() {
			Ok(tuning) => *self.tuning.write() = tuning,
			Err(err) => error!(%err, "Config reload: keeping previous tuning"),
		}

		match Registry::from_specs(&self.config.plugins()) {
			Ok(registry) => *self.registry.write() = Arc::new(registry),
			Err(err) => error!(%err, "Config reload: keeping previous plugin registry"),
		}

		match build_interceptor(self.config) {
			Ok(interceptor) => *self.interceptor.write() = interceptor,
			Err(err) => error!(%err, "Config reload: keeping previous CA material"),
		}

		info!("Configuration reloaded");
	}

	/// The current per-connection tuning snapshot
	#[must_use]
	pub fn tuning(&self) -> Tuning {
		self.tuning.read().clone()
	}

	/// The current plugin registry
	#[must_use]
	pub fn registry(&self) -> Arc<Registry> {
		Arc::clone(&self.registry.read())
	}

	/// The current TLS interceptor, if interception is configured
	#[must_use]
	pub fn interceptor(&self) -> Option<Arc<TlsInterceptor>> {
		self.interceptor.read().clone()
	}

	/// The shared DNS cache
	#[must_use]
	pub fn resolver(&self) -> Arc<DnsCache> {
		Arc::clone(&self.resolver)
	}

	/// The web collaborator, when enabled
	#[must_use]
	pub fn web(&self) -> Option<Arc<dyn WebServer>> {
		self.web.clone()
	}
}

/// Assemble the TLS interceptor from the CA options, or `None` when
/// interception is not configured
fn build_interceptor(config: &Config) -> Result<Option<Arc<TlsInterceptor>>, SetupError> {
	let (cert, key) = match (config.ca_cert_file(), config.ca_key_file()) {
		(Some(cert), Some(key)) => (cert, key),
		(None, None) => return Ok(None),
		_ => {
			return Err(SetupError::Ca(CertError::Read(IoError::new(
				std::io::ErrorKind::NotFound,
				"ca-cert-file and ca-key-file must both be set",
			))))
		}
	};

	let signing_key = config.ca_signing_key_file();
	let ca = CaAuthority::load(
		&cert,
		&key,
		signing_key.as_deref(),
		config.cert_validity_days(),
	)
	.map_err(SetupError::Ca)?;

	Ok(Some(Arc::new(TlsInterceptor::new(
		ca,
		config.ca_cert_dir(),
		config.tls_intercept_hosts(),
		config.tls_insecure_upstream(),
	))))
}

/// One accepted connection on its way to a worker: the raw socket, the
/// client address, and the concurrency permit it holds until termination
struct Delivery {
	stream: StdTcpStream,
	peer: SocketAddr,
	permit: tokio::sync::OwnedSemaphorePermit,
}

/// A handle to one worker thread
struct Worker {
	inbox: mpsc::Sender<Delivery>,
	thread: Option<thread::JoinHandle<()>>,
}

/// The assembled proxy server: the bound listening socket plus the worker
/// pool. Dropping it without [`join`][Self::join] leaks the worker threads.
pub struct ProxyServer {
	listener: Option<std::net::TcpListener>,
	local_addr: SocketAddr,
	workers: Vec<Worker>,
	shared: Arc<Shared>,
	stop: watch::Receiver<bool>,
	permits: Arc<Semaphore>,
}

impl ProxyServer {
	/// Bind the listening socket and spawn the worker pool. `stop` is the
	/// graceful-shutdown flag flipped by the signal handler.
	///
	/// # Errors
	/// Returns a [`SetupError::Bind`] when the socket can not be set up.
	pub fn bind(
		config: &'static Config,
		shared: Arc<Shared>,
		stop: watch::Receiver<bool>,
	) -> Result<Self, SetupError> {
		let addr = SocketAddr::new(config.hostname(), config.port());
		let bind_err = |source| SetupError::Bind { addr, source };

		let socket = Socket::new(
			Domain::for_address(addr),
			Type::STREAM,
			Some(SocketProtocol::TCP),
		)
		.map_err(bind_err)?;

		// `SO_REUSEADDR` has different meanings across platforms: on
		// Windows it allows multiple listeners per socket (which is very
		// bad), on Unix-like OSs it allows binding to a recently-closed
		// address
		socket.set_reuse_address(cfg!(unix)).map_err(bind_err)?;
		#[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
		{
			let _ = socket.set_reuse_port(true);
		}
		// Required for tokio to properly use async listeners
		socket.set_nonblocking(true).map_err(bind_err)?;

		socket.bind(&addr.into()).map_err(bind_err)?;
		socket
			.listen(i32::try_from(config.backlog()).unwrap_or(128))
			.map_err(bind_err)?;

		let listener: std::net::TcpListener = socket.into();
		let local_addr = listener
			.local_addr()
			.map_err(bind_err)?;

		let workers = (0..config.num_workers().max(1))
			.map(|index| spawn_worker(index, Arc::clone(&shared), stop.clone()))
			.collect::<IoResult<Vec<_>>>()
			.map_err(bind_err)?;

		info!(
			"Listening on {local_addr} with {} workers",
			workers.len()
		);

		Ok(Self {
			listener: Some(listener),
			local_addr,
			workers,
			shared,
			stop,
			permits: Arc::new(Semaphore::new(config.max_concurrent_connections())),
		})
	}

	/// The bound listening address
	#[must_use]
	pub const fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// Run the acceptor loop until the stop flag flips. Each accepted
	/// socket is handed to the next worker round-robin; a worker whose
	/// inbox has closed is respawned in place.
	///
	/// # Errors
	/// Returns an error if the listening socket can not be registered with
	/// the runtime.
	pub async fn serve(&mut self) -> IoResult<()> {
		let listener = TcpListener::from_std(
			self.listener
				.take()
				.expect("serve called twice on one server"),
		)?;

		let mut stop = self.stop.clone();
		let mut next = 0_usize;

		loop {
			let permit = tokio::select! {
				permit = Arc::clone(&self.permits).acquire_owned() => {
					permit.expect("connection semaphore closed")
				}
				_ = stop.changed() => break,
			};

			let (stream, peer) = tokio::select! {
				accepted = listener.accept() => match accepted {
					Ok(accepted) => accepted,
					Err(err) => {
						warn!(%err, "Error accepting TCP connection");
						continue;
					}
				},
				_ = stop.changed() => break,
			};

			trace!(%peer, "Accepted connection");
			let _ = stream.set_nodelay(true);

			let stream = match stream.into_std() {
				Ok(stream) => stream,
				Err(err) => {
					warn!(%err, "Could not detach accepted socket");
					continue;
				}
			};

			let mut delivery = Some(Delivery {
				stream,
				peer,
				permit,
			});

			// Hand off round-robin; a dead worker is skipped after being
			// respawned for subsequent connections
			let mut attempts = 0;
			while let Some(handoff) = delivery.take() {
				if attempts > self.workers.len() {
					warn!(%peer, "No live worker available, dropping connection");
					break;
				}
				attempts += 1;

				let index = next % self.workers.len();
				next = next.wrapping_add(1);

				match self.workers[index].inbox.send(handoff).await {
					Ok(()) => {}
					Err(returned) => {
						warn!(worker = index, "Worker inbox closed, respawning worker");

						match spawn_worker(index, Arc::clone(&self.shared), self.stop.clone()) {
							Ok(worker) => {
								let old = std::mem::replace(&mut self.workers[index], worker);
								drop(old.inbox);
							}
							Err(err) => error!(worker = index, %err, "Could not respawn worker"),
						}

						delivery = Some(returned.0);
					}
				}
			}
		}

		debug!("Acceptor stopped");
		Ok(())
	}

	/// Wait for all worker threads to finish their graceful drain and exit
	pub fn join(&mut self) {
		for worker in &mut self.workers {
			if let Some(thread) = worker.thread.take() {
				let _ = thread.join();
			}
		}

		debug!("All workers joined");
	}
}

/// Spawn one worker thread hosting its own single-threaded runtime
fn spawn_worker(
	index: usize,
	shared: Arc<Shared>,
	stop: watch::Receiver<bool>,
) -> IoResult<Worker> {
	let (inbox_tx, inbox_rx) = mpsc::channel(1);

	let thread = thread::Builder::new()
		.name(format!("burrow-worker-{index:02}"))
		.spawn(move || worker_main(index, inbox_rx, &shared, stop))?;

	Ok(Worker {
		inbox: inbox_tx,
		thread: Some(thread),
	})
}

/// The worker thread body: receive sockets from the inbox, wrap them into
/// work units, and drive them on this worker's own runtime
fn worker_main(
	index: usize,
	mut inbox: mpsc::Receiver<Delivery>,
	shared: &Arc<Shared>,
	mut stop: watch::Receiver<bool>,
) {
	let runtime = Builder::new_current_thread()
		.enable_all()
		.build()
		.expect("worker runtime initialization");

	let active = Arc::new(AtomicUsize::new(0));
	let drained = Arc::new(Notify::new());

	runtime.block_on(async {
		loop {
			let delivery = tokio::select! {
				delivery = inbox.recv() => match delivery {
					Some(delivery) => delivery,
					None => break,
				},
				changed = stop.changed() => {
					if changed.is_err() || *stop.borrow() {
						break;
					}
					continue;
				}
			};

			let Delivery {
				stream,
				peer,
				permit,
			} = delivery;

			// Register the received socket with this worker's reactor
			let stream = match TcpStream::from_std(stream) {
				Ok(stream) => stream,
				Err(err) => {
					warn!(worker = index, %err, "Could not register accepted socket");
					continue;
				}
			};

			let unit = WorkUnit::new(
				stream,
				peer,
				shared.tuning(),
				shared.registry().build_chain(),
				shared.interceptor(),
				shared.resolver(),
				shared.web(),
				stop.clone(),
			);

			active.fetch_add(1, Ordering::SeqCst);
			let active = Arc::clone(&active);
			let drained = Arc::clone(&drained);

			tokio::spawn(async move {
				unit.run().await;
				drop(permit);

				if active.fetch_sub(1, Ordering::SeqCst) == 1 {
					drained.notify_waiters();
				}
			});
		}

		// Drain in-flight connections until the grace deadline; whatever
		// remains is aborted when the runtime is dropped
		let grace = shared.config.shutdown_grace();
		let wait = async {
			while active.load(Ordering::SeqCst) > 0 {
				let notified = drained.notified();
				tokio::pin!(notified);
				notified.as_mut().enable();

				// Re-check after registering, a task may have finished in
				// between
				if active.load(Ordering::SeqCst) == 0 {
					break;
				}

				notified.await;
			}
		};

		if tokio::time::timeout(grace, wait).await.is_err() {
			warn!(
				worker = index,
				remaining = active.load(Ordering::SeqCst),
				"Grace deadline elapsed, aborting remaining connections"
			);
		}
	});

	debug!(worker = index, "Worker exited");
}

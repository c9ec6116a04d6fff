//! The HTTP/CONNECT proxy state machine.
//!
//! Every accepted connection becomes one [`WorkUnit`], owned by exactly one
//! worker for its lifetime. The work unit is an explicit state machine
//! driven through [`Phase`]s: read and parse the request head, classify it
//! (forward-proxy, CONNECT, or origin-form for the web collaborator),
//! consult the plugin chain, open the upstream connection, then either
//! relay parsed HTTP in both directions or splice a raw tunnel. When TLS
//! interception is configured and the CONNECT target matches the policy,
//! the tunnel is terminated on both sides and the machine loops back to
//! reading (now decrypted) request heads.

use std::{
	io::{Error as IoError, ErrorKind},
	net::SocketAddr,
	sync::Arc,
	time::Instant,
};

use bytes::BytesMut;
use tokio::{net::TcpStream, sync::watch, time::timeout};
use tokio_rustls::{
	rustls::{pki_types::ServerName, server::Acceptor},
	LazyConfigAcceptor,
};
use tracing::{debug, info, trace, warn};

use crate::{
	certs::TlsInterceptor,
	config::Tuning,
	conn::{splice, Conn, Rewind},
	http::{
		encode_chunk, encode_final_chunk, parse_authority, parse_request, parse_response,
		parse_target, request_body_kind, response_body_kind, Authority, BodyKind, ChunkedDecoder,
		Headers, ParseError, RequestHead, ResponseHead, Target, Version,
	},
	plugin::{AccessEntry, Chain, Decision, Exchange, HookSet, RequestDecision},
	resolver::DnsCache,
	util::SERVER_NAME,
	web::WebServer,
};

/// Headers that are scoped to a single transport connection and must not be
/// forwarded
const HOP_BY_HOP: [&str; 9] = [
	"connection",
	"keep-alive",
	"proxy-authenticate",
	"proxy-authorization",
	"proxy-connection",
	"te",
	"trailer",
	"transfer-encoding",
	"upgrade",
];

/// The failure kinds a work unit can terminate with. Anything detected
/// before the first response byte yields a synthesized error response;
/// afterwards the connection is closed silently.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
	/// The parser rejected client or upstream input
	#[error("malformed protocol: {0}")]
	MalformedProtocol(#[from] ParseError),
	/// `basic-auth` is configured and the request carried no valid
	/// `Proxy-Authorization`
	#[error("proxy authentication required")]
	AuthRequired,
	/// The upstream could not be resolved or connected
	#[error("upstream unreachable: {0}")]
	UpstreamUnreachable(#[source] IoError),
	/// The upstream stopped responding mid-exchange
	#[error("upstream timed out")]
	UpstreamTimeout,
	/// The client stopped sending mid-request
	#[error("client timed out")]
	ClientTimeout,
	/// A TLS handshake (either side of an intercepted tunnel) failed
	#[error("TLS handshake failed: {0}")]
	TlsHandshakeFailed(#[source] IoError),
	/// A plugin vetoed the connection
	#[error("rejected by plugin")]
	PluginRejected,
	/// The client transport failed
	#[error("client I/O error: {0}")]
	ClientIo(#[source] IoError),
	/// The upstream transport failed
	#[error("upstream I/O error: {0}")]
	UpstreamIo(#[source] IoError),
}

impl ProxyError {
	/// The failure-kind label used in access logs
	#[must_use]
	pub const fn kind(&self) -> &'static str {
		match self {
			Self::MalformedProtocol(_) => "MalformedProtocol",
			Self::AuthRequired => "AuthRequired",
			Self::UpstreamUnreachable(_) => "UpstreamUnreachable",
			Self::UpstreamTimeout => "UpstreamTimeout",
			Self::ClientTimeout => "ClientTimeout",
			Self::TlsHandshakeFailed(_) => "TlsHandshakeFailed",
			Self::PluginRejected => "PluginRejected",
			Self::ClientIo(_) => "ClientIo",
			Self::UpstreamIo(_) => "UpstreamIo",
		}
	}

	/// The response synthesized for this failure when no response bytes
	/// have been sent yet; `None` closes the connection without a response
	#[must_use]
	pub const fn response(&self) -> Option<(u16, &'static str, &'static str)> {
		match self {
			Self::MalformedProtocol(_) => Some((400, "Bad Request", "malformed request")),
			Self::AuthRequired => Some((407, "Proxy Authentication Required", "authentication required")),
			Self::UpstreamUnreachable(_) | Self::TlsHandshakeFailed(_) => {
				Some((502, "Bad Gateway", "upstream unreachable"))
			}
			Self::UpstreamTimeout => Some((504, "Gateway Timeout", "upstream timed out")),
			Self::ClientTimeout => Some((408, "Request Timeout", "request timed out")),
			Self::PluginRejected | Self::ClientIo(_) | Self::UpstreamIo(_) => None,
		}
	}
}

/// How a classified request is routed
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
	/// A forward-proxy request (absolute-form target)
	Forward,
	/// A CONNECT tunnel request
	Connect,
	/// An origin-form request inside an intercepted tunnel
	Intercepted,
	/// A non-CONNECT request routed as a raw tunnel (`disable-http-proxy`)
	Raw(BytesMut),
}

/// A request that passed classification, together with its routing
#[derive(Debug)]
struct Pending {
	req: RequestHead,
	authority: Authority,
	route: Route,
}

/// The work unit's protocol phase. Each loop turn of [`WorkUnit::drive`]
/// advances exactly one phase.
enum Phase {
	/// Reading bytes until the request head is complete
	AwaitHead,
	/// Branching on method and target form
	Classify(RequestHead, Option<BytesMut>),
	/// Running `on_client_request` and `before_upstream_connection`
	PluginRequest(Pending),
	/// Resolving and connecting the upstream
	UpstreamConnect(Pending),
	/// Streaming parsed HTTP in both directions
	Relay(Pending),
	/// Raw or intercepted CONNECT tunnel
	Tunnel(Pending),
	/// Handing the connection to the web collaborator
	Web(RequestHead),
	/// The connection is finished
	Done,
}

/// The per-connection state bundle: client connection, optional upstream,
/// plugin chain, and the protocol phase
pub struct WorkUnit {
	client: Conn,
	peer: SocketAddr,
	upstream: Option<(Conn, Authority)>,
	chain: Chain,
	tuning: Tuning,
	interceptor: Option<Arc<TlsInterceptor>>,
	resolver: Arc<DnsCache>,
	web: Option<Arc<dyn WebServer>>,
	stop: watch::Receiver<bool>,
	/// Set once TLS interception has engaged; holds the tunnel authority
	tunnel: Option<Authority>,
	/// Whether any response bytes for the current exchange reached the wire
	response_started: bool,
	last_authority: Option<Authority>,
	req_started: Instant,
}

impl WorkUnit {
	/// Wrap an accepted client socket into a work unit
	#[must_use]
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		stream: TcpStream,
		peer: SocketAddr,
		tuning: Tuning,
		chain: Chain,
		interceptor: Option<Arc<TlsInterceptor>>,
		resolver: Arc<DnsCache>,
		web: Option<Arc<dyn WebServer>>,
		stop: watch::Receiver<bool>,
	) -> Self {
		let client = Conn::new(stream, tuning.client_recvbuf, tuning.client_recvbuf);

		Self {
			client,
			peer,
			upstream: None,
			chain,
			tuning,
			interceptor,
			resolver,
			web,
			stop,
			tunnel: None,
			response_started: false,
			last_authority: None,
			req_started: Instant::now(),
		}
	}

	/// Drive the connection to completion, synthesizing an error response
	/// when the failure happened before any response bytes were sent, and
	/// emitting the access log either way.
	pub async fn run(mut self) {
		match self.drive().await {
			Ok(()) => trace!(peer = %self.peer, "Connection finished"),
			Err(err) => {
				debug!(peer = %self.peer, %err, kind = err.kind(), "Connection failed");

				if !self.response_started {
					if let Some((status, reason, body)) = err.response() {
						let _ = self.write_synthesized(status, reason, body).await;
					}
				}

				self.log_exchange("-", "-", None, Some(err.kind())).await;
			}
		}

		let _ = self.client.finish().await;
		if let Some((mut upstream, _)) = self.upstream.take() {
			let _ = upstream.finish().await;
		}

		let cx = self.exchange();
		self.chain.connection_close(&cx).await;
	}

	/// The phase loop: each turn advances the machine by one phase
	async fn drive(&mut self) -> Result<(), ProxyError> {
		let mut phase = Phase::AwaitHead;

		loop {
			phase = match phase {
				Phase::AwaitHead => match self.await_head().await? {
					Some((head, raw)) => {
						self.req_started = Instant::now();
						self.response_started = false;
						Phase::Classify(head, raw)
					}
					None => Phase::Done,
				},
				Phase::Classify(head, raw) => self.classify(head, raw)?,
				Phase::PluginRequest(pending) => match self.plugin_request(pending).await? {
					Some(pending) => Phase::UpstreamConnect(pending),
					None => self.next_request(),
				},
				Phase::UpstreamConnect(pending) => {
					let pending = self.upstream_connect(pending).await?;
					if matches!(pending.route, Route::Forward | Route::Intercepted) {
						Phase::Relay(pending)
					} else {
						Phase::Tunnel(pending)
					}
				}
				Phase::Relay(pending) => {
					let keep_alive = self.relay(pending).await?;
					if keep_alive {
						self.next_request()
					} else {
						Phase::Done
					}
				}
				Phase::Tunnel(pending) => self.tunnel(pending).await?,
				Phase::Web(head) => {
					self.hand_to_web(head).await?;
					Phase::Done
				}
				Phase::Done => return Ok(()),
			};
		}
	}

	/// The phase entered after a completed exchange on a persistent
	/// connection
	const fn next_request(&self) -> Phase {
		Phase::AwaitHead
	}

	/// Read from the client until a complete request head is parsed.
	/// Returns `None` on a clean close (EOF or shutdown with no buffered
	/// request bytes). With `disable-http-proxy` set the raw head bytes are
	/// captured alongside the parsed head.
	async fn await_head(&mut self) -> Result<Option<(RequestHead, Option<BytesMut>)>, ProxyError> {
		let capture_raw = self.tuning.disable_http_proxy && self.tunnel.is_none();

		loop {
			let snapshot = capture_raw.then(|| self.client.buffer().clone());
			let before = self.client.buffer().len();

			if let Some(head) = parse_request(self.client.buffer(), &self.tuning.limits)? {
				let raw = snapshot.map(|mut all| {
					let consumed = before - self.client.buffer().len();
					all.truncate(consumed);
					all
				});
				return Ok(Some((head, raw)));
			}

			if self.client.is_eof() {
				if self.client.has_buffered() {
					return Err(ProxyError::MalformedProtocol(ParseError::Invalid(
						"connection closed mid-head",
					)));
				}
				return Ok(None);
			}

			let stopping = *self.stop.borrow_and_update();
			if stopping && !self.client.has_buffered() {
				debug!(peer = %self.peer, "Closing idle connection on shutdown");
				return Ok(None);
			}

			let filled = if stopping {
				// Already draining: finish this request, no need to watch
				// for the signal again
				Some(timeout(self.tuning.idle_timeout, self.client.fill()).await)
			} else {
				tokio::select! {
					res = timeout(self.tuning.idle_timeout, self.client.fill()) => Some(res),
					_ = self.stop.changed() => None,
				}
			};

			match filled {
				// Shutdown signal: loop around, the stopping check above
				// decides whether this connection is idle
				None => {}
				Some(Ok(Ok(_))) => {}
				Some(Ok(Err(err))) => return Err(ProxyError::ClientIo(err)),
				Some(Err(_)) => {
					if self.client.has_buffered() {
						return Err(ProxyError::ClientTimeout);
					}
					// Idle between requests: close without a response
					debug!(peer = %self.peer, "Closing idle connection");
					return Ok(None);
				}
			}
		}
	}

	/// Branch on the parsed head: authentication, then method and target
	/// form
	fn classify(&mut self, head: RequestHead, raw: Option<BytesMut>) -> Result<Phase, ProxyError> {
		self.check_auth(&head)?;

		let target = parse_target(&head.method, &head.target)?;

		// With `disable-http-proxy` set, non-CONNECT requests become raw
		// tunnels to the host named by the target (or the Host header)
		if let Some(raw) = raw {
			if !matches!(target, Target::Authority(_)) {
				let authority = match &target {
					Target::Absolute { authority, .. } => authority.clone(),
					Target::Origin(_) => {
						let host = head.headers.get("host").ok_or(ProxyError::MalformedProtocol(
							ParseError::Invalid("origin-form target without a Host header"),
						))?;
						parse_authority(host, 80)?
					}
					Target::Authority(_) => unreachable!(),
				};

				self.last_authority = Some(authority.clone());
				return Ok(Phase::PluginRequest(Pending {
					req: head,
					authority,
					route: Route::Raw(raw),
				}));
			}
		}

		let pending = match target {
			Target::Authority(authority) => Pending {
				req: head,
				authority,
				route: Route::Connect,
			},
			Target::Absolute {
				ref scheme,
				ref authority,
				..
			} => {
				if self.tunnel.is_some() {
					return Err(ProxyError::MalformedProtocol(ParseError::Invalid(
						"absolute-form target inside a tunnel",
					)));
				}

				if scheme != "http" {
					return Err(ProxyError::MalformedProtocol(ParseError::Invalid(
						"unsupported scheme for forward proxying",
					)));
				}

				Pending {
					authority: authority.clone(),
					req: head,
					route: Route::Forward,
				}
			}
			Target::Origin(_) => {
				if let Some(authority) = self.tunnel.clone() {
					Pending {
						req: head,
						authority,
						route: Route::Intercepted,
					}
				} else if self.web.is_some() {
					return Ok(Phase::Web(head));
				} else {
					return Err(ProxyError::MalformedProtocol(ParseError::Invalid(
						"origin-form target on a proxy",
					)));
				}
			}
		};

		self.last_authority = Some(pending.authority.clone());
		Ok(Phase::PluginRequest(pending))
	}

	/// Validate `Proxy-Authorization` against the configured credentials.
	/// Requests inside an intercepted tunnel were authenticated at CONNECT
	/// time.
	fn check_auth(&self, head: &RequestHead) -> Result<(), ProxyError> {
		let Some(ref credentials) = self.tuning.basic_auth else {
			return Ok(());
		};

		if self.tunnel.is_some() {
			return Ok(());
		}

		use base64::{engine::general_purpose::STANDARD, Engine};
		let expected = STANDARD.encode(credentials);

		let authorized = head.headers.get("proxy-authorization").is_some_and(|value| {
			value
				.trim()
				.split_once(char::is_whitespace)
				.is_some_and(|(scheme, token)| {
					scheme.eq_ignore_ascii_case("basic") && token.trim() == expected
				})
		});

		if authorized {
			Ok(())
		} else {
			Err(ProxyError::AuthRequired)
		}
	}

	/// Run `on_client_request` (first terminal outcome wins) and
	/// `before_upstream_connection` (fail-closed). Returns `None` when a
	/// plugin synthesized the response itself.
	async fn plugin_request(&mut self, mut pending: Pending) -> Result<Option<Pending>, ProxyError> {
		// Raw tunnels bypass the plugin chain entirely (the bytes are
		// opaque), except for the access log at close
		if matches!(pending.route, Route::Raw(_)) {
			return Ok(Some(pending));
		}

		let cx = self.exchange_for(&pending.authority);

		match self.chain.client_request(&cx, &mut pending.req).await {
			RequestDecision::Continue => {}
			RequestDecision::Reject => return Err(ProxyError::PluginRejected),
			RequestDecision::Respond(head, body) => {
				self.respond_synthesized(&head, &body).await?;
				self.log_exchange(&pending.req.method, &pending.req.target, Some(head.status), None)
					.await;
				return Ok(None);
			}
		}

		// A plugin may have rewritten the target; re-derive the authority
		// before connecting
		if pending.route == Route::Forward {
			match parse_target(&pending.req.method, &pending.req.target)? {
				Target::Absolute { authority, .. } => pending.authority = authority,
				Target::Origin(_) | Target::Authority(_) => {
					return Err(ProxyError::MalformedProtocol(ParseError::Invalid(
						"plugin rewrote target to a non-forwardable form",
					)))
				}
			}
			self.last_authority = Some(pending.authority.clone());
		}

		let cx = self.exchange_for(&pending.authority);
		if self.chain.before_upstream(&cx).await == Decision::Reject {
			return Err(ProxyError::PluginRejected);
		}

		Ok(Some(pending))
	}

	/// Resolve and connect the upstream (or reuse the kept-alive one),
	/// honoring the configured parent proxy
	async fn upstream_connect(&mut self, pending: Pending) -> Result<Pending, ProxyError> {
		// Exchanges inside an intercepted tunnel reuse the tunnel's TLS
		// session; keep-alive forward requests reuse a live upstream to the
		// same authority
		if pending.route == Route::Intercepted {
			if self.upstream.is_some() {
				return Ok(pending);
			}
			return Err(ProxyError::UpstreamIo(IoError::new(
				ErrorKind::NotConnected,
				"tunnel upstream is gone",
			)));
		}

		if let Some((conn, authority)) = self.upstream.as_ref() {
			if *authority == pending.authority && !conn.is_eof() {
				return Ok(pending);
			}
		}

		if let Some((mut old, _)) = self.upstream.take() {
			let _ = old.finish().await;
		}

		let connect_to = self
			.tuning
			.upstream_proxy
			.clone()
			.unwrap_or_else(|| pending.authority.clone());

		let stream = self.open_tcp(&connect_to).await?;
		let mut upstream = Conn::new(
			stream,
			self.tuning.server_recvbuf,
			self.tuning.server_recvbuf,
		);

		// Tunnel through the parent proxy when one is configured
		if self.tuning.upstream_proxy.is_some() && pending.route == Route::Connect {
			chain_connect(&mut upstream, &pending.authority, &self.tuning).await?;
		}

		self.upstream = Some((upstream, pending.authority.clone()));
		Ok(pending)
	}

	/// Open a TCP connection to the authority within the connect timeout,
	/// trying each resolved address in order
	async fn open_tcp(&self, authority: &Authority) -> Result<TcpStream, ProxyError> {
		let connect = async {
			let addrs = self
				.resolver
				.resolve(&authority.host, authority.port)
				.await?;

			let mut last = None;
			for addr in addrs {
				match TcpStream::connect(addr).await {
					Ok(stream) => {
						stream.set_nodelay(true)?;
						return Ok(stream);
					}
					Err(err) => last = Some(err),
				}
			}

			Err(last.unwrap_or_else(|| IoError::new(ErrorKind::NotFound, "no usable address")))
		};

		match timeout(self.tuning.connect_timeout, connect).await {
			Ok(Ok(stream)) => Ok(stream),
			Ok(Err(err)) => Err(ProxyError::UpstreamUnreachable(err)),
			Err(_) => Err(ProxyError::UpstreamUnreachable(IoError::new(
				ErrorKind::TimedOut,
				"connect timed out",
			))),
		}
	}

	/// Stream one request to the upstream and its response back, applying
	/// forward-proxy rewrites and plugin chunk hooks. Returns whether the
	/// client connection stays open for another request.
	async fn relay(&mut self, pending: Pending) -> Result<bool, ProxyError> {
		let Pending {
			req,
			authority,
			route,
		} = pending;

		let request_body = request_body_kind(&req)?;
		let client_persists = client_keep_alive(&req);
		let cx = self.exchange_for(&authority);

		// Build the outbound head: hop-by-hop headers (plus anything named
		// in Connection) stripped, target in origin form, optional Via
		let mut outbound = req.clone();
		strip_hop_by_hop(&mut outbound.headers);

		if request_body == BodyKind::Chunked {
			outbound.headers.append("Transfer-Encoding", "chunked");
		}

		if let Some(ref via) = self.tuning.via {
			outbound
				.headers
				.append("Via", format!("1.1 {via}"));
		}

		// Towards a parent proxy the absolute-form target is kept
		if route == Route::Forward && self.tuning.upstream_proxy.is_none() {
			if let Target::Absolute { origin_form, .. } =
				parse_target(&outbound.method, &outbound.target)?
			{
				outbound.target = origin_form;
			}
		}

		let (upstream, _) = self
			.upstream
			.as_mut()
			.expect("relay entered without an upstream");

		let mut head = BytesMut::new();
		outbound.encode(&mut head);
		upstream
			.write_all(&head)
			.await
			.map_err(ProxyError::UpstreamIo)?;
		upstream.flush().await.map_err(ProxyError::UpstreamIo)?;

		// From here on the serialized head is on the wire; later header
		// mutations would be ignored (and are unreachable, since plugins
		// only see the head in on_client_request)
		relay_body(
			&mut self.client,
			upstream,
			&mut self.chain,
			&cx,
			request_body,
			HookSet::REQUEST_BODY,
			&self.tuning,
			true,
		)
		.await?;

		let response = {
			let (upstream, _) = self.upstream.as_mut().expect("relay lost its upstream");
			read_upstream_head(upstream, &self.tuning).await?
		};

		let response_body = response_body_kind(&req.method, &response)?;
		let upstream_persists = response_keep_alive(&response, response_body);

		let mut head = BytesMut::new();
		response.encode(&mut head);
		self.response_started = true;
		self.client
			.write_all(&head)
			.await
			.map_err(ProxyError::ClientIo)?;
		self.client.flush().await.map_err(ProxyError::ClientIo)?;

		{
			let (upstream, _) = self
				.upstream
				.as_mut()
				.expect("relay lost its upstream");

			relay_body(
				upstream,
				&mut self.client,
				&mut self.chain,
				&cx,
				response_body,
				HookSet::RESPONSE_CHUNK,
				&self.tuning,
				false,
			)
			.await?;
		}

		self.log_exchange(&req.method, &req.target, Some(response.status), None)
			.await;

		if !upstream_persists {
			if let Some((mut upstream, _)) = self.upstream.take() {
				let _ = upstream.finish().await;
			}
		}

		Ok(client_persists && response_body != BodyKind::UntilClose)
	}

	/// Handle a CONNECT (or raw-routed) tunnel: reply `200 Connection
	/// Established` and splice bytes, or engage TLS interception first when
	/// the policy matches
	async fn tunnel(&mut self, pending: Pending) -> Result<Phase, ProxyError> {
		let authority = pending.authority.clone();

		if let Route::Raw(raw_head) = pending.route {
			return self.tunnel_raw(&authority, &raw_head).await;
		}

		let intercept = self
			.interceptor
			.as_ref()
			.filter(|i| i.should_intercept(&authority.host))
			.cloned();

		let Some(interceptor) = intercept else {
			// Plain tunnel: acknowledge, then blind splice
			self.write_established().await?;

			let (upstream, _) = self
				.upstream
				.as_mut()
				.expect("tunnel entered without an upstream");

			match splice(&mut self.client, upstream, self.tuning.idle_timeout).await {
				Ok(()) => {}
				Err(err) if err.kind() == ErrorKind::TimedOut => {
					debug!(peer = %self.peer, %authority, "Tunnel idle timeout");
				}
				Err(err) => return Err(ProxyError::ClientIo(err)),
			}

			self.log_exchange("CONNECT", &authority.to_string(), Some(200), None)
				.await;
			return Ok(Phase::Done);
		};

		// Interception: upstream TLS first so handshake failures can still
		// surface as 502, then acknowledge, then terminate the client side
		// with a leaf minted for the SNI (falling back to the CONNECT host)
		let (upstream, _) = self
			.upstream
			.take()
			.expect("tunnel entered without an upstream");
		let (upstream_io, upstream_leftover) = upstream.into_parts();

		let server_name = ServerName::try_from(authority.host.clone()).map_err(|_| {
			ProxyError::MalformedProtocol(ParseError::Invalid("invalid CONNECT hostname"))
		})?;

		let upstream_tls = interceptor
			.connector()
			.connect(server_name, Rewind::new(upstream_leftover, upstream_io))
			.await
			.map_err(ProxyError::TlsHandshakeFailed)?;

		self.upstream = Some((
			Conn::new(
				upstream_tls,
				self.tuning.server_recvbuf,
				self.tuning.server_recvbuf,
			),
			authority.clone(),
		));

		self.write_established().await?;

		// Replace the client connection with its TLS-terminated form. Any
		// bytes the client sent after its CONNECT head (typically the start
		// of its ClientHello) are replayed into the acceptor.
		let placeholder = Conn::new(tokio::io::empty(), 1, 1);
		let (client_io, client_leftover) = std::mem::replace(&mut self.client, placeholder).into_parts();

		let start = LazyConfigAcceptor::new(
			Acceptor::default(),
			Rewind::new(client_leftover, client_io),
		)
		.await
		.map_err(ProxyError::TlsHandshakeFailed)?;

		let sni = start
			.client_hello()
			.server_name()
			.map_or_else(|| authority.host.clone(), str::to_string);

		let config = interceptor
			.server_config(&sni)
			.await
			.map_err(|err| {
				ProxyError::TlsHandshakeFailed(IoError::new(ErrorKind::InvalidData, err))
			})?;

		let client_tls = start
			.into_stream(config)
			.await
			.map_err(ProxyError::TlsHandshakeFailed)?;

		self.client = Conn::new(
			client_tls,
			self.tuning.client_recvbuf,
			self.tuning.client_recvbuf,
		);

		info!(peer = %self.peer, %authority, sni, "TLS interception engaged");
		self.tunnel = Some(Authority {
			host: sni,
			port: authority.port,
		});

		// The decrypted stream is an origin-form HTTP session
		Ok(Phase::AwaitHead)
	}

	/// `disable-http-proxy` routing: replay the raw head bytes to the
	/// target and splice blindly from then on
	async fn tunnel_raw(
		&mut self,
		authority: &Authority,
		raw_head: &BytesMut,
	) -> Result<Phase, ProxyError> {
		let (upstream, _) = self
			.upstream
			.as_mut()
			.expect("raw tunnel entered without an upstream");

		upstream
			.write_all(raw_head)
			.await
			.map_err(ProxyError::UpstreamIo)?;
		upstream.flush().await.map_err(ProxyError::UpstreamIo)?;

		// Anything the upstream sends counts as response bytes
		self.response_started = true;

		let _ = splice(&mut self.client, upstream, self.tuning.idle_timeout).await;

		self.log_exchange("-", &authority.to_string(), None, None).await;
		Ok(Phase::Done)
	}

	/// Relinquish the work unit to the embedded web-server collaborator
	async fn hand_to_web(&mut self, head: RequestHead) -> Result<(), ProxyError> {
		let web = self.web.clone().expect("web phase without a collaborator");

		debug!(peer = %self.peer, target = %head.target, "Handing request to the web server");
		self.response_started = true;

		let method = head.method.clone();
		let target = head.target.clone();

		web.handle(head, &mut self.client)
			.await
			.map_err(ProxyError::ClientIo)?;

		self.log_exchange(&method, &target, None, None).await;
		Ok(())
	}

	/// Reply `200 Connection Established` to a CONNECT
	async fn write_established(&mut self) -> Result<(), ProxyError> {
		self.response_started = true;
		self.client
			.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
			.await
			.map_err(ProxyError::ClientIo)?;
		self.client.flush().await.map_err(ProxyError::ClientIo)
	}

	/// Send a plugin-synthesized response
	async fn respond_synthesized(
		&mut self,
		head: &ResponseHead,
		body: &[u8],
	) -> Result<(), ProxyError> {
		let mut out = BytesMut::new();
		head.encode(&mut out);
		out.extend_from_slice(body);

		self.response_started = true;
		self.client
			.write_all(&out)
			.await
			.map_err(ProxyError::ClientIo)?;
		self.client.flush().await.map_err(ProxyError::ClientIo)
	}

	/// Synthesize a minimal error response. `407` carries the
	/// `Proxy-Authenticate` challenge; every synthesized error closes the
	/// connection.
	async fn write_synthesized(
		&mut self,
		status: u16,
		reason: &str,
		body: &str,
	) -> Result<(), ProxyError> {
		let body = format!("burrow: {body}\n");

		let mut headers = Headers::new();
		headers.append("Proxy-Agent", SERVER_NAME);
		if status == 407 {
			headers.append("Proxy-Authenticate", "Basic realm=\"burrow\"");
		}
		headers.append("Content-Type", "text/plain; charset=utf-8");
		headers.append("Content-Length", body.len().to_string());
		headers.append("Connection", "close");

		let head = ResponseHead {
			version: Version::Http11,
			status,
			reason: reason.to_string(),
			headers,
		};

		self.respond_synthesized(&head, body.as_bytes()).await
	}

	/// The plugin context for the given authority
	fn exchange_for(&self, authority: &Authority) -> Exchange {
		Exchange {
			peer: self.peer,
			authority: authority.clone(),
			tls: self.tunnel.is_some(),
		}
	}

	/// The plugin context for lifecycle hooks outside a concrete exchange
	fn exchange(&self) -> Exchange {
		let authority = self.last_authority.clone().unwrap_or(Authority {
			host: String::from("-"),
			port: 0,
		});

		Exchange {
			peer: self.peer,
			authority,
			tls: self.tunnel.is_some(),
		}
	}

	/// Emit one access-log record (tracing target `access`) and run the
	/// `on_access_log` hook
	async fn log_exchange(
		&mut self,
		method: &str,
		target: &str,
		status: Option<u16>,
		failure: Option<&'static str>,
	) {
		let entry = AccessEntry {
			peer: self.peer,
			method: method.to_string(),
			target: target.to_string(),
			status,
			upstream: self.last_authority.as_ref().map(ToString::to_string),
			failure,
			duration: self.req_started.elapsed(),
		};

		info!(
			target: "access",
			peer = %entry.peer,
			method = %entry.method,
			request = %entry.target,
			status = entry.status,
			upstream = entry.upstream.as_deref(),
			failure = entry.failure,
			duration_ms = entry.duration.as_millis() as u64,
		);

		self.chain.access_log(&entry).await;
	}
}

/// Read a response head from the upstream within the idle timeout
async fn read_upstream_head(upstream: &mut Conn, tuning: &Tuning) -> Result<ResponseHead, ProxyError> {
	loop {
		if let Some(head) = parse_response(upstream.buffer(), &tuning.limits)? {
			return Ok(head);
		}

		if upstream.is_eof() {
			return Err(ProxyError::UpstreamIo(IoError::new(
				ErrorKind::UnexpectedEof,
				"upstream closed mid-head",
			)));
		}

		match timeout(tuning.idle_timeout, upstream.fill()).await {
			Ok(Ok(_)) => {}
			Ok(Err(err)) => return Err(ProxyError::UpstreamIo(err)),
			Err(_) => return Err(ProxyError::UpstreamTimeout),
		}
	}
}

/// Issue a CONNECT to a parent proxy and wait for its `2xx`
async fn chain_connect(
	upstream: &mut Conn,
	authority: &Authority,
	tuning: &Tuning,
) -> Result<(), ProxyError> {
	let connect = RequestHead {
		method: "CONNECT".into(),
		target: authority.to_string(),
		version: Version::Http11,
		headers: {
			let mut headers = Headers::new();
			headers.append("Host", authority.to_string());
			headers
		},
	};

	let mut head = BytesMut::new();
	connect.encode(&mut head);

	upstream
		.write_all(&head)
		.await
		.map_err(ProxyError::UpstreamIo)?;
	upstream.flush().await.map_err(ProxyError::UpstreamIo)?;

	let response = read_upstream_head(upstream, tuning).await?;
	if response.status / 100 != 2 {
		return Err(ProxyError::UpstreamUnreachable(IoError::new(
			ErrorKind::ConnectionRefused,
			format!("parent proxy answered {}", response.status),
		)));
	}

	Ok(())
}

/// Remove hop-by-hop headers plus anything named in the client's
/// `Connection` (and `Proxy-Connection`) header
fn strip_hop_by_hop(headers: &mut Headers) {
	let mut named = headers.token_list("connection");
	named.extend(headers.token_list("proxy-connection"));

	for name in HOP_BY_HOP {
		headers.remove(name);
	}

	for name in named {
		headers.remove(&name);
	}
}

/// Whether the client side of this request expects the connection to
/// persist (HTTP/1.1 default on, HTTP/1.0 requires an explicit keep-alive)
fn client_keep_alive(req: &RequestHead) -> bool {
	let mut tokens = req.headers.token_list("connection");
	tokens.extend(req.headers.token_list("proxy-connection"));

	match req.version {
		Version::Http11 => !tokens.iter().any(|t| t == "close"),
		Version::Http10 => tokens.iter().any(|t| t == "keep-alive"),
	}
}

/// Whether the response allows the connection to persist
fn response_keep_alive(res: &ResponseHead, body: BodyKind) -> bool {
	if body == BodyKind::UntilClose {
		return false;
	}

	let tokens = res.headers.token_list("connection");

	match res.version {
		Version::Http11 => !tokens.iter().any(|t| t == "close"),
		Version::Http10 => tokens.iter().any(|t| t == "keep-alive"),
	}
}

/// Stream one message body from `src` to `dst` according to its framing,
/// feeding decoded chunks to the plugin chain. Chunked bodies are copied
/// byte-identically unless a plugin declares the matching rewrite
/// capability, in which case they are re-framed from the (possibly
/// rewritten) decoded chunks. For fixed-length bodies a length-changing
/// rewrite would break the framing, so it is ignored with a warning.
#[allow(clippy::too_many_arguments)]
async fn relay_body(
	src: &mut Conn,
	dst: &mut Conn,
	chain: &mut Chain,
	cx: &Exchange,
	kind: BodyKind,
	hook: HookSet,
	tuning: &Tuning,
	src_is_client: bool,
) -> Result<(), ProxyError> {
	let src_err: fn(IoError) -> ProxyError = if src_is_client {
		ProxyError::ClientIo
	} else {
		ProxyError::UpstreamIo
	};
	let dst_err: fn(IoError) -> ProxyError = if src_is_client {
		ProxyError::UpstreamIo
	} else {
		ProxyError::ClientIo
	};
	let src_timeout = || {
		if src_is_client {
			ProxyError::ClientTimeout
		} else {
			ProxyError::UpstreamTimeout
		}
	};

	let observe = chain.has(hook);

	match kind {
		BodyKind::None => Ok(()),

		BodyKind::Fixed(total) => {
			let mut left = total;

			while left > 0 {
				if !src.has_buffered() {
					if src.is_eof() {
						return Err(src_err(IoError::new(
							ErrorKind::UnexpectedEof,
							"connection closed mid-body",
						)));
					}

					match timeout(tuning.idle_timeout, src.fill()).await {
						Ok(Ok(_)) => continue,
						Ok(Err(err)) => return Err(src_err(err)),
						Err(_) => return Err(src_timeout()),
					}
				}

				let take = usize::try_from(left.min(src.buffer().len() as u64))
					.unwrap_or(src.buffer().len());
				let mut chunk = src.buffer().split_to(take);
				left -= take as u64;

				if observe {
					let original_len = chunk.len();
					let mut rewritten = chunk.clone();
					dispatch_chunk(chain, cx, &mut rewritten, hook).await;

					if rewritten.len() == original_len {
						chunk = rewritten;
					} else {
						warn!(
							"Plugin resized a fixed-length body chunk, ignoring the rewrite"
						);
					}
				}

				dst.write_all(&chunk).await.map_err(dst_err)?;
				dst.flush().await.map_err(dst_err)?;
			}

			Ok(())
		}

		BodyKind::Chunked => {
			let mut decoder = ChunkedDecoder::new();
			let mut decoded = BytesMut::new();

			loop {
				let (consumed, done) = decoder.decode(&src.buffer()[..], &mut decoded)?;
				let raw = src.buffer().split_to(consumed);

				if observe && !decoded.is_empty() {
					dispatch_chunk(chain, cx, &mut decoded, hook).await;
				}

				if observe {
					// Re-frame from the decoded (possibly rewritten) chunks
					if !decoded.is_empty() {
						let mut framed = BytesMut::new();
						encode_chunk(&decoded, &mut framed);
						dst.write_all(&framed).await.map_err(dst_err)?;
					}
					decoded.clear();

					if done {
						let mut framed = BytesMut::new();
						encode_final_chunk(&mut framed);
						dst.write_all(&framed).await.map_err(dst_err)?;
					}
				} else {
					// Byte-identical passthrough
					if !raw.is_empty() {
						dst.write_all(&raw).await.map_err(dst_err)?;
					}
					decoded.clear();
				}

				dst.flush().await.map_err(dst_err)?;

				if done {
					return Ok(());
				}

				if src.is_eof() {
					return Err(src_err(IoError::new(
						ErrorKind::UnexpectedEof,
						"connection closed mid-body",
					)));
				}

				match timeout(tuning.idle_timeout, src.fill()).await {
					Ok(Ok(_)) => {}
					Ok(Err(err)) => return Err(src_err(err)),
					Err(_) => return Err(src_timeout()),
				}
			}
		}

		BodyKind::UntilClose => {
			loop {
				if src.has_buffered() {
					let mut chunk = src.buffer().split();

					if observe {
						dispatch_chunk(chain, cx, &mut chunk, hook).await;
					}

					dst.write_all(&chunk).await.map_err(dst_err)?;
					dst.flush().await.map_err(dst_err)?;
				}

				if src.is_eof() {
					return Ok(());
				}

				match timeout(tuning.idle_timeout, src.fill()).await {
					Ok(Ok(_)) => {}
					Ok(Err(err)) => return Err(src_err(err)),
					Err(_) => return Err(src_timeout()),
				}
			}
		}
	}
}

/// Dispatch one body chunk to the matching hook
async fn dispatch_chunk(chain: &mut Chain, cx: &Exchange, chunk: &mut BytesMut, hook: HookSet) {
	if hook == HookSet::REQUEST_BODY {
		chain.request_chunk(cx, chunk).await;
	} else {
		chain.response_chunk(cx, chunk).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Limits;
	use bytes::BytesMut;

	fn parse(head: &[u8]) -> RequestHead {
		parse_request(&mut BytesMut::from(head), &Limits::default())
			.unwrap()
			.unwrap()
	}

	#[test]
	fn hop_by_hop_stripping() {
		let mut req = parse(
			b"GET http://example.test/hello HTTP/1.1\r\n\
			Host: example.test\r\n\
			Proxy-Connection: keep-alive\r\n\
			Connection: close, X-Per-Hop\r\n\
			X-Per-Hop: secret\r\n\
			Upgrade: h2c\r\n\
			X-Kept: yes\r\n\r\n",
		);

		strip_hop_by_hop(&mut req.headers);

		let names: Vec<_> = req.headers.iter().map(|(n, _)| n).collect();
		assert_eq!(names, ["Host", "X-Kept"]);
	}

	#[test]
	fn keep_alive_defaults_per_version() {
		assert!(client_keep_alive(&parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")));
		assert!(!client_keep_alive(&parse(
			b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n"
		)));
		assert!(!client_keep_alive(&parse(b"GET / HTTP/1.0\r\nHost: a\r\n\r\n")));
		assert!(client_keep_alive(&parse(
			b"GET / HTTP/1.0\r\nHost: a\r\nConnection: keep-alive\r\n\r\n"
		)));
		// Proxy-Connection is honored like Connection
		assert!(client_keep_alive(&parse(
			b"GET / HTTP/1.0\r\nHost: a\r\nProxy-Connection: keep-alive\r\n\r\n"
		)));
	}

	#[test]
	fn response_keep_alive_rules() {
		let ok = |extra: &str| {
			let raw = format!("HTTP/1.1 200 OK\r\n{extra}Content-Length: 0\r\n\r\n");
			parse_response(&mut BytesMut::from(raw.as_bytes()), &Limits::default())
				.unwrap()
				.unwrap()
		};

		assert!(response_keep_alive(&ok(""), BodyKind::Fixed(0)));
		assert!(!response_keep_alive(
			&ok("Connection: close\r\n"),
			BodyKind::Fixed(0)
		));
		// An unframed body always closes the connection
		assert!(!response_keep_alive(&ok(""), BodyKind::UntilClose));
	}

	#[test]
	fn error_response_mapping() {
		assert_eq!(
			ProxyError::MalformedProtocol(ParseError::LineTooLong)
				.response()
				.map(|(status, ..)| status),
			Some(400)
		);
		assert_eq!(
			ProxyError::AuthRequired.response().map(|(status, ..)| status),
			Some(407)
		);
		assert_eq!(
			ProxyError::ClientTimeout.response().map(|(status, ..)| status),
			Some(408)
		);
		assert_eq!(
			ProxyError::UpstreamUnreachable(IoError::new(ErrorKind::ConnectionRefused, "no"))
				.response()
				.map(|(status, ..)| status),
			Some(502)
		);
		assert_eq!(
			ProxyError::UpstreamTimeout.response().map(|(status, ..)| status),
			Some(504)
		);
		// Plugin vetoes and mid-stream failures close without a response
		assert!(ProxyError::PluginRejected.response().is_none());
		assert!(ProxyError::ClientIo(IoError::new(ErrorKind::BrokenPipe, "gone"))
			.response()
			.is_none());
	}
}

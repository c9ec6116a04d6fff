//! The plugin lifecycle hooks and their dispatch.
//!
//! Plugins implement [`Plugin`] with default no-op hooks and advertise the
//! hooks they actually implement through a capability bitmask, so each
//! dispatch site pays one predictable branch when no plugin cares. A
//! [`Chain`] is built once per connection from the configured [`Registry`]
//! entries; dispatch is strictly ordered, the first terminal outcome
//! (synthesized response or reject) short-circuits the rest.
//!
//! A hook returning an error is logged and treated as `continue`
//! (fail-open) — except [`Plugin::before_upstream_connection`], where an
//! error vetoes the connection (fail-closed).

use std::{
	net::SocketAddr,
	ops::BitOr,
	time::Duration,
};

use async_trait::async_trait;
use bytes::BytesMut;
use thiserror::Error;
use tracing::{error, warn};

use crate::http::{Authority, RequestHead, ResponseHead};

/// The error returned when a plugin specification can not be resolved
#[derive(Debug, Error)]
pub enum PluginError {
	/// The named plugin is not registered
	#[error("unknown plugin \"{0}\"")]
	Unknown(String),
	/// The plugin's argument string is invalid
	#[error("invalid arguments for plugin \"{0}\": {1}")]
	InvalidSpec(String, String),
}

/// The set of lifecycle hooks a plugin implements
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookSet(u8);

impl HookSet {
	/// No hooks
	pub const NONE: Self = Self(0);
	/// [`Plugin::before_upstream_connection`]
	pub const BEFORE_UPSTREAM: Self = Self(1);
	/// [`Plugin::on_client_request`]
	pub const CLIENT_REQUEST: Self = Self(1 << 1);
	/// [`Plugin::on_client_request_body`]
	pub const REQUEST_BODY: Self = Self(1 << 2);
	/// [`Plugin::on_response_chunk`]
	pub const RESPONSE_CHUNK: Self = Self(1 << 3);
	/// [`Plugin::on_client_connection_close`]
	pub const CONNECTION_CLOSE: Self = Self(1 << 4);
	/// [`Plugin::on_access_log`]
	pub const ACCESS_LOG: Self = Self(1 << 5);

	/// Whether every hook in `other` is present in this set
	#[must_use]
	pub const fn contains(self, other: Self) -> bool {
		self.0 & other.0 == other.0
	}
}

impl BitOr for HookSet {
	type Output = Self;

	fn bitor(self, rhs: Self) -> Self {
		Self(self.0 | rhs.0)
	}
}

/// The read-only connection context passed to every hook
#[derive(Debug, Clone)]
pub struct Exchange {
	/// The client's remote address
	pub peer: SocketAddr,
	/// The upstream authority this exchange targets
	pub authority: Authority,
	/// Whether the exchange runs inside an intercepted TLS tunnel
	pub tls: bool,
}

/// One access-log record, emitted when a work unit terminates or a
/// request/response exchange completes
#[derive(Debug, Clone)]
pub struct AccessEntry {
	/// The client's remote address
	pub peer: SocketAddr,
	/// The request method, or `-` when no request was parsed
	pub method: String,
	/// The request target as sent by the client
	pub target: String,
	/// The response status sent to the client, if any
	pub status: Option<u16>,
	/// The upstream authority, when one was selected
	pub upstream: Option<String>,
	/// The failure kind terminating the exchange, if it failed
	pub failure: Option<&'static str>,
	/// Wall-clock duration of the exchange
	pub duration: Duration,
}

/// The outcome of a veto-capable hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
	/// Proceed with the connection
	Continue,
	/// Veto the connection; it is closed without a response
	Reject,
}

/// The outcome of the request hook
#[derive(Debug)]
pub enum RequestDecision {
	/// Proceed with the (possibly rewritten-in-place) request
	Continue,
	/// Skip the upstream entirely and answer with this response
	Respond(ResponseHead, Vec<u8>),
	/// Veto the connection; it is closed without a response
	Reject,
}

/// A proxy plugin. All hooks default to no-ops; implementations declare the
/// hooks they provide via [`hooks`][Self::hooks] and must not block — long
/// operations are the plugin author's responsibility to offload.
#[async_trait]
pub trait Plugin: Send + Sync {
	/// The plugin's registry name
	fn name(&self) -> &'static str;

	/// The hooks this plugin implements
	fn hooks(&self) -> HookSet;

	/// Called before the upstream connection is opened. Errors here are
	/// fail-closed: the connection is rejected.
	async fn before_upstream_connection(
		&mut self,
		_cx: &Exchange,
	) -> Result<Decision, anyhow::Error> {
		Ok(Decision::Continue)
	}

	/// Called with the parsed request head; may rewrite it in place,
	/// synthesize a response, or reject the connection
	async fn on_client_request(
		&mut self,
		_cx: &Exchange,
		_req: &mut RequestHead,
	) -> Result<RequestDecision, anyhow::Error> {
		Ok(RequestDecision::Continue)
	}

	/// Called with each decoded request body chunk, in arrival order; the
	/// chunk may be rewritten in place
	async fn on_client_request_body(
		&mut self,
		_cx: &Exchange,
		_chunk: &mut BytesMut,
	) -> Result<(), anyhow::Error> {
		Ok(())
	}

	/// Called with each decoded response body chunk, in arrival order; the
	/// chunk may be rewritten in place
	async fn on_response_chunk(
		&mut self,
		_cx: &Exchange,
		_chunk: &mut BytesMut,
	) -> Result<(), anyhow::Error> {
		Ok(())
	}

	/// Called once when the client connection terminates
	async fn on_client_connection_close(&mut self, _cx: &Exchange) {}

	/// Called with each access-log record
	async fn on_access_log(&mut self, _entry: &AccessEntry) {}
}

/// An ordered plugin chain for one connection, with the union of the
/// plugins' capability masks
pub struct Chain {
	plugins: Vec<Box<dyn Plugin>>,
	mask: HookSet,
}

impl Chain {
	/// Build a chain from plugin instances, in dispatch order
	#[must_use]
	pub fn new(plugins: Vec<Box<dyn Plugin>>) -> Self {
		let mask = plugins
			.iter()
			.fold(HookSet::NONE, |mask, plugin| mask | plugin.hooks());

		Self { plugins, mask }
	}

	/// An empty chain
	#[must_use]
	pub fn empty() -> Self {
		Self::new(Vec::new())
	}

	/// Whether any plugin in the chain implements all hooks in `hooks`
	#[must_use]
	pub const fn has(&self, hooks: HookSet) -> bool {
		self.mask.contains(hooks)
	}

	/// Dispatch [`Plugin::before_upstream_connection`] in order. Errors are
	/// fail-closed.
	pub async fn before_upstream(&mut self, cx: &Exchange) -> Decision {
		if !self.has(HookSet::BEFORE_UPSTREAM) {
			return Decision::Continue;
		}

		for plugin in &mut self.plugins {
			if !plugin.hooks().contains(HookSet::BEFORE_UPSTREAM) {
				continue;
			}

			match plugin.before_upstream_connection(cx).await {
				Ok(Decision::Continue) => {}
				Ok(Decision::Reject) => return Decision::Reject,
				Err(err) => {
					warn!(
						plugin = plugin.name(),
						%err,
						"Plugin failed in before_upstream_connection, rejecting"
					);
					return Decision::Reject;
				}
			}
		}

		Decision::Continue
	}

	/// Dispatch [`Plugin::on_client_request`] in order; the first terminal
	/// outcome wins. Errors are fail-open.
	pub async fn client_request(
		&mut self,
		cx: &Exchange,
		req: &mut RequestHead,
	) -> RequestDecision {
		if !self.has(HookSet::CLIENT_REQUEST) {
			return RequestDecision::Continue;
		}

		for plugin in &mut self.plugins {
			if !plugin.hooks().contains(HookSet::CLIENT_REQUEST) {
				continue;
			}

			match plugin.on_client_request(cx, req).await {
				Ok(RequestDecision::Continue) => {}
				Ok(terminal) => return terminal,
				Err(err) => {
					error!(plugin = plugin.name(), %err, "Plugin crashed in on_client_request");
				}
			}
		}

		RequestDecision::Continue
	}

	/// Dispatch [`Plugin::on_client_request_body`] in order. Errors are
	/// fail-open.
	pub async fn request_chunk(&mut self, cx: &Exchange, chunk: &mut BytesMut) {
		for plugin in &mut self.plugins {
			if !plugin.hooks().contains(HookSet::REQUEST_BODY) {
				continue;
			}

			if let Err(err) = plugin.on_client_request_body(cx, chunk).await {
				error!(plugin = plugin.name(), %err, "Plugin crashed in on_client_request_body");
			}
		}
	}

	/// Dispatch [`Plugin::on_response_chunk`] in order. Errors are
	/// fail-open.
	pub async fn response_chunk(&mut self, cx: &Exchange, chunk: &mut BytesMut) {
		for plugin in &mut self.plugins {
			if !plugin.hooks().contains(HookSet::RESPONSE_CHUNK) {
				continue;
			}

			if let Err(err) = plugin.on_response_chunk(cx, chunk).await {
				error!(plugin = plugin.name(), %err, "Plugin crashed in on_response_chunk");
			}
		}
	}

	/// Dispatch [`Plugin::on_client_connection_close`] in order
	pub async fn connection_close(&mut self, cx: &Exchange) {
		if !self.has(HookSet::CONNECTION_CLOSE) {
			return;
		}

		for plugin in &mut self.plugins {
			if plugin.hooks().contains(HookSet::CONNECTION_CLOSE) {
				plugin.on_client_connection_close(cx).await;
			}
		}
	}

	/// Dispatch [`Plugin::on_access_log`] in order
	pub async fn access_log(&mut self, entry: &AccessEntry) {
		if !self.has(HookSet::ACCESS_LOG) {
			return;
		}

		for plugin in &mut self.plugins {
			if plugin.hooks().contains(HookSet::ACCESS_LOG) {
				plugin.on_access_log(entry).await;
			}
		}
	}
}

impl std::fmt::Debug for Chain {
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		fmt.debug_struct("Chain")
			.field(
				"plugins",
				&self.plugins.iter().map(|p| p.name()).collect::<Vec<_>>(),
			)
			.field("mask", &self.mask)
			.finish()
	}
}

/// A factory producing one plugin instance per connection
pub type Factory = Box<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// The ordered set of plugin factories resolved from the `plugins`
/// configuration option. The configured order defines dispatch (and thus
/// rewrite) precedence.
#[derive(Default)]
pub struct Registry {
	factories: Vec<Factory>,
}

impl Registry {
	/// Resolve plugin specifications (`name` or `name:args`) against the
	/// built-in plugins.
	///
	/// # Errors
	/// Returns an error for unknown names or invalid argument strings.
	pub fn from_specs(specs: &[String]) -> Result<Self, PluginError> {
		let mut factories: Vec<Factory> = Vec::with_capacity(specs.len());

		for spec in specs {
			let (name, args) = match spec.split_once(':') {
				Some((name, args)) => (name, args),
				None => (spec.as_str(), ""),
			};

			match name {
				"block-hosts" => {
					let hosts = BlockHosts::parse(name, args)?;
					factories.push(Box::new(move || Box::new(hosts.clone())));
				}
				"stamp-headers" => {
					let stamp = StampHeaders::parse(name, args)?;
					factories.push(Box::new(move || Box::new(stamp.clone())));
				}
				_ => return Err(PluginError::Unknown(name.to_string())),
			}
		}

		Ok(Self { factories })
	}

	/// Append a custom plugin factory to the dispatch order
	#[must_use]
	pub fn with_factory(mut self, factory: Factory) -> Self {
		self.factories.push(factory);
		self
	}

	/// Number of registered factories
	#[must_use]
	pub fn len(&self) -> usize {
		self.factories.len()
	}

	/// Whether no factories are registered
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.factories.is_empty()
	}

	/// Instantiate a fresh [`Chain`] for one connection
	#[must_use]
	pub fn build_chain(&self) -> Chain {
		Chain::new(self.factories.iter().map(|f| f()).collect())
	}
}

impl std::fmt::Debug for Registry {
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		fmt.debug_struct("Registry")
			.field("factories", &self.factories.len())
			.finish()
	}
}

/// Built-in plugin vetoing connections to listed hosts
/// (`block-hosts:bad.example,worse.example`)
#[derive(Debug, Clone)]
struct BlockHosts {
	hosts: Vec<String>,
}

impl BlockHosts {
	fn parse(name: &str, args: &str) -> Result<Self, PluginError> {
		let hosts: Vec<String> = args
			.split(',')
			.map(|h| h.trim().to_ascii_lowercase())
			.filter(|h| !h.is_empty())
			.collect();

		if hosts.is_empty() {
			return Err(PluginError::InvalidSpec(
				name.to_string(),
				"expected a comma-separated host list".to_string(),
			));
		}

		Ok(Self { hosts })
	}
}

#[async_trait]
impl Plugin for BlockHosts {
	fn name(&self) -> &'static str {
		"block-hosts"
	}

	fn hooks(&self) -> HookSet {
		HookSet::BEFORE_UPSTREAM
	}

	async fn before_upstream_connection(
		&mut self,
		cx: &Exchange,
	) -> Result<Decision, anyhow::Error> {
		if self.hosts.iter().any(|h| h == &cx.authority.host) {
			return Ok(Decision::Reject);
		}

		Ok(Decision::Continue)
	}
}

/// Built-in plugin appending fixed request headers
/// (`stamp-headers:X-Seen=1,X-Env=test`)
#[derive(Debug, Clone)]
struct StampHeaders {
	headers: Vec<(String, String)>,
}

impl StampHeaders {
	fn parse(name: &str, args: &str) -> Result<Self, PluginError> {
		let mut headers = Vec::new();

		for pair in args.split(',').filter(|p| !p.trim().is_empty()) {
			let (header, value) = pair.split_once('=').ok_or_else(|| {
				PluginError::InvalidSpec(
					name.to_string(),
					format!("expected Name=Value, got \"{pair}\""),
				)
			})?;

			headers.push((header.trim().to_string(), value.trim().to_string()));
		}

		if headers.is_empty() {
			return Err(PluginError::InvalidSpec(
				name.to_string(),
				"expected at least one Name=Value pair".to_string(),
			));
		}

		Ok(Self { headers })
	}
}

#[async_trait]
impl Plugin for StampHeaders {
	fn name(&self) -> &'static str {
		"stamp-headers"
	}

	fn hooks(&self) -> HookSet {
		HookSet::CLIENT_REQUEST
	}

	async fn on_client_request(
		&mut self,
		_cx: &Exchange,
		req: &mut RequestHead,
	) -> Result<RequestDecision, anyhow::Error> {
		for (name, value) in &self.headers {
			req.headers.append(name.clone(), value.clone());
		}

		Ok(RequestDecision::Continue)
	}
}

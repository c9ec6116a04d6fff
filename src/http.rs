//! HTTP/1.x message model and incremental parser.
//!
//! This module implements the interop subset of HTTP/1.0 and HTTP/1.1 that
//! real clients emit, not full RFC 7230 conformance. Heads are parsed
//! incrementally from a connection's in-buffer: the head terminator is
//! located first (tolerating LF-only line endings and unfolding obsolete
//! line folding), size limits are enforced, and the normalized head is then
//! validated with [`httparse`] before being converted into the owned
//! [`RequestHead`] / [`ResponseHead`] types. Serialization always emits
//! CRLF and preserves header order, spelling, and duplicates.

use std::fmt::{Display, Formatter, Result as FmtResult};

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Maximum number of headers accepted in one message head
const MAX_HEADERS: usize = 128;

/// Maximum length of a chunk-size line (hex digits plus extensions)
const MAX_CHUNK_SIZE_LINE: usize = 1024;

/// Maximum total size of chunked trailers
const MAX_TRAILERS: usize = 8 * 1024;

/// Maximum size of a single chunk in a chunked body
pub const MAX_CHUNK: u64 = 16 * 1024 * 1024;

/// The error returned when parsing a message fails. All variants map to
/// `400 Bad Request` towards the client (or a connection close when the
/// malformed message is a response).
#[derive(Debug, Error)]
pub enum ParseError {
	/// The request/status line exceeds the configured limit
	#[error("start line too long")]
	LineTooLong,
	/// The header block exceeds the configured limit
	#[error("header block too large")]
	HeadersTooLarge,
	/// A single header value exceeds the configured limit
	#[error("header value too long")]
	ValueTooLong,
	/// Both `Content-Length` and `Transfer-Encoding: chunked` are present
	#[error("conflicting body framing")]
	ConflictingFraming,
	/// A chunk-size line could not be parsed
	#[error("invalid chunk size")]
	BadChunkSize,
	/// A single chunk exceeds [`MAX_CHUNK`]
	#[error("chunk too large")]
	ChunkTooLarge,
	/// The message is structurally invalid
	#[error("malformed message: {0}")]
	Invalid(&'static str),
}

impl From<httparse::Error> for ParseError {
	fn from(err: httparse::Error) -> Self {
		match err {
			httparse::Error::TooManyHeaders => Self::HeadersTooLarge,
			_ => Self::Invalid("invalid message head"),
		}
	}
}

/// Parser size limits, configurable via the server configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
	/// Maximum request/status line length in bytes (excluding the line
	/// terminator)
	pub line: usize,
	/// Maximum total header block size in bytes
	pub headers: usize,
	/// Maximum single header value length in bytes
	pub value: usize,
}

impl Default for Limits {
	fn default() -> Self {
		Self {
			line: 8 * 1024,
			headers: 64 * 1024,
			value: 8 * 1024,
		}
	}
}

/// An HTTP protocol version. Only HTTP/1.0 and HTTP/1.1 are spoken; other
/// versions are rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
	/// HTTP/1.0
	Http10,
	/// HTTP/1.1
	Http11,
}

impl Display for Version {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		fmt.write_str(match self {
			Self::Http10 => "HTTP/1.0",
			Self::Http11 => "HTTP/1.1",
		})
	}
}

/// An ordered, case-preserving sequence of header name/value pairs with
/// case-insensitive lookup. Duplicate names are preserved in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
	entries: Vec<(String, String)>,
}

impl Headers {
	/// Create an empty header collection
	#[must_use]
	pub const fn new() -> Self {
		Self {
			entries: Vec::new(),
		}
	}

	/// Number of header entries (duplicates counted individually)
	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Whether the collection holds no headers
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Append a header, preserving its spelling
	pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
		self.entries.push((name.into(), value.into()));
	}

	/// Get the first value of the named header, if any
	#[must_use]
	pub fn get(&self, name: &str) -> Option<&str> {
		self.entries
			.iter()
			.find(|(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	/// Iterate over all values of the named header, in order
	pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
		self.entries
			.iter()
			.filter(move |(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	/// Whether the named header is present
	#[must_use]
	pub fn contains(&self, name: &str) -> bool {
		self.get(name).is_some()
	}

	/// Remove every occurrence of the named header, returning how many were
	/// removed
	pub fn remove(&mut self, name: &str) -> usize {
		let before = self.entries.len();
		self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
		before - self.entries.len()
	}

	/// Collect the comma-separated tokens of every occurrence of the named
	/// header, lowercased and trimmed
	#[must_use]
	pub fn token_list(&self, name: &str) -> Vec<String> {
		self.get_all(name)
			.flat_map(|v| v.split(','))
			.map(|t| t.trim().to_ascii_lowercase())
			.filter(|t| !t.is_empty())
			.collect()
	}

	/// Whether the named header's comma-separated token list contains the
	/// given token (case-insensitive)
	#[must_use]
	pub fn contains_token(&self, name: &str, token: &str) -> bool {
		self.token_list(name).iter().any(|t| t == token)
	}

	/// Iterate over all `(name, value)` pairs in order
	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
	}

	/// Serialize all headers as `Name: value\r\n` lines
	pub fn encode(&self, out: &mut BytesMut) {
		for (name, value) in &self.entries {
			out.put_slice(name.as_bytes());
			out.put_slice(b": ");
			out.put_slice(value.as_bytes());
			out.put_slice(b"\r\n");
		}
	}
}

impl<'a> IntoIterator for &'a Headers {
	type IntoIter = std::slice::Iter<'a, (String, String)>;
	type Item = &'a (String, String);

	fn into_iter(self) -> Self::IntoIter {
		self.entries.iter()
	}
}

/// A parsed request line plus headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
	/// The request method, case-preserved (methods are case-sensitive)
	pub method: String,
	/// The request target exactly as sent (origin, absolute, or authority
	/// form)
	pub target: String,
	/// The protocol version
	pub version: Version,
	/// The header block
	pub headers: Headers,
}

impl RequestHead {
	/// Serialize this head, always emitting CRLF line endings
	pub fn encode(&self, out: &mut BytesMut) {
		out.put_slice(self.method.as_bytes());
		out.put_u8(b' ');
		out.put_slice(self.target.as_bytes());
		out.put_u8(b' ');
		out.put_slice(self.version.to_string().as_bytes());
		out.put_slice(b"\r\n");
		self.headers.encode(out);
		out.put_slice(b"\r\n");
	}
}

/// A parsed status line plus headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
	/// The protocol version
	pub version: Version,
	/// The status code
	pub status: u16,
	/// The reason phrase (may be empty)
	pub reason: String,
	/// The header block
	pub headers: Headers,
}

impl ResponseHead {
	/// Serialize this head, always emitting CRLF line endings
	pub fn encode(&self, out: &mut BytesMut) {
		out.put_slice(self.version.to_string().as_bytes());
		out.put_u8(b' ');
		out.put_slice(self.status.to_string().as_bytes());
		if !self.reason.is_empty() {
			out.put_u8(b' ');
			out.put_slice(self.reason.as_bytes());
		}
		out.put_slice(b"\r\n");
		self.headers.encode(out);
		out.put_slice(b"\r\n");
	}
}

/// How a message body is framed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
	/// No body follows the head
	None,
	/// A body of exactly this many bytes follows
	Fixed(u64),
	/// A chunked body follows
	Chunked,
	/// The body runs until the peer closes the connection (responses only)
	UntilClose,
}

impl BodyKind {
	/// Whether any body bytes follow the head
	#[must_use]
	pub const fn has_body(self) -> bool {
		!matches!(self, Self::None)
	}
}

/// Determine the body framing of a request per the precedence
/// `Transfer-Encoding: chunked` > `Content-Length` > no body.
///
/// # Errors
/// Returns an error if both framings are present, `Content-Length` is not a
/// valid number (or duplicates disagree), or a non-chunked
/// `Transfer-Encoding` is used.
pub fn request_body_kind(head: &RequestHead) -> Result<BodyKind, ParseError> {
	body_kind_common(&head.headers).map(|kind| kind.unwrap_or(BodyKind::None))
}

/// Determine the body framing of a response to the given request method.
/// `1xx`, `204`, and `304` responses, and responses to `HEAD` and successful
/// `CONNECT` requests, have no body; otherwise the precedence is
/// `Transfer-Encoding: chunked` > `Content-Length` > until-close.
///
/// # Errors
/// Returns an error under the same conditions as [`request_body_kind`].
pub fn response_body_kind(req_method: &str, head: &ResponseHead) -> Result<BodyKind, ParseError> {
	if head.status / 100 == 1 || head.status == 204 || head.status == 304 {
		return Ok(BodyKind::None);
	}

	if req_method.eq_ignore_ascii_case("HEAD") {
		return Ok(BodyKind::None);
	}

	if req_method.eq_ignore_ascii_case("CONNECT") && head.status / 100 == 2 {
		return Ok(BodyKind::None);
	}

	body_kind_common(&head.headers).map(|kind| kind.unwrap_or(BodyKind::UntilClose))
}

/// The framing shared between requests and responses: `None` means neither
/// `Transfer-Encoding` nor `Content-Length` was present
fn body_kind_common(headers: &Headers) -> Result<Option<BodyKind>, ParseError> {
	let te_tokens = headers.token_list("transfer-encoding");
	let chunked = te_tokens.iter().any(|t| t == "chunked");

	if !te_tokens.is_empty() && !chunked {
		return Err(ParseError::Invalid("unsupported transfer-encoding"));
	}

	let mut content_length = None;
	for value in headers.get_all("content-length") {
		let parsed: u64 = value
			.trim()
			.parse()
			.map_err(|_| ParseError::Invalid("invalid content-length"))?;

		match content_length {
			None => content_length = Some(parsed),
			Some(prev) if prev == parsed => {}
			Some(_) => return Err(ParseError::Invalid("conflicting content-length")),
		}
	}

	match (chunked, content_length) {
		(true, Some(_)) => Err(ParseError::ConflictingFraming),
		(true, None) => Ok(Some(BodyKind::Chunked)),
		(false, Some(n)) => Ok(Some(BodyKind::Fixed(n))),
		(false, None) => Ok(None),
	}
}

/// Try to parse a request head from the front of `buf`. On success the head
/// bytes are consumed from `buf` (leaving any body bytes in place) and the
/// parsed head is returned; `None` means more input is needed.
///
/// # Errors
/// Returns an error if a limit is breached or the head is malformed.
pub fn parse_request(buf: &mut BytesMut, limits: &Limits) -> Result<Option<RequestHead>, ParseError> {
	let Some(end) = find_head_end(buf, limits)? else {
		return Ok(None);
	};

	let head = buf.split_to(end);
	let normalized = normalize_head(&head);

	let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
	let mut req = httparse::Request::new(&mut storage);

	match req.parse(&normalized)? {
		httparse::Status::Complete(_) => {}
		httparse::Status::Partial => return Err(ParseError::Invalid("truncated request head")),
	}

	let version = match req.version {
		Some(0) => Version::Http10,
		Some(1) => Version::Http11,
		_ => return Err(ParseError::Invalid("unsupported protocol version")),
	};

	Ok(Some(RequestHead {
		method: req
			.method
			.ok_or(ParseError::Invalid("missing method"))?
			.to_string(),
		target: req
			.path
			.ok_or(ParseError::Invalid("missing request target"))?
			.to_string(),
		version,
		headers: convert_headers(req.headers, limits)?,
	}))
}

/// Try to parse a response head from the front of `buf`, as
/// [`parse_request`] does for requests.
///
/// # Errors
/// Returns an error if a limit is breached or the head is malformed.
pub fn parse_response(
	buf: &mut BytesMut,
	limits: &Limits,
) -> Result<Option<ResponseHead>, ParseError> {
	let Some(end) = find_head_end(buf, limits)? else {
		return Ok(None);
	};

	let head = buf.split_to(end);
	let normalized = normalize_head(&head);

	let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
	let mut res = httparse::Response::new(&mut storage);

	match res.parse(&normalized)? {
		httparse::Status::Complete(_) => {}
		httparse::Status::Partial => return Err(ParseError::Invalid("truncated response head")),
	}

	let version = match res.version {
		Some(0) => Version::Http10,
		Some(1) => Version::Http11,
		_ => return Err(ParseError::Invalid("unsupported protocol version")),
	};

	Ok(Some(ResponseHead {
		version,
		status: res.code.ok_or(ParseError::Invalid("missing status code"))?,
		reason: res.reason.unwrap_or_default().to_string(),
		headers: convert_headers(res.headers, limits)?,
	}))
}

/// Locate the end of the message head (the index just past the blank line),
/// enforcing line and block limits on the way. Leading empty lines (stray
/// CRLFs between keep-alive requests) are tolerated.
fn find_head_end(buf: &[u8], limits: &Limits) -> Result<Option<usize>, ParseError> {
	let mut pos = 0;
	let mut first = true;

	loop {
		let Some(nl) = buf[pos..].iter().position(|&b| b == b'\n') else {
			let partial = buf.len() - pos;
			if first && partial > limits.line {
				return Err(ParseError::LineTooLong);
			}
			if buf.len() > limits.headers {
				return Err(ParseError::HeadersTooLarge);
			}
			return Ok(None);
		};

		let line_end = pos + nl;
		let content_end = if line_end > pos && buf[line_end - 1] == b'\r' {
			line_end - 1
		} else {
			line_end
		};
		let line_len = content_end - pos;

		if line_len == 0 {
			if first {
				// Stray blank line before the start line
				pos = line_end + 1;
				continue;
			}
			return Ok(Some(line_end + 1));
		}

		if first {
			if line_len > limits.line {
				return Err(ParseError::LineTooLong);
			}
			first = false;
		}

		pos = line_end + 1;

		if pos > limits.headers {
			return Err(ParseError::HeadersTooLarge);
		}
	}
}

/// Normalize a complete head for validation: emit CRLF line endings, drop
/// stray leading blank lines, and unfold obs-fold continuations with a
/// single space.
fn normalize_head(head: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(head.len() + 16);
	let mut seen_line = false;

	for line in head.split(|&b| b == b'\n') {
		let line = line.strip_suffix(b"\r").unwrap_or(line);

		if line.is_empty() {
			if seen_line {
				break;
			}
			continue;
		}

		if seen_line && (line[0] == b' ' || line[0] == b'\t') {
			// obs-fold: continuation of the previous header value
			out.truncate(out.len() - 2);
			out.push(b' ');
			out.extend_from_slice(trim_ascii_start(line));
		} else {
			out.extend_from_slice(line);
		}

		out.extend_from_slice(b"\r\n");
		seen_line = true;
	}

	out.extend_from_slice(b"\r\n");
	out
}

fn trim_ascii_start(mut bytes: &[u8]) -> &[u8] {
	while let [b' ' | b'\t', rest @ ..] = bytes {
		bytes = rest;
	}
	bytes
}

/// Convert httparse's borrowed headers into the owned [`Headers`] form,
/// enforcing the per-value limit
fn convert_headers(parsed: &[httparse::Header<'_>], limits: &Limits) -> Result<Headers, ParseError> {
	let mut headers = Headers::new();

	for header in parsed {
		let value = std::str::from_utf8(header.value)
			.map_err(|_| ParseError::Invalid("header value is not valid utf-8"))?;

		if value.len() > limits.value {
			return Err(ParseError::ValueTooLong);
		}

		headers.append(header.name, value);
	}

	Ok(headers)
}

/// A `host:port` pair, with the host lowercased
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Authority {
	/// The hostname, IPv4 address, or bracket-less IPv6 address, lowercased
	pub host: String,
	/// The TCP port
	pub port: u16,
}

impl Display for Authority {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		if self.host.contains(':') {
			write!(fmt, "[{}]:{}", self.host, self.port)
		} else {
			write!(fmt, "{}:{}", self.host, self.port)
		}
	}
}

/// Parse an authority (`host`, `host:port`, or `[v6]:port`) with the given
/// default port.
///
/// # Errors
/// Returns an error if the authority or port is syntactically invalid.
pub fn parse_authority(input: &str, default_port: u16) -> Result<Authority, ParseError> {
	const INVALID: ParseError = ParseError::Invalid("invalid authority");

	let (host, port) = if let Some(rest) = input.strip_prefix('[') {
		let (host, rest) = rest.split_once(']').ok_or(INVALID)?;
		let port = match rest.strip_prefix(':') {
			Some(p) => p.parse().map_err(|_| ParseError::Invalid("invalid port"))?,
			None if rest.is_empty() => default_port,
			None => return Err(INVALID),
		};
		(host, port)
	} else if let Some((host, port)) = input.rsplit_once(':') {
		(
			host,
			port.parse()
				.map_err(|_| ParseError::Invalid("invalid port"))?,
		)
	} else {
		(input, default_port)
	};

	if host.is_empty() {
		return Err(INVALID);
	}

	Ok(Authority {
		host: host.to_ascii_lowercase(),
		port,
	})
}

/// A classified request target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
	/// Origin form (`/path?query`, or `*`): the client treated the proxy as
	/// a direct server
	Origin(String),
	/// Absolute form (`http://host:port/path`): a forward-proxy request
	Absolute {
		/// The URL scheme, lowercased (only `http` is routable)
		scheme: String,
		/// The target authority
		authority: Authority,
		/// The origin-form remainder (always starts with `/`)
		origin_form: String,
	},
	/// Authority form (`host:port`): a CONNECT target
	Authority(Authority),
}

/// Classify a request target per its method and shape.
///
/// # Errors
/// Returns an error if the target does not parse as any known form.
pub fn parse_target(method: &str, target: &str) -> Result<Target, ParseError> {
	if method.eq_ignore_ascii_case("CONNECT") {
		return Ok(Target::Authority(parse_authority(target, 443)?));
	}

	if target.starts_with('/') || target == "*" {
		return Ok(Target::Origin(target.to_string()));
	}

	let (scheme, rest) = target
		.split_once("://")
		.ok_or(ParseError::Invalid("unrecognized request target"))?;
	let scheme = scheme.to_ascii_lowercase();

	let default_port = match scheme.as_str() {
		"http" => 80,
		"https" => 443,
		_ => return Err(ParseError::Invalid("unsupported scheme")),
	};

	let (raw_authority, origin_form) = match rest.find(['/', '?']) {
		Some(split) if rest.as_bytes()[split] == b'/' => {
			(&rest[..split], rest[split..].to_string())
		}
		Some(split) => (&rest[..split], format!("/{}", &rest[split..])),
		None => (rest, "/".to_string()),
	};

	Ok(Target::Absolute {
		scheme,
		authority: parse_authority(raw_authority, default_port)?,
		origin_form,
	})
}

/// Incremental decoder for `Transfer-Encoding: chunked` bodies.
///
/// [`decode`][Self::decode] consumes from a byte slice without draining it,
/// returning how many bytes it inspected so the caller can forward exactly
/// those raw bytes downstream while handing the decoded payload to plugins.
#[derive(Debug)]
pub struct ChunkedDecoder {
	state: ChunkState,
	remaining: u64,
	trailer_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
	Size,
	Data,
	DataEnd,
	Trailers,
	Done,
}

impl Default for ChunkedDecoder {
	fn default() -> Self {
		Self::new()
	}
}

impl ChunkedDecoder {
	/// Create a decoder positioned before the first chunk-size line
	#[must_use]
	pub const fn new() -> Self {
		Self {
			state: ChunkState::Size,
			remaining: 0,
			trailer_len: 0,
		}
	}

	/// Whether the final chunk and trailers have been fully consumed
	#[must_use]
	pub fn is_done(&self) -> bool {
		self.state == ChunkState::Done
	}

	/// Decode as much of `src` as possible, appending chunk payload bytes to
	/// `out`. Returns `(consumed, done)`: the number of bytes of `src`
	/// processed (the caller forwards exactly those) and whether the body is
	/// complete.
	///
	/// # Errors
	/// Returns an error on an invalid chunk-size line, a missing chunk
	/// terminator, an oversized chunk, or oversized trailers.
	pub fn decode(&mut self, src: &[u8], out: &mut BytesMut) -> Result<(usize, bool), ParseError> {
		let mut pos = 0;

		loop {
			match self.state {
				ChunkState::Size => {
					let Some(nl) = src[pos..].iter().position(|&b| b == b'\n') else {
						if src.len() - pos > MAX_CHUNK_SIZE_LINE {
							return Err(ParseError::BadChunkSize);
						}
						return Ok((pos, false));
					};

					let line = &src[pos..pos + nl];
					let line = line.strip_suffix(b"\r").unwrap_or(line);
					let size = parse_chunk_size(line)?;

					if size > MAX_CHUNK {
						return Err(ParseError::ChunkTooLarge);
					}

					pos += nl + 1;
					if size == 0 {
						self.state = ChunkState::Trailers;
					} else {
						self.remaining = size;
						self.state = ChunkState::Data;
					}
				}
				ChunkState::Data => {
					let available = src.len() - pos;
					if available == 0 {
						return Ok((pos, false));
					}

					let take =
						usize::try_from(self.remaining.min(available as u64)).unwrap_or(available);
					out.extend_from_slice(&src[pos..pos + take]);
					pos += take;
					self.remaining -= take as u64;

					if self.remaining == 0 {
						self.state = ChunkState::DataEnd;
					}
				}
				ChunkState::DataEnd => match src.get(pos) {
					None => return Ok((pos, false)),
					Some(b'\n') => {
						pos += 1;
						self.state = ChunkState::Size;
					}
					Some(b'\r') => match src.get(pos + 1) {
						None => return Ok((pos, false)),
						Some(b'\n') => {
							pos += 2;
							self.state = ChunkState::Size;
						}
						Some(_) => {
							return Err(ParseError::Invalid("chunk data not terminated by CRLF"))
						}
					},
					Some(_) => return Err(ParseError::Invalid("chunk data not terminated by CRLF")),
				},
				ChunkState::Trailers => {
					let Some(nl) = src[pos..].iter().position(|&b| b == b'\n') else {
						if self.trailer_len + (src.len() - pos) > MAX_TRAILERS {
							return Err(ParseError::HeadersTooLarge);
						}
						// Trailer bytes without a newline stay unconsumed
						return Ok((pos, false));
					};

					let line = &src[pos..pos + nl];
					let line = line.strip_suffix(b"\r").unwrap_or(line);

					self.trailer_len += nl + 1;
					if self.trailer_len > MAX_TRAILERS {
						return Err(ParseError::HeadersTooLarge);
					}

					pos += nl + 1;
					if line.is_empty() {
						self.state = ChunkState::Done;
					}
				}
				ChunkState::Done => return Ok((pos, true)),
			}
		}
	}
}

/// Parse the hex chunk size from a chunk-size line, ignoring any chunk
/// extensions after `;`
fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
	let hex = match line.iter().position(|&b| b == b';') {
		Some(split) => &line[..split],
		None => line,
	};
	let hex = std::str::from_utf8(hex)
		.map_err(|_| ParseError::BadChunkSize)?
		.trim();

	if hex.is_empty() || hex.len() > 16 {
		return Err(ParseError::BadChunkSize);
	}

	u64::from_str_radix(hex, 16).map_err(|_| ParseError::BadChunkSize)
}

/// Serialize one chunk of a chunked body
pub fn encode_chunk(payload: &[u8], out: &mut BytesMut) {
	out.put_slice(format!("{:x}\r\n", payload.len()).as_bytes());
	out.put_slice(payload);
	out.put_slice(b"\r\n");
}

/// Serialize the final (zero-length) chunk of a chunked body
pub fn encode_final_chunk(out: &mut BytesMut) {
	out.put_slice(b"0\r\n\r\n");
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse_req(input: &[u8]) -> Result<Option<RequestHead>, ParseError> {
		parse_request(&mut BytesMut::from(input), &Limits::default())
	}

	#[test]
	fn request_parse_basic() {
		let head = parse_req(b"GET http://example.test/hello HTTP/1.1\r\nHost: example.test\r\nProxy-Connection: keep-alive\r\n\r\n")
			.unwrap()
			.unwrap();

		assert_eq!(head.method, "GET");
		assert_eq!(head.target, "http://example.test/hello");
		assert_eq!(head.version, Version::Http11);
		assert_eq!(head.headers.get("host"), Some("example.test"));
		assert_eq!(head.headers.get("PROXY-CONNECTION"), Some("keep-alive"));
	}

	#[test]
	fn request_parse_incremental() {
		let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHo"[..]);
		assert!(parse_request(&mut buf, &Limits::default())
			.unwrap()
			.is_none());

		buf.extend_from_slice(b"st: a\r\n\r\nBODY");
		let head = parse_request(&mut buf, &Limits::default())
			.unwrap()
			.unwrap();
		assert_eq!(head.headers.get("Host"), Some("a"));
		// body bytes stay in the buffer
		assert_eq!(&buf[..], b"BODY");
	}

	#[test]
	fn request_parse_lf_only() {
		let head = parse_req(b"GET / HTTP/1.0\nHost: a\n\n").unwrap().unwrap();
		assert_eq!(head.version, Version::Http10);
		assert_eq!(head.headers.get("host"), Some("a"));
	}

	#[test]
	fn request_parse_obs_fold() {
		let head = parse_req(b"GET / HTTP/1.1\r\nX-Long: part one\r\n\tpart two\r\nHost: a\r\n\r\n")
			.unwrap()
			.unwrap();
		assert_eq!(head.headers.get("x-long"), Some("part one part two"));
		assert_eq!(head.headers.get("host"), Some("a"));
	}

	#[test]
	fn request_preserves_duplicates_and_order() {
		let head = parse_req(b"GET / HTTP/1.1\r\nX-A: 1\r\nX-B: 2\r\nX-A: 3\r\n\r\n")
			.unwrap()
			.unwrap();

		let names: Vec<_> = head.headers.iter().map(|(n, _)| n).collect();
		assert_eq!(names, ["X-A", "X-B", "X-A"]);
		assert_eq!(head.headers.get_all("x-a").collect::<Vec<_>>(), ["1", "3"]);
	}

	#[test]
	fn request_line_limit_boundary() {
		let limits = Limits::default();

		// A request line of exactly `limits.line` bytes parses
		let target_len = limits.line - "GET  HTTP/1.1".len();
		let ok = format!(
			"GET /{} HTTP/1.1\r\nHost: a\r\n\r\n",
			"x".repeat(target_len - 1)
		);
		assert!(parse_req(ok.as_bytes()).unwrap().is_some());

		// One more byte breaches the limit
		let bad = format!(
			"GET /{} HTTP/1.1\r\nHost: a\r\n\r\n",
			"x".repeat(target_len)
		);
		assert!(matches!(
			parse_req(bad.as_bytes()),
			Err(ParseError::LineTooLong)
		));

		// The limit applies even before a newline arrives
		let partial = "G".repeat(limits.line + 1);
		assert!(matches!(
			parse_req(partial.as_bytes()),
			Err(ParseError::LineTooLong)
		));
	}

	#[test]
	fn header_block_limit() {
		let limits = Limits::default();
		let mut big = String::from("GET / HTTP/1.1\r\n");
		for i in 0..(limits.headers / 16) {
			big.push_str(&format!("X-{i:06}: aaaa\r\n"));
		}

		assert!(matches!(
			parse_req(big.as_bytes()),
			Err(ParseError::HeadersTooLarge)
		));
	}

	#[test]
	fn response_parse_and_encode_round_trip() {
		let mut buf = BytesMut::from(
			&b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nX-Mixed-Case: Kept\r\n\r\nhi"[..],
		);
		let head = parse_response(&mut buf, &Limits::default())
			.unwrap()
			.unwrap();

		assert_eq!(head.status, 200);
		assert_eq!(head.reason, "OK");
		assert_eq!(&buf[..], b"hi");

		let mut out = BytesMut::new();
		head.encode(&mut out);
		assert_eq!(
			&out[..],
			b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nX-Mixed-Case: Kept\r\n\r\n"
		);

		// Re-parsing the serialized head yields an equivalent message
		let again = parse_response(&mut out, &Limits::default())
			.unwrap()
			.unwrap();
		assert_eq!(again, head);
	}

	#[test]
	fn request_encode_round_trip() {
		let head = parse_req(b"POST /submit HTTP/1.1\r\nHost: a\r\nX-A: 1\r\nX-A: 2\r\n\r\n")
			.unwrap()
			.unwrap();

		let mut out = BytesMut::new();
		head.encode(&mut out);
		let again = parse_request(&mut out, &Limits::default())
			.unwrap()
			.unwrap();
		assert_eq!(again, head);
	}

	#[test]
	fn framing_precedence() {
		let chunked = parse_req(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
			.unwrap()
			.unwrap();
		assert_eq!(request_body_kind(&chunked).unwrap(), BodyKind::Chunked);

		let fixed = parse_req(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n")
			.unwrap()
			.unwrap();
		assert_eq!(request_body_kind(&fixed).unwrap(), BodyKind::Fixed(10));

		let neither = parse_req(b"GET / HTTP/1.1\r\n\r\n").unwrap().unwrap();
		assert_eq!(request_body_kind(&neither).unwrap(), BodyKind::None);

		let both = parse_req(
			b"POST / HTTP/1.1\r\nContent-Length: 10\r\nTransfer-Encoding: chunked\r\n\r\n",
		)
		.unwrap()
		.unwrap();
		assert!(matches!(
			request_body_kind(&both),
			Err(ParseError::ConflictingFraming)
		));
	}

	#[test]
	fn response_until_close() {
		let mut buf = BytesMut::from(&b"HTTP/1.0 200 OK\r\n\r\nrest"[..]);
		let head = parse_response(&mut buf, &Limits::default())
			.unwrap()
			.unwrap();
		assert_eq!(
			response_body_kind("GET", &head).unwrap(),
			BodyKind::UntilClose
		);
		assert_eq!(response_body_kind("HEAD", &head).unwrap(), BodyKind::None);
	}

	#[test]
	fn authority_forms() {
		assert_eq!(
			parse_authority("Example.Test:8080", 80).unwrap(),
			Authority {
				host: "example.test".into(),
				port: 8080
			}
		);
		assert_eq!(
			parse_authority("example.test", 443).unwrap(),
			Authority {
				host: "example.test".into(),
				port: 443
			}
		);
		assert_eq!(
			parse_authority("[::1]:8443", 443).unwrap(),
			Authority {
				host: "::1".into(),
				port: 8443
			}
		);
		assert!(parse_authority("example.test:notaport", 80).is_err());
		assert!(parse_authority("", 80).is_err());
	}

	#[test]
	fn target_forms() {
		assert_eq!(
			parse_target("CONNECT", "example.test:443").unwrap(),
			Target::Authority(Authority {
				host: "example.test".into(),
				port: 443
			})
		);

		assert_eq!(
			parse_target("GET", "/hello?x=1").unwrap(),
			Target::Origin("/hello?x=1".into())
		);

		let Target::Absolute {
			scheme,
			authority,
			origin_form,
		} = parse_target("GET", "http://Example.Test/hello?x=1").unwrap()
		else {
			panic!("expected absolute form");
		};
		assert_eq!(scheme, "http");
		assert_eq!(authority.host, "example.test");
		assert_eq!(authority.port, 80);
		assert_eq!(origin_form, "/hello?x=1");

		assert!(parse_target("GET", "ftp://example.test/").is_err());
		assert!(parse_target("GET", "garbage").is_err());
	}

	#[test]
	fn chunked_decode_simple() {
		let mut dec = ChunkedDecoder::new();
		let mut out = BytesMut::new();

		let input = b"5\r\nhello\r\n0\r\n\r\n";
		let (consumed, done) = dec.decode(input, &mut out).unwrap();

		assert_eq!(consumed, input.len());
		assert!(done);
		assert_eq!(&out[..], b"hello");
	}

	#[test]
	fn chunked_decode_split_across_reads() {
		let mut dec = ChunkedDecoder::new();
		let mut out = BytesMut::new();
		let mut buf = BytesMut::from(&b"5\r\nhe"[..]);

		let (consumed, done) = dec.decode(&buf, &mut out).unwrap();
		assert_eq!(consumed, 5);
		assert!(!done);
		let _ = buf.split_to(consumed);

		buf.extend_from_slice(b"llo\r\n0\r\n\r\n");
		let (consumed, done) = dec.decode(&buf, &mut out).unwrap();
		assert_eq!(consumed, buf.len());
		assert!(done);
		assert_eq!(&out[..], b"hello");
	}

	#[test]
	fn chunked_decode_extensions_and_trailers() {
		let mut dec = ChunkedDecoder::new();
		let mut out = BytesMut::new();

		let input = b"5;name=value\r\nhello\r\n0\r\nX-Trailer: t\r\n\r\n";
		let (consumed, done) = dec.decode(input, &mut out).unwrap();

		assert_eq!(consumed, input.len());
		assert!(done);
		assert_eq!(&out[..], b"hello");
	}

	#[test]
	fn chunked_size_boundary() {
		// A chunk of exactly MAX_CHUNK is accepted
		let header = format!("{MAX_CHUNK:x}\r\n");
		let mut dec = ChunkedDecoder::new();
		let mut out = BytesMut::new();
		let (consumed, done) = dec.decode(header.as_bytes(), &mut out).unwrap();
		assert_eq!(consumed, header.len());
		assert!(!done);

		// One byte more is rejected
		let header = format!("{:x}\r\n", MAX_CHUNK + 1);
		let mut dec = ChunkedDecoder::new();
		assert!(matches!(
			dec.decode(header.as_bytes(), &mut out),
			Err(ParseError::ChunkTooLarge)
		));
	}

	#[test]
	fn chunked_rejects_garbage() {
		let mut out = BytesMut::new();

		assert!(matches!(
			ChunkedDecoder::new().decode(b"zz\r\n", &mut out),
			Err(ParseError::BadChunkSize)
		));

		assert!(matches!(
			ChunkedDecoder::new().decode(b"2\r\nhiXX", &mut out),
			Err(ParseError::Invalid(_))
		));
	}

	#[test]
	fn chunk_encode() {
		let mut out = BytesMut::new();
		encode_chunk(b"hello", &mut out);
		encode_final_chunk(&mut out);
		assert_eq!(&out[..], b"5\r\nhello\r\n0\r\n\r\n");
	}
}

//! Buffered connections over arbitrary async transports.
//!
//! A [`Conn`] wraps a transport (a TCP stream or a TLS session) behind a
//! trait object together with bounded in/out buffers, so the protocol state
//! machine is transport-agnostic. Reads stop at the in-buffer cap and
//! writes drain through the transport whenever the out-buffer cap is
//! reached, which is how backpressure propagates between the two sides of a
//! proxied connection.

use std::{
	io::{Error as IoError, ErrorKind, Result as IoResult},
	pin::Pin,
	task::{Context, Poll},
	time::Duration,
};

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// The transport a [`Conn`] reads from and writes to. Blanket-implemented
/// for every async byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> Transport for T {}

/// A buffered connection endpoint with bounded in/out buffers.
pub struct Conn {
	io: Box<dyn Transport>,
	rbuf: BytesMut,
	rcap: usize,
	wbuf: BytesMut,
	wcap: usize,
	eof: bool,
	write_closed: bool,
}

impl Conn {
	/// Wrap a transport with the given in/out buffer caps
	pub fn new(io: impl Transport + 'static, rcap: usize, wcap: usize) -> Self {
		Self {
			io: Box::new(io),
			rbuf: BytesMut::with_capacity(rcap.min(16 * 1024)),
			rcap,
			wbuf: BytesMut::new(),
			wcap,
			eof: false,
			write_closed: false,
		}
	}

	/// Take the connection apart, returning the transport and any
	/// already-buffered (read but unconsumed) bytes. The out-buffer must be
	/// flushed first.
	#[must_use]
	pub fn into_parts(self) -> (Box<dyn Transport>, BytesMut) {
		debug_assert!(self.wbuf.is_empty(), "into_parts with unflushed output");
		(self.io, self.rbuf)
	}

	/// The in-buffer, holding bytes read from the transport but not yet
	/// consumed by the protocol layer
	pub fn buffer(&mut self) -> &mut BytesMut {
		&mut self.rbuf
	}

	/// Whether the peer has closed its write side (EOF was observed)
	#[must_use]
	pub const fn is_eof(&self) -> bool {
		self.eof
	}

	/// Whether there are unconsumed bytes in the in-buffer
	#[must_use]
	pub fn has_buffered(&self) -> bool {
		!self.rbuf.is_empty()
	}

	/// Read once from the transport into the in-buffer, up to the buffer
	/// cap. Returns the number of bytes read; `0` means either EOF (check
	/// [`is_eof`][Self::is_eof]) or a full buffer. Interrupted reads are
	/// retried; any other error is terminal.
	///
	/// # Errors
	/// Returns the underlying I/O error, which marks this connection dead.
	pub async fn fill(&mut self) -> IoResult<usize> {
		let room = self.rcap.saturating_sub(self.rbuf.len());
		if room == 0 || self.eof {
			return Ok(0);
		}

		loop {
			match self.io.read_buf(&mut (&mut self.rbuf).limit(room)).await {
				Ok(0) => {
					self.eof = true;
					return Ok(0);
				}
				Ok(n) => return Ok(n),
				Err(err) if err.kind() == ErrorKind::Interrupted => {}
				Err(err) => return Err(err),
			}
		}
	}

	/// Write all of `data` through the out-buffer, flushing to the
	/// transport whenever the cap is reached. The tail of `data` may remain
	/// buffered; call [`flush`][Self::flush] to force it out.
	///
	/// # Errors
	/// Returns the underlying I/O error, which marks this connection dead.
	pub async fn write_all(&mut self, mut data: &[u8]) -> IoResult<()> {
		while !data.is_empty() {
			let room = self.wcap.saturating_sub(self.wbuf.len());
			if room == 0 {
				self.flush().await?;
				continue;
			}

			let take = room.min(data.len());
			self.wbuf.extend_from_slice(&data[..take]);
			data = &data[take..];
		}

		Ok(())
	}

	/// Push the out-buffer to the transport until it is empty.
	///
	/// # Errors
	/// Returns the underlying I/O error, which marks this connection dead.
	pub async fn flush(&mut self) -> IoResult<()> {
		while self.wbuf.has_remaining() {
			self.io.write_all_buf(&mut self.wbuf).await?;
		}
		self.io.flush().await
	}

	/// Flush any buffered output and close the write side of the transport
	/// (sends FIN, or `close_notify` for TLS). The read side stays usable
	/// for draining the peer.
	///
	/// # Errors
	/// Returns the underlying I/O error.
	pub async fn finish(&mut self) -> IoResult<()> {
		if self.write_closed {
			return Ok(());
		}
		self.flush().await?;
		self.write_closed = true;
		self.io.shutdown().await
	}
}

impl std::fmt::Debug for Conn {
	fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		fmt.debug_struct("Conn")
			.field("buffered_in", &self.rbuf.len())
			.field("buffered_out", &self.wbuf.len())
			.field("eof", &self.eof)
			.field("write_closed", &self.write_closed)
			.finish_non_exhaustive()
	}
}

/// Relay raw bytes between two connections until both have reached EOF,
/// honoring half-close: when one side closes, the other direction keeps
/// draining until its own EOF. Already-buffered bytes on either side are
/// forwarded first. `idle` bounds the time between bytes in either
/// direction.
///
/// # Errors
/// Returns `ErrorKind::TimedOut` when the idle timer fires, or the first
/// terminal transport error.
pub async fn splice(a: &mut Conn, b: &mut Conn, idle: Duration) -> IoResult<()> {
	loop {
		if a.has_buffered() {
			let data = a.rbuf.split();
			b.write_all(&data).await?;
			b.flush().await?;
		}

		if b.has_buffered() {
			let data = b.rbuf.split();
			a.write_all(&data).await?;
			a.flush().await?;
		}

		if a.is_eof() && !b.write_closed {
			b.finish().await?;
		}

		if b.is_eof() && !a.write_closed {
			a.finish().await?;
		}

		if a.is_eof() && b.is_eof() {
			return Ok(());
		}

		let wait = async {
			tokio::select! {
				res = a.fill(), if !a.is_eof() => res,
				res = b.fill(), if !b.is_eof() => res,
			}
		};

		match tokio::time::timeout(idle, wait).await {
			Ok(res) => {
				res?;
			}
			Err(_) => return Err(IoError::new(ErrorKind::TimedOut, "tunnel idle timeout")),
		}
	}
}

/// A transport that replays a prefix of already-read bytes before reading
/// from the inner transport. Writes pass straight through. Used when a
/// connection must be handed to a TLS acceptor after some post-head bytes
/// were already buffered.
pub struct Rewind {
	prefix: BytesMut,
	inner: Box<dyn Transport>,
}

impl Rewind {
	/// Wrap `inner`, replaying `prefix` before its own bytes
	#[must_use]
	pub fn new(prefix: BytesMut, inner: Box<dyn Transport>) -> Self {
		Self { prefix, inner }
	}
}

impl AsyncRead for Rewind {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<IoResult<()>> {
		if !self.prefix.is_empty() {
			let take = self.prefix.len().min(buf.remaining());
			buf.put_slice(&self.prefix.split_to(take));
			return Poll::Ready(Ok(()));
		}

		Pin::new(&mut self.inner).poll_read(cx, buf)
	}
}

impl AsyncWrite for Rewind {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		data: &[u8],
	) -> Poll<Result<usize, IoError>> {
		Pin::new(&mut self.inner).poll_write(cx, data)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::AsyncWriteExt;

	use super::*;

	#[tokio::test]
	async fn fill_respects_cap() {
		let (local, mut remote) = tokio::io::duplex(1024);
		let mut conn = Conn::new(local, 8, 8);

		remote.write_all(b"0123456789abcdef").await.unwrap();

		let n = conn.fill().await.unwrap();
		assert_eq!(n, 8);
		assert_eq!(&conn.buffer()[..], b"01234567");

		// Buffer is full, fill is a no-op
		assert_eq!(conn.fill().await.unwrap(), 0);
		assert!(!conn.is_eof());

		// Consuming makes room again
		let _ = conn.buffer().split_to(8);
		assert_eq!(conn.fill().await.unwrap(), 8);
		assert_eq!(&conn.buffer()[..], b"89abcdef");
	}

	#[tokio::test]
	async fn write_all_chunks_through_small_buffer() {
		let (local, mut remote) = tokio::io::duplex(1024);
		let mut conn = Conn::new(local, 8, 4);

		conn.write_all(b"hello world").await.unwrap();
		conn.flush().await.unwrap();
		drop(conn);

		let mut received = Vec::new();
		tokio::io::AsyncReadExt::read_to_end(&mut remote, &mut received)
			.await
			.unwrap();
		assert_eq!(received, b"hello world");
	}

	#[tokio::test]
	async fn eof_detection() {
		let (local, remote) = tokio::io::duplex(1024);
		let mut conn = Conn::new(local, 8, 8);

		drop(remote);
		assert_eq!(conn.fill().await.unwrap(), 0);
		assert!(conn.is_eof());
	}

	#[tokio::test]
	async fn rewind_replays_prefix_first() {
		let (local, mut remote) = tokio::io::duplex(1024);
		let mut conn = Conn::new(
			Rewind::new(BytesMut::from(&b"head"[..]), Box::new(local)),
			64,
			64,
		);

		remote.write_all(b"tail").await.unwrap();

		conn.fill().await.unwrap();
		conn.fill().await.unwrap();
		assert_eq!(&conn.buffer()[..], b"headtail");
	}

	#[tokio::test]
	async fn splice_relays_and_half_closes() {
		let (a_local, mut a_remote) = tokio::io::duplex(1024);
		let (b_local, mut b_remote) = tokio::io::duplex(1024);

		let mut a = Conn::new(a_local, 64, 64);
		let mut b = Conn::new(b_local, 64, 64);

		let relay = tokio::spawn(async move {
			splice(&mut a, &mut b, Duration::from_secs(5)).await.unwrap();
		});

		a_remote.write_all(b"ping").await.unwrap();
		let mut buf = [0_u8; 4];
		tokio::io::AsyncReadExt::read_exact(&mut b_remote, &mut buf)
			.await
			.unwrap();
		assert_eq!(&buf, b"ping");

		b_remote.write_all(b"pong").await.unwrap();
		tokio::io::AsyncReadExt::read_exact(&mut a_remote, &mut buf)
			.await
			.unwrap();
		assert_eq!(&buf, b"pong");

		// Closing one side half-closes the other direction; closing both
		// ends the relay
		a_remote.shutdown().await.unwrap();
		b_remote.shutdown().await.unwrap();

		relay.await.unwrap();
	}
}

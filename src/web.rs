//! The embedded web-server collaborator.
//!
//! When a request arrives on the listening socket in origin form (the
//! client treated the proxy as a direct server) and the web server is
//! enabled, the proxy core hands the parsed request head and the client
//! connection to a [`WebServer`] implementation and relinquishes the work
//! unit. The built-in [`StatusPage`] exists to exercise that hand-off; it
//! is not a web framework.

use std::io::Result as IoResult;

use async_trait::async_trait;
use bytes::BytesMut;

use crate::{
	conn::Conn,
	http::{Headers, RequestHead, ResponseHead, Version},
	util::SERVER_NAME,
};

/// A collaborator handling origin-form requests addressed directly to the
/// proxy. The implementation owns the connection for the rest of its life.
#[async_trait]
pub trait WebServer: Send + Sync {
	/// Handle one origin-form request on the given client connection.
	///
	/// # Errors
	/// Returns an error if writing the response fails; the connection is
	/// closed either way.
	async fn handle(&self, req: RequestHead, conn: &mut Conn) -> IoResult<()>;
}

/// The built-in web collaborator: a one-line status page on `/`, `404`
/// everywhere else
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusPage;

#[async_trait]
impl WebServer for StatusPage {
	async fn handle(&self, req: RequestHead, conn: &mut Conn) -> IoResult<()> {
		let (status, reason, body) = if req.target == "/" || req.target.starts_with("/?") {
			(200, "OK", format!("{SERVER_NAME} is running\n"))
		} else {
			(404, "Not Found", String::from("not found\n"))
		};

		let mut headers = Headers::new();
		headers.append("Content-Type", "text/plain; charset=utf-8");
		headers.append("Content-Length", body.len().to_string());
		headers.append("Connection", "close");

		let head = ResponseHead {
			version: Version::Http11,
			status,
			reason: reason.to_string(),
			headers,
		};

		let mut out = BytesMut::new();
		head.encode(&mut out);
		out.extend_from_slice(body.as_bytes());

		conn.write_all(&out).await?;
		conn.finish().await
	}
}

//! End to end tests of plain (non-tunneled) forward proxying.

mod util;

use std::{
	io::Write,
	time::{Duration, Instant},
};

/// A well-formed forward-proxy request reaches the upstream in origin form
/// with hop-by-hop headers stripped, the response comes back byte-identical,
/// and the connection stays open for a second request.
#[test]
#[serial_test::serial]
fn forward_proxy_and_keep_alive() {
	let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi".to_vec();
	let upstream = util::start_upstream(vec![
		(b"\r\n\r\n".to_vec(), response.clone()),
		(b"\r\n\r\n".to_vec(), response.clone()),
	]);

	let (port, _proxy) = util::start_proxy(&[]);
	let mut client = util::connect_proxy(port);

	let host = format!("127.0.0.1:{}", upstream.port);
	client
		.write_all(
			format!(
				"GET http://{host}/hello HTTP/1.1\r\nHost: {host}\r\nProxy-Connection: keep-alive\r\n\r\n"
			)
			.as_bytes(),
		)
		.unwrap();

	// The upstream sees exactly the origin-form request with
	// Proxy-Connection stripped
	let seen = upstream.received.recv_timeout(Duration::from_secs(5)).unwrap();
	assert_eq!(
		String::from_utf8(seen).unwrap(),
		format!("GET /hello HTTP/1.1\r\nHost: {host}\r\n\r\n")
	);

	// The client sees the upstream response unchanged
	let got = util::read_exact(&mut client, response.len());
	assert_eq!(got, response);

	// The connection is still usable for a second request
	client
		.write_all(format!("GET http://{host}/again HTTP/1.1\r\nHost: {host}\r\n\r\n").as_bytes())
		.unwrap();

	let seen = upstream.received.recv_timeout(Duration::from_secs(5)).unwrap();
	assert_eq!(
		String::from_utf8(seen).unwrap(),
		format!("GET /again HTTP/1.1\r\nHost: {host}\r\n\r\n")
	);

	let got = util::read_exact(&mut client, response.len());
	assert_eq!(got, response);
}

/// A chunked request body is delivered to the upstream byte-identical
#[test]
#[serial_test::serial]
fn chunked_passthrough() {
	let response = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec();
	let upstream = util::start_upstream(vec![(b"0\r\n\r\n".to_vec(), response.clone())]);

	let (port, _proxy) = util::start_proxy(&[]);
	let mut client = util::connect_proxy(port);

	let host = format!("127.0.0.1:{}", upstream.port);
	client
		.write_all(
			format!(
				"POST http://{host}/upload HTTP/1.1\r\nHost: {host}\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n"
			)
			.as_bytes(),
		)
		.unwrap();

	let seen = upstream.received.recv_timeout(Duration::from_secs(5)).unwrap();
	let seen = String::from_utf8(seen).unwrap();

	assert!(seen.contains("Transfer-Encoding: chunked\r\n"));
	assert!(seen.ends_with("\r\n\r\n5\r\nhello\r\n0\r\n\r\n"));

	let got = util::read_exact(&mut client, response.len());
	assert_eq!(got, response);
}

/// With basic-auth configured, a request without credentials gets a 407
/// challenge and the connection closes; valid credentials pass through
#[test]
#[serial_test::serial]
fn proxy_authentication() {
	let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi".to_vec();
	let upstream = util::start_upstream(vec![(b"\r\n\r\n".to_vec(), response.clone())]);

	let (port, _proxy) = util::start_proxy(&["--basic-auth", "user:pass"]);
	let host = format!("127.0.0.1:{}", upstream.port);

	// No credentials: 407 + challenge, then close
	let mut client = util::connect_proxy(port);
	client
		.write_all(format!("GET http://{host}/ HTTP/1.1\r\nHost: {host}\r\n\r\n").as_bytes())
		.unwrap();

	let got = String::from_utf8(util::read_to_end(&mut client)).unwrap();
	assert!(got.starts_with("HTTP/1.1 407 "));
	assert!(got.contains("Proxy-Authenticate: Basic realm=\"burrow\"\r\n"));

	// `user:pass` base64-encoded
	let mut client = util::connect_proxy(port);
	client
		.write_all(
			format!(
				"GET http://{host}/ HTTP/1.1\r\nHost: {host}\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\n"
			)
			.as_bytes(),
		)
		.unwrap();

	let seen = upstream.received.recv_timeout(Duration::from_secs(5)).unwrap();
	assert!(String::from_utf8(seen)
		.unwrap()
		.starts_with("GET / HTTP/1.1\r\n"));

	let got = util::read_exact(&mut client, response.len());
	assert_eq!(got, response);
}

/// A CONNECT to an unreachable upstream yields a 502 within the connect
/// timeout
#[test]
#[serial_test::serial]
fn upstream_unreachable() {
	let (port, _proxy) = util::start_proxy(&[]);
	let mut client = util::connect_proxy(port);

	// A just-released ephemeral port refuses connections
	let dead_port = util::free_port();
	client
		.write_all(
			format!("CONNECT 127.0.0.1:{dead_port} HTTP/1.1\r\nHost: 127.0.0.1:{dead_port}\r\n\r\n")
				.as_bytes(),
		)
		.unwrap();

	let got = String::from_utf8(util::read_to_end(&mut client)).unwrap();
	assert!(got.starts_with("HTTP/1.1 502 "), "got: {got}");
}

/// A stalled request head is answered with a 408 when the idle timer fires
#[test]
#[serial_test::serial]
fn client_timeout() {
	let (port, _proxy) = util::start_proxy(&["--timeout", "1"]);
	let mut client = util::connect_proxy(port);

	client.write_all(b"GET http://example.test/ HT").unwrap();

	let start = Instant::now();
	let got = String::from_utf8(util::read_to_end(&mut client)).unwrap();
	let elapsed = start.elapsed();

	assert!(got.starts_with("HTTP/1.1 408 "), "got: {got}");
	assert!(elapsed >= Duration::from_millis(500), "fired after {elapsed:?}");
	assert!(elapsed <= Duration::from_secs(3), "fired after {elapsed:?}");
}

/// Origin-form requests go to the embedded web server when it is enabled,
/// and are rejected with a 400 otherwise
#[test]
#[serial_test::serial]
fn origin_form_requests() {
	let (port, _proxy) = util::start_proxy(&["--enable-web-server", "true"]);
	let mut client = util::connect_proxy(port);

	client
		.write_all(b"GET / HTTP/1.1\r\nHost: proxy\r\n\r\n")
		.unwrap();

	let got = String::from_utf8(util::read_to_end(&mut client)).unwrap();
	assert!(got.starts_with("HTTP/1.1 200 OK\r\n"));
	assert!(got.contains("is running"));

	let (port, _proxy) = util::start_proxy(&[]);
	let mut client = util::connect_proxy(port);

	client
		.write_all(b"GET / HTTP/1.1\r\nHost: proxy\r\n\r\n")
		.unwrap();

	let got = String::from_utf8(util::read_to_end(&mut client)).unwrap();
	assert!(got.starts_with("HTTP/1.1 400 "), "got: {got}");
}

/// A plugin-synthesized header is observed by the upstream
#[test]
#[serial_test::serial]
fn stamp_headers_plugin_rewrites_request() {
	let response = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec();
	let upstream = util::start_upstream(vec![(b"\r\n\r\n".to_vec(), response.clone())]);

	let (port, _proxy) =
		util::start_proxy(&["--plugins", r#"["stamp-headers:X-Seen=1"]"#]);
	let mut client = util::connect_proxy(port);

	let host = format!("127.0.0.1:{}", upstream.port);
	client
		.write_all(format!("GET http://{host}/ HTTP/1.1\r\nHost: {host}\r\n\r\n").as_bytes())
		.unwrap();

	let seen = upstream.received.recv_timeout(Duration::from_secs(5)).unwrap();
	assert!(String::from_utf8(seen).unwrap().contains("X-Seen: 1\r\n"));

	let got = util::read_exact(&mut client, response.len());
	assert_eq!(got, response);
}

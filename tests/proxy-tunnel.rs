//! End to end tests of CONNECT tunneling (without TLS interception).

mod util;

use std::io::Write;

/// A CONNECT tunnel relays bytes in both directions unchanged
#[test]
#[serial_test::serial]
fn connect_tunnel_relays_raw_bytes() {
	let upstream_port = util::start_echo_upstream();
	let (port, _proxy) = util::start_proxy(&[]);

	let mut client = util::connect_proxy(port);
	client
		.write_all(
			format!(
				"CONNECT 127.0.0.1:{upstream_port} HTTP/1.1\r\nHost: 127.0.0.1:{upstream_port}\r\n\r\n"
			)
			.as_bytes(),
		)
		.unwrap();

	let established = util::read_exact(&mut client, 39);
	assert_eq!(
		established,
		b"HTTP/1.1 200 Connection Established\r\n\r\n"
	);

	// Bytes after the 200 are opaque to the proxy; the echo server returns
	// them unchanged (these are deliberately not HTTP)
	client.write_all(b"\x16\x03\x01raw bytes").unwrap();
	let echoed = util::read_exact(&mut client, 12);
	assert_eq!(&echoed, b"\x16\x03\x01raw bytes");

	client.write_all(b"second round").unwrap();
	let echoed = util::read_exact(&mut client, 12);
	assert_eq!(&echoed, b"second round");
}

/// The block-hosts plugin vetoes CONNECTs before any upstream connection is
/// made; the client connection just closes
#[test]
#[serial_test::serial]
fn block_hosts_plugin_rejects_connect() {
	let upstream_port = util::start_echo_upstream();
	let (port, _proxy) = util::start_proxy(&["--plugins", r#"["block-hosts:127.0.0.1"]"#]);

	let mut client = util::connect_proxy(port);
	client
		.write_all(
			format!(
				"CONNECT 127.0.0.1:{upstream_port} HTTP/1.1\r\nHost: 127.0.0.1:{upstream_port}\r\n\r\n"
			)
			.as_bytes(),
		)
		.unwrap();

	// A veto closes the connection without a response
	let got = util::read_to_end(&mut client);
	assert!(got.is_empty(), "got: {got:?}");
}

/// With disable-http-proxy set, a plain request is replayed verbatim to the
/// target host and the connection becomes a blind splice
#[test]
#[serial_test::serial]
fn disable_http_proxy_routes_raw() {
	let upstream_port = util::start_echo_upstream();
	let (port, _proxy) = util::start_proxy(&["--disable-http-proxy", "true"]);

	let mut client = util::connect_proxy(port);
	let host = format!("127.0.0.1:{upstream_port}");
	let request = format!("GET http://{host}/echo HTTP/1.1\r\nHost: {host}\r\n\r\n");

	client.write_all(request.as_bytes()).unwrap();

	// The echo upstream returns the head verbatim, proving it was not
	// parsed or rewritten on the way through
	let echoed = util::read_exact(&mut client, request.len());
	assert_eq!(String::from_utf8(echoed).unwrap(), request);
}

//! End to end tests of TLS interception (MITM) on CONNECT tunnels.

mod util;

use std::{fs, sync::Arc, time::Duration};

use burrow::certs::CaAuthority;
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpListener,
	sync::mpsc,
};
use tokio_rustls::{rustls::ServerConfig, TlsAcceptor};

/// Start a TLS origin server with a self-signed identity for `localhost`.
/// It accepts one connection, reports the decrypted request head, and
/// answers `200` with body `hi`.
async fn start_tls_upstream() -> (u16, mpsc::UnboundedReceiver<String>) {
	let (origin_ca, _, _) = CaAuthority::generate("origin test CA", 7).unwrap();
	let minted = origin_ca.mint("localhost").unwrap();

	let certs = rustls_pemfile::certs(&mut minted.cert_pem.as_bytes())
		.collect::<Result<Vec<_>, _>>()
		.unwrap();
	let key = rustls_pemfile::pkcs8_private_keys(&mut minted.key_pem.as_bytes())
		.next()
		.unwrap()
		.unwrap();

	let mut config = ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key.into())
		.unwrap();
	config.alpn_protocols = vec![b"http/1.1".to_vec()];
	let acceptor = TlsAcceptor::from(Arc::new(config));

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	let (tx, rx) = mpsc::unbounded_channel();

	tokio::spawn(async move {
		let (stream, _) = listener.accept().await.unwrap();
		let mut stream = acceptor.accept(stream).await.unwrap();

		let mut head = Vec::new();
		let mut byte = [0_u8; 1];
		while !head.ends_with(b"\r\n\r\n") {
			if stream.read(&mut byte).await.unwrap() == 0 {
				break;
			}
			head.push(byte[0]);
		}

		tx.send(String::from_utf8(head).unwrap()).unwrap();

		stream
			.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi")
			.await
			.unwrap();
		stream.shutdown().await.unwrap();
	});

	(port, rx)
}

/// A CONNECT through the intercepting proxy is terminated with a leaf
/// minted from the configured CA, the decrypted request is visible to
/// plugins (the upstream observes the stamped header), and the response
/// comes back re-encrypted. The minted leaf lands in the on-disk mirror.
#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn mitm_intercepts_connect() {
	let dir = tempfile::tempdir().unwrap();

	let (_ca, ca_pem, ca_key_pem) = CaAuthority::generate("burrow test CA", 7).unwrap();
	let ca_cert_path = dir.path().join("ca.pem");
	let ca_key_path = dir.path().join("ca.key.pem");
	let leaf_dir = dir.path().join("leafs");
	fs::write(&ca_cert_path, &ca_pem).unwrap();
	fs::write(&ca_key_path, &ca_key_pem).unwrap();

	let (upstream_port, mut seen_rx) = start_tls_upstream().await;

	let ca_cert_arg = ca_cert_path.display().to_string();
	let ca_key_arg = ca_key_path.display().to_string();
	let leaf_dir_arg = leaf_dir.display().to_string();

	let (port, _proxy) = util::start_proxy(&[
		"--ca-cert-file",
		&ca_cert_arg,
		"--ca-key-file",
		&ca_key_arg,
		"--ca-cert-dir",
		&leaf_dir_arg,
		"--tls-insecure-upstream",
		"true",
		"--plugins",
		r#"["stamp-headers:X-Seen=1"]"#,
	]);

	let client = reqwest::Client::builder()
		.proxy(reqwest::Proxy::all(format!("http://127.0.0.1:{port}")).unwrap())
		.add_root_certificate(reqwest::Certificate::from_pem(ca_pem.as_bytes()).unwrap())
		.build()
		.unwrap();

	let response = client
		.get(format!("https://localhost:{upstream_port}/"))
		.send()
		.await
		.unwrap();

	assert_eq!(response.status(), reqwest::StatusCode::OK);
	assert_eq!(response.text().await.unwrap(), "hi");

	// The upstream observed the decrypted, plugin-stamped request
	let seen = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
		.await
		.unwrap()
		.unwrap();
	assert!(seen.starts_with("GET / HTTP/1.1\r\n"), "seen: {seen}");
	assert!(seen.contains("X-Seen: 1\r\n"), "seen: {seen}");

	// The leaf for localhost was mirrored to disk
	assert!(leaf_dir.join("localhost.pem").exists());
}

/// Hosts outside the interception list are tunneled blindly even when CA
/// material is configured
#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn interception_respects_host_policy() {
	let dir = tempfile::tempdir().unwrap();

	let (_ca, ca_pem, ca_key_pem) = CaAuthority::generate("burrow test CA", 7).unwrap();
	let ca_cert_path = dir.path().join("ca.pem");
	let ca_key_path = dir.path().join("ca.key.pem");
	fs::write(&ca_cert_path, &ca_pem).unwrap();
	fs::write(&ca_key_path, &ca_key_pem).unwrap();

	let ca_cert_arg = ca_cert_path.display().to_string();
	let ca_key_arg = ca_key_path.display().to_string();

	// Only picked.test is intercepted; our target is not on the list
	let (port, _proxy) = util::start_proxy(&[
		"--ca-cert-file",
		&ca_cert_arg,
		"--ca-key-file",
		&ca_key_arg,
		"--tls-intercept-hosts",
		r#"["picked.test"]"#,
	]);

	let upstream_port = util::start_echo_upstream();

	let (mut client, established) = tokio::task::spawn_blocking(move || {
		use std::io::Write;

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
		(client, established)
	})
	.await
	.unwrap();

	assert_eq!(
		established,
		b"HTTP/1.1 200 Connection Established\r\n\r\n"
	);

	// The tunnel is a blind splice: raw bytes come back from the echo
	// server unchanged instead of a TLS handshake being attempted
	tokio::task::spawn_blocking(move || {
		use std::io::Write;

		client.write_all(b"not a client hello").unwrap();
		let echoed = util::read_exact(&mut client, 18);
		assert_eq!(&echoed, b"not a client hello");
	})
	.await
	.unwrap();
}

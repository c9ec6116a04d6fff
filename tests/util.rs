//! Utilities for end-to-end tests of the burrow proxy server

use std::{
	io::{Read, Write},
	net::{TcpListener, TcpStream},
	process::{Child, Command},
	sync::mpsc,
	thread,
	time::{Duration, Instant},
};

/// Run a function automatically on drop. The provided function can only be
/// called once (either with `call()` or automatically on drop).
#[must_use]
pub struct Terminator<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Terminator<F> {
	pub fn new(f: F) -> Self {
		Self(Some(f))
	}

	pub fn call(&mut self) {
		if let Some(f) = self.0.take() {
			f()
		}
	}
}

impl<F: FnOnce()> Drop for Terminator<F> {
	fn drop(&mut self) {
		self.call();
	}
}

/// Pick a free TCP port on localhost
#[allow(dead_code)] // False positive, this function is used in tests, just not *all* of them
pub fn free_port() -> u16 {
	TcpListener::bind("127.0.0.1:0")
		.unwrap()
		.local_addr()
		.unwrap()
		.port()
}

/// Start the burrow proxy server in the background on a free port with the
/// given extra command-line arguments. Returns the listening port and a
/// guard that kills the server process when dropped.
#[allow(dead_code)] // False positive, this function is used in tests, just not *all* of them
pub fn start_proxy(extra_args: &[&str]) -> (u16, Terminator<impl FnOnce()>) {
	let port = free_port();

	let mut cmd = Command::new(env!("CARGO_BIN_EXE_server"));
	cmd.args([
		"--hostname",
		"127.0.0.1",
		"--port",
		&port.to_string(),
		"--log-level",
		"warn",
	]);
	cmd.args(extra_args);

	let mut server: Child = cmd.spawn().unwrap();

	// Wait until the listening socket is up
	let deadline = Instant::now() + Duration::from_secs(5);
	loop {
		if TcpStream::connect(("127.0.0.1", port)).is_ok() {
			break;
		}
		assert!(
			Instant::now() < deadline,
			"proxy server did not start listening"
		);
		thread::sleep(Duration::from_millis(25));
	}

	let kill_server = move || {
		server.kill().expect("could not kill server process");
		server.wait().expect("could not wait on server process");
	};

	(port, Terminator::new(kill_server))
}

/// Connect to the proxy under test
#[allow(dead_code)] // False positive, this function is used in tests, just not *all* of them
pub fn connect_proxy(port: u16) -> TcpStream {
	let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
	stream
		.set_read_timeout(Some(Duration::from_secs(10)))
		.unwrap();
	stream
}

/// A scripted in-test origin server: for each `(read_until, response)` step
/// it reads from the accepted connection until the captured bytes end with
/// the marker, reports the captured bytes, and writes the response.
#[allow(dead_code)] // False positive, this struct is used in tests, just not *all* of them
pub struct Upstream {
	pub port: u16,
	pub received: mpsc::Receiver<Vec<u8>>,
}

#[allow(dead_code)] // False positive, this function is used in tests, just not *all* of them
pub fn start_upstream(script: Vec<(Vec<u8>, Vec<u8>)>) -> Upstream {
	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	let port = listener.local_addr().unwrap().port();
	let (tx, rx) = mpsc::channel();

	thread::spawn(move || {
		let (mut stream, _) = listener.accept().unwrap();
		stream
			.set_read_timeout(Some(Duration::from_secs(10)))
			.unwrap();

		for (marker, response) in script {
			let mut captured = Vec::new();
			let mut byte = [0_u8; 1];

			while !captured.ends_with(&marker) {
				match stream.read(&mut byte) {
					Ok(0) => break,
					Ok(_) => captured.push(byte[0]),
					Err(_) => break,
				}
			}

			tx.send(captured).unwrap();
			stream.write_all(&response).unwrap();
		}
	});

	Upstream { port, received: rx }
}

/// An in-test echo server: accepts one connection and writes every received
/// byte straight back until EOF.
#[allow(dead_code)] // False positive, this function is used in tests, just not *all* of them
pub fn start_echo_upstream() -> u16 {
	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	let port = listener.local_addr().unwrap().port();

	thread::spawn(move || {
		let (mut stream, _) = listener.accept().unwrap();
		let mut buf = [0_u8; 4096];

		loop {
			match stream.read(&mut buf) {
				Ok(0) | Err(_) => break,
				Ok(n) => {
					if stream.write_all(&buf[..n]).is_err() {
						break;
					}
				}
			}
		}
	});

	port
}

/// Read from the stream until it closes, returning everything received
#[allow(dead_code)] // False positive, this function is used in tests, just not *all* of them
pub fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
	let mut out = Vec::new();
	let _ = stream.read_to_end(&mut out);
	out
}

/// Read exactly `n` bytes from the stream
#[allow(dead_code)] // False positive, this function is used in tests, just not *all* of them
pub fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
	let mut out = vec![0_u8; n];
	stream.read_exact(&mut out).unwrap();
	out
}

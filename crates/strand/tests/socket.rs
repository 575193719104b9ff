mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use common::{EchoListener, Ev, Probe, await_ev, core, listen_addr, wait_state};
use parking_lot::Mutex;
use strand::{Error, Family, Socket, SocketHandler, State};

/// Client side of the echo scenario: writes once, collects the echo, then
/// closes gracefully.
struct EchoClient {
	payload: &'static [u8],
	sent: AtomicBool,
	got: Mutex<Vec<u8>>,
	tx: Mutex<mpsc::Sender<&'static str>>,
}

impl EchoClient {
	fn new(payload: &'static [u8]) -> (Arc<EchoClient>, mpsc::Receiver<&'static str>) {
		let (tx, rx) = mpsc::channel();
		(
			Arc::new(EchoClient {
				payload,
				sent: AtomicBool::new(false),
				got: Mutex::new(Vec::new()),
				tx: Mutex::new(tx),
			}),
			rx,
		)
	}
}

impl SocketHandler for EchoClient {
	fn on_writable(&self, s: &Socket) {
		if !self.sent.swap(true, Ordering::SeqCst) {
			s.write(self.payload).unwrap();
		}
	}

	fn on_readable(&self, s: &Socket) {
		let mut buf = [0u8; 1024];
		loop {
			match s.read(&mut buf) {
				Ok(0) => break,
				Ok(n) => self.got.lock().extend_from_slice(&buf[..n]),
				Err(_) => break,
			}
		}
		if self.got.lock().as_slice() == self.payload {
			let _ = self.tx.lock().send("echoed");
			s.close();
		}
	}

	fn on_closed(&self, _s: &Socket) {
		let _ = self.tx.lock().send("closed");
	}
}

#[test]
fn echo_round_trip_and_single_close_each_side() {
	let core = core();
	let listener = Socket::new(&core);
	let (server, server_rx) = EchoListener::new();
	listener.set_handler(server);
	listener.listen("127.0.0.1:0").unwrap();
	let addr = listen_addr(&listener);

	let client = Socket::new(&core);
	let (handler, client_rx) = EchoClient::new(b"hello");
	client.set_handler(handler);
	client.connect(&addr).unwrap();

	assert_eq!(client_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "echoed");
	assert_eq!(client_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "closed");

	// The accepted socket sees exactly one close, out of CONNECTED.
	await_ev(&server_rx, Duration::from_secs(5), |e| {
		matches!(e, Ev::Closed)
	});
	std::thread::sleep(Duration::from_millis(100));
	let leftovers: Vec<Ev> = server_rx.try_iter().collect();
	assert!(
		!leftovers.iter().any(|e| matches!(e, Ev::Closed)),
		"{leftovers:?}"
	);
	assert!(!client_rx.try_iter().any(|m| m == "closed"));

	core.shutdown();
}

#[test]
fn connect_states_progress_in_order() {
	let core = core();
	let listener = Socket::new(&core);
	let (server, _server_rx) = EchoListener::new();
	listener.set_handler(server);
	listener.listen("127.0.0.1:0").unwrap();
	let addr = listen_addr(&listener);

	let client = Socket::new(&core);
	let (probe, rx) = Probe::new();
	client.set_handler(probe);
	client.connect(&addr).unwrap();
	wait_state(&client, State::Connected, Duration::from_secs(5));
	// Let the final state-change emission land in the channel.
	std::thread::sleep(Duration::from_millis(100));

	let states: Vec<(State, State)> = rx
		.try_iter()
		.filter_map(|e| match e {
			Ev::State(a, b) => Some((a, b)),
			_ => None,
		})
		.collect();
	assert_eq!(
		states,
		vec![
			(State::Closed, State::Resolving),
			(State::Resolving, State::Connecting),
			(State::Connecting, State::Connected),
		]
	);
	core.shutdown();
}

#[test]
fn zero_byte_operations_are_noops() {
	let core = core();
	let listener = Socket::new(&core);
	let (server, _server_rx) = EchoListener::new();
	listener.set_handler(server);
	listener.listen("127.0.0.1:0").unwrap();
	let addr = listen_addr(&listener);

	let client = Socket::new(&core);
	let (probe, _rx) = Probe::new();
	client.set_handler(probe);
	client.connect(&addr).unwrap();
	wait_state(&client, State::Connected, Duration::from_secs(5));

	let mut empty = [0u8; 0];
	assert_eq!(client.read(&mut empty).unwrap(), 0);
	assert_eq!(client.write(b"").unwrap(), 0);
	assert_eq!(client.bytes_sent(), 0);
	core.shutdown();
}

#[test]
fn unread_then_read_returns_pushback_before_stream() {
	let core = core();
	let listener = Socket::new(&core);
	let (server, _server_rx) = EchoListener::new();
	listener.set_handler(server);
	listener.listen("127.0.0.1:0").unwrap();
	let addr = listen_addr(&listener);

	let client = Socket::new(&core);
	let (probe, rx) = Probe::new();
	client.set_handler(probe);
	client.connect(&addr).unwrap();
	wait_state(&client, State::Connected, Duration::from_secs(5));

	// Echo server returns what we write.
	client.write(b"cd").unwrap();
	await_ev(&rx, Duration::from_secs(5), |e| matches!(e, Ev::Readable));

	client.unread(b"ab").unwrap();
	let mut buf = [0u8; 8];
	let mut got = Vec::new();
	while got.len() < 4 {
		let n = client.read(&mut buf).unwrap();
		if n == 0 {
			std::thread::sleep(Duration::from_millis(5));
			continue;
		}
		got.extend_from_slice(&buf[..n]);
	}
	assert_eq!(&got, b"abcd");
	core.shutdown();
}

#[test]
fn connect_to_dead_port_is_refused() {
	let core = core();
	// Grab a port that nothing listens on.
	let port = {
		let tmp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		tmp.local_addr().unwrap().port()
	};
	let client = Socket::new(&core);
	let (probe, rx) = Probe::new();
	client.set_handler(probe);
	client.connect(&format!("127.0.0.1:{port}")).unwrap();

	let ev = await_ev(&rx, Duration::from_secs(5), |e| matches!(e, Ev::Error(_)));
	let Ev::Error(msg) = ev else { unreachable!() };
	assert!(msg.contains("refused"), "{msg}");
	await_ev(&rx, Duration::from_secs(5), |e| matches!(e, Ev::Closed));
	assert_eq!(client.state(), State::Closed);
	core.shutdown();
}

#[test]
fn family_mismatch_closes_with_invalid_address() {
	let core = core();
	let client = Socket::new(&core);
	client.set_family(Some(Family::Ipv6));
	let (probe, rx) = Probe::new();
	client.set_handler(probe);
	client.connect("127.0.0.1:9").unwrap();

	let ev = await_ev(&rx, Duration::from_secs(5), |e| matches!(e, Ev::Error(_)));
	let Ev::Error(msg) = ev else { unreachable!() };
	assert!(msg.contains("invalid address"), "{msg}");
	await_ev(&rx, Duration::from_secs(5), |e| matches!(e, Ev::Closed));
	core.shutdown();
}

#[test]
fn second_lifecycle_operation_is_rejected() {
	let core = core();
	let listener = Socket::new(&core);
	let (server, _server_rx) = EchoListener::new();
	listener.set_handler(server);
	listener.listen("127.0.0.1:0").unwrap();
	assert!(matches!(
		listener.listen("127.0.0.1:0"),
		Err(Error::AlreadyActive)
	));
	core.shutdown();
}

#[test]
fn bind_then_listen_bound_accepts_clients() {
	let core = core();
	let listener = Socket::new(&core);
	let (server, _server_rx) = EchoListener::new();
	listener.set_handler(server);
	listener.bind("127.0.0.1:0").unwrap();
	wait_state(&listener, State::Bound, Duration::from_secs(5));
	listener.listen_bound().unwrap();
	let addr = listen_addr(&listener);

	let client = Socket::new(&core);
	let (handler, client_rx) = EchoClient::new(b"bound");
	client.set_handler(handler);
	client.connect(&addr).unwrap();
	assert_eq!(client_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "echoed");
	core.shutdown();
}

#[cfg(unix)]
#[test]
fn unix_socket_echo() {
	let core = core();
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("echo.sock");
	let spec = path.display().to_string();

	let listener = Socket::new(&core);
	let (server, _server_rx) = EchoListener::new();
	listener.set_handler(server);
	listener.listen(&spec).unwrap();
	wait_state(&listener, State::Listening, Duration::from_secs(5));

	let client = Socket::new(&core);
	let (handler, client_rx) = EchoClient::new(b"over unix");
	client.set_handler(handler);
	client.connect(&spec).unwrap();
	assert_eq!(client_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "echoed");
	core.shutdown();
}

/// A handler that refuses to read until the test drains the socket itself.
struct SilentReader {
	tx: Mutex<mpsc::Sender<Ev>>,
}

impl SocketHandler for SilentReader {
	fn on_readable(&self, _s: &Socket) {
		let _ = self.tx.lock().send(Ev::Readable);
	}

	fn on_closed(&self, _s: &Socket) {
		let _ = self.tx.lock().send(Ev::Closed);
	}
}

struct SilentListener {
	children: Mutex<Vec<Socket>>,
	tx: Mutex<mpsc::Sender<Ev>>,
}

impl SocketHandler for SilentListener {
	fn on_accept(&self, _l: &Socket, accepted: Socket) {
		accepted.set_handler(Arc::new(SilentReader {
			tx: Mutex::new(self.tx.lock().clone()),
		}));
		self.children.lock().push(accepted);
	}
}

#[test]
fn hangup_with_pending_bytes_defers_close_until_drained() {
	let core = core();
	let (tx, rx) = mpsc::channel();
	let listener = Socket::new(&core);
	let server = Arc::new(SilentListener {
		children: Mutex::new(Vec::new()),
		tx: Mutex::new(tx),
	});
	listener.set_handler(server.clone());
	listener.listen("127.0.0.1:0").unwrap();
	let addr = listen_addr(&listener);

	let client = Socket::new(&core);
	let (probe, _client_rx) = Probe::new();
	client.set_handler(probe);
	client.connect(&addr).unwrap();
	wait_state(&client, State::Connected, Duration::from_secs(5));
	client.write(b"tail").unwrap();
	client.close();

	// The server learns about the data (and the hang-up nudge) but must not
	// close while bytes are undelivered.
	await_ev(&rx, Duration::from_secs(5), |e| matches!(e, Ev::Readable));
	std::thread::sleep(Duration::from_millis(200));
	let child = server.children.lock()[0].clone();
	assert!(
		matches!(child.state(), State::Connected),
		"close must be deferred while input is pending, state={:?}",
		child.state()
	);

	// Drain from the test thread; EOF then delivers the close.
	let mut got = Vec::new();
	let mut buf = [0u8; 16];
	let deadline = std::time::Instant::now() + Duration::from_secs(5);
	while got.len() < 4 && std::time::Instant::now() < deadline {
		match child.read(&mut buf) {
			Ok(0) => std::thread::sleep(Duration::from_millis(5)),
			Ok(n) => got.extend_from_slice(&buf[..n]),
			Err(_) => break,
		}
	}
	assert_eq!(&got, b"tail");
	// Keep reading until the EOF converts into a close.
	let deadline = std::time::Instant::now() + Duration::from_secs(5);
	while child.state() != State::Closed && std::time::Instant::now() < deadline {
		let _ = child.read(&mut buf);
		std::thread::sleep(Duration::from_millis(5));
	}
	assert_eq!(child.state(), State::Closed);
	await_ev(&rx, Duration::from_secs(5), |e| matches!(e, Ev::Closed));
	core.shutdown();
}

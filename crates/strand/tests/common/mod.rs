#![allow(dead_code)]

use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strand::{Address, Config, Core, Error, Socket, SocketHandler, State};

pub fn init() {
	strand_core::telemetry::setup_logging();
}

pub fn core() -> Arc<Core> {
	init();
	Core::with_config(Config::default()).expect("core")
}

/// Socket events flattened for channel-based assertions.
#[derive(Debug, Clone)]
pub enum Ev {
	State(State, State),
	Readable,
	Writable,
	Accepted(Socket),
	Closed,
	Error(String),
}

/// Forwards every socket event into an mpsc channel.
pub struct Probe {
	tx: Mutex<mpsc::Sender<Ev>>,
}

impl Probe {
	pub fn new() -> (Arc<Probe>, mpsc::Receiver<Ev>) {
		let (tx, rx) = mpsc::channel();
		(
			Arc::new(Probe {
				tx: Mutex::new(tx),
			}),
			rx,
		)
	}

	fn send(&self, ev: Ev) {
		let _ = self.tx.lock().send(ev);
	}
}

impl SocketHandler for Probe {
	fn on_state_changed(&self, _s: &Socket, old: State, new: State) {
		self.send(Ev::State(old, new));
	}

	fn on_readable(&self, _s: &Socket) {
		self.send(Ev::Readable);
	}

	fn on_writable(&self, _s: &Socket) {
		self.send(Ev::Writable);
	}

	fn on_accept(&self, _s: &Socket, accepted: Socket) {
		self.send(Ev::Accepted(accepted));
	}

	fn on_closed(&self, _s: &Socket) {
		self.send(Ev::Closed);
	}

	fn on_error(&self, _s: &Socket, error: &Error) {
		self.send(Ev::Error(error.to_string()));
	}
}

/// Echoes everything it reads back to the sender.
pub struct Echo;

impl SocketHandler for Echo {
	fn on_readable(&self, s: &Socket) {
		let mut buf = [0u8; 4096];
		loop {
			match s.read(&mut buf) {
				Ok(0) => break,
				Ok(n) => {
					let _ = s.write(&buf[..n]);
				},
				Err(_) => break,
			}
		}
	}
}

/// Listener handler that keeps accepted children alive, echoes on them, and
/// reports their lifecycle events.
pub struct EchoListener {
	pub children: Mutex<Vec<Socket>>,
	pub child_events: Mutex<mpsc::Sender<Ev>>,
}

impl EchoListener {
	pub fn new() -> (Arc<EchoListener>, mpsc::Receiver<Ev>) {
		let (tx, rx) = mpsc::channel();
		(
			Arc::new(EchoListener {
				children: Mutex::new(Vec::new()),
				child_events: Mutex::new(tx),
			}),
			rx,
		)
	}
}

struct EchoChild {
	tx: Mutex<mpsc::Sender<Ev>>,
}

impl SocketHandler for EchoChild {
	fn on_state_changed(&self, _s: &Socket, old: State, new: State) {
		let _ = self.tx.lock().send(Ev::State(old, new));
	}

	fn on_readable(&self, s: &Socket) {
		let mut buf = [0u8; 4096];
		loop {
			match s.read(&mut buf) {
				Ok(0) => break,
				Ok(n) => {
					let _ = s.write(&buf[..n]);
				},
				Err(_) => break,
			}
		}
	}

	fn on_closed(&self, _s: &Socket) {
		let _ = self.tx.lock().send(Ev::Closed);
	}
}

impl SocketHandler for EchoListener {
	fn on_accept(&self, _listener: &Socket, accepted: Socket) {
		accepted.set_handler(Arc::new(EchoChild {
			tx: Mutex::new(self.child_events.lock().clone()),
		}));
		self.children.lock().push(accepted);
	}
}

pub fn wait_state(socket: &Socket, want: State, timeout: Duration) {
	let deadline = Instant::now() + timeout;
	while socket.state() != want {
		assert!(
			Instant::now() < deadline,
			"socket never reached {want:?}, stuck in {:?}",
			socket.state()
		);
		std::thread::sleep(Duration::from_millis(5));
	}
}

pub fn listen_addr(socket: &Socket) -> String {
	wait_state(socket, State::Listening, Duration::from_secs(5));
	match socket.local_addr() {
		Some(Address::Inet(sa)) => format!("{sa}"),
		Some(Address::Local(p)) => p.display().to_string(),
		None => panic!("listener has no local address"),
	}
}

/// Wait for a specific event kind, skipping others.
pub fn await_ev(
	rx: &mpsc::Receiver<Ev>,
	timeout: Duration,
	mut want: impl FnMut(&Ev) -> bool,
) -> Ev {
	let deadline = Instant::now() + timeout;
	loop {
		let left = deadline
			.checked_duration_since(Instant::now())
			.expect("timed out waiting for event");
		let ev = rx.recv_timeout(left).expect("timed out waiting for event");
		if want(&ev) {
			return ev;
		}
	}
}

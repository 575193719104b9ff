use std::collections::HashMap;
use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

/// Readiness condition bitmask. A bit set in a socket's `cond` means the
/// socket is currently known ready in that direction; it stays set until an
/// operation reports would-block (edge-triggered discipline).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cond(u8);

impl Cond {
	pub const NONE: Cond = Cond(0);
	pub const IN: Cond = Cond(1);
	pub const OUT: Cond = Cond(1 << 1);
	pub const HUP: Cond = Cond(1 << 2);
	pub const ERR: Cond = Cond(1 << 3);

	pub fn contains(self, other: Cond) -> bool {
		self.0 & other.0 == other.0
	}

	pub fn intersects(self, other: Cond) -> bool {
		self.0 & other.0 != 0
	}

	pub fn is_empty(self) -> bool {
		self.0 == 0
	}

	fn from_event(ev: &Event) -> Cond {
		let mut cond = Cond::NONE;
		if ev.is_readable() {
			cond |= Cond::IN;
		}
		if ev.is_writable() {
			cond |= Cond::OUT;
		}
		if ev.is_read_closed() || ev.is_write_closed() {
			cond |= Cond::HUP;
		}
		if ev.is_error() {
			cond |= Cond::ERR;
		}
		cond
	}

	fn interest(self) -> Option<Interest> {
		match (self.contains(Cond::IN), self.contains(Cond::OUT)) {
			(true, true) => Some(Interest::READABLE | Interest::WRITABLE),
			(true, false) => Some(Interest::READABLE),
			(false, true) => Some(Interest::WRITABLE),
			// HUP/ERR are always reported; they cannot be registered for alone.
			(false, false) => None,
		}
	}
}

impl BitOr for Cond {
	type Output = Cond;
	fn bitor(self, rhs: Cond) -> Cond {
		Cond(self.0 | rhs.0)
	}
}
impl BitOrAssign for Cond {
	fn bitor_assign(&mut self, rhs: Cond) {
		self.0 |= rhs.0;
	}
}
impl BitAnd for Cond {
	type Output = Cond;
	fn bitand(self, rhs: Cond) -> Cond {
		Cond(self.0 & rhs.0)
	}
}
impl Not for Cond {
	type Output = Cond;
	fn not(self) -> Cond {
		Cond(!self.0 & 0xf)
	}
}

/// Identifies one watched source within the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchToken(Token);

type WatchFn = Arc<dyn Fn(Cond) + Send + Sync>;

const WAKER: Token = Token(0);

/// One OS-level readiness engine owned by a dedicated thread.
///
/// mio delivers edge-triggered notifications: a transition is reported once
/// and must be assumed to persist until an operation reports would-block.
/// Watch callbacks run on the reactor thread and must only coalesce the
/// observed bits and hand off to a scheduler; all real work happens there.
pub struct Reactor {
	registry: Registry,
	waker: Waker,
	watchers: Arc<Mutex<HashMap<Token, WatchFn>>>,
	next_token: AtomicUsize,
	stop: Arc<AtomicBool>,
	thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Reactor {
	pub fn new() -> io::Result<Arc<Reactor>> {
		let poll = Poll::new()?;
		let registry = poll.registry().try_clone()?;
		let waker = Waker::new(poll.registry(), WAKER)?;
		let watchers: Arc<Mutex<HashMap<Token, WatchFn>>> = Arc::new(Mutex::new(HashMap::new()));
		let stop = Arc::new(AtomicBool::new(false));

		let loop_watchers = watchers.clone();
		let loop_stop = stop.clone();
		let handle = thread::Builder::new()
			.name("strand-reactor".into())
			.spawn(move || run_loop(poll, loop_watchers, loop_stop))?;

		Ok(Arc::new(Reactor {
			registry,
			waker,
			watchers,
			// Token(0) is reserved for the waker.
			next_token: AtomicUsize::new(1),
			stop,
			thread: Mutex::new(Some(handle)),
		}))
	}

	/// Register a source for the given conditions. The callback fires on the
	/// reactor thread with the readiness observed.
	pub fn add(
		&self,
		source: &mut dyn Source,
		cond: Cond,
		watch: impl Fn(Cond) + Send + Sync + 'static,
	) -> io::Result<WatchToken> {
		let interest = cond
			.interest()
			.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty interest"))?;
		let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
		self.watchers.lock().insert(token, Arc::new(watch));
		if let Err(e) = self.registry.register(source, token, interest) {
			self.watchers.lock().remove(&token);
			return Err(e);
		}
		trace!(?token, "watch added");
		Ok(WatchToken(token))
	}

	/// Change the watched conditions of an already-registered source.
	pub fn modify(&self, source: &mut dyn Source, token: WatchToken, cond: Cond) -> io::Result<()> {
		let interest = cond
			.interest()
			.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty interest"))?;
		self.registry.reregister(source, token.0, interest)
	}

	/// Stop watching a source. Idempotent: deregistering a handle the OS has
	/// already forgotten (e.g. after close) is not an error.
	pub fn remove(&self, source: &mut dyn Source, token: WatchToken) {
		if self.watchers.lock().remove(&token.0).is_none() {
			return;
		}
		if let Err(e) = self.registry.deregister(source) {
			trace!(?token, "deregister after close: {e}");
		}
	}

	pub fn shutdown(&self) {
		self.stop.store(true, Ordering::SeqCst);
		let _ = self.waker.wake();
		if let Some(handle) = self.thread.lock().take() {
			let _ = handle.join();
		}
	}
}

impl Drop for Reactor {
	fn drop(&mut self) {
		self.stop.store(true, Ordering::SeqCst);
		let _ = self.waker.wake();
		if let Some(handle) = self.thread.lock().take() {
			let _ = handle.join();
		}
	}
}

fn run_loop(mut poll: Poll, watchers: Arc<Mutex<HashMap<Token, WatchFn>>>, stop: Arc<AtomicBool>) {
	let mut events = Events::with_capacity(256);
	loop {
		if stop.load(Ordering::SeqCst) {
			debug!("reactor stopping");
			return;
		}
		if let Err(e) = poll.poll(&mut events, None) {
			if e.kind() == io::ErrorKind::Interrupted {
				continue;
			}
			warn!("reactor poll failed: {e}");
			return;
		}
		for event in events.iter() {
			if event.token() == WAKER {
				continue;
			}
			let cond = Cond::from_event(event);
			let watch = watchers.lock().get(&event.token()).cloned();
			match watch {
				Some(watch) => watch(cond),
				// remove() raced the poll; the token is gone, drop the event.
				None => trace!(token = ?event.token(), "event for removed watch"),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::io::{Read, Write};
	use std::sync::mpsc;
	use std::time::Duration;

	use mio::net::{TcpListener, TcpStream};

	use super::*;

	fn pair() -> (TcpStream, std::net::TcpStream) {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		let client = TcpStream::connect(addr).unwrap();
		let (server, _) = listener.accept().unwrap();
		server.set_nonblocking(false).unwrap();
		(client, server)
	}

	#[test]
	fn readable_event_delivered() {
		let reactor = Reactor::new().unwrap();
		let (mut client, mut server) = pair();
		let (tx, rx) = mpsc::channel();
		let token = reactor
			.add(&mut client, Cond::IN, move |cond| {
				tx.send(cond).unwrap();
			})
			.unwrap();

		server.write_all(b"x").unwrap();
		let cond = rx.recv_timeout(Duration::from_secs(2)).unwrap();
		assert!(cond.contains(Cond::IN));

		reactor.remove(&mut client, token);
		let mut buf = [0u8; 1];
		client.read_exact(&mut buf).unwrap();
		assert_eq!(&buf, b"x");
	}

	#[test]
	fn remove_is_idempotent() {
		let reactor = Reactor::new().unwrap();
		let (mut client, _server) = pair();
		let token = reactor.add(&mut client, Cond::IN, |_| {}).unwrap();
		reactor.remove(&mut client, token);
		reactor.remove(&mut client, token);
	}

	#[test]
	fn modify_switches_direction() {
		let reactor = Reactor::new().unwrap();
		let (mut client, _server) = pair();
		let (tx, rx) = mpsc::channel();
		let token = reactor
			.add(&mut client, Cond::IN, move |cond| {
				let _ = tx.send(cond);
			})
			.unwrap();
		// A fresh TCP stream is writable immediately once we ask for OUT.
		reactor.modify(&mut client, token, Cond::OUT).unwrap();
		let cond = rx.recv_timeout(Duration::from_secs(2)).unwrap();
		assert!(cond.contains(Cond::OUT));
		reactor.remove(&mut client, token);
	}

	#[test]
	fn listener_accept_readiness() {
		let reactor = Reactor::new().unwrap();
		let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
		let addr = listener.local_addr().unwrap();
		let (tx, rx) = mpsc::channel();
		let token = reactor
			.add(&mut listener, Cond::IN, move |cond| {
				let _ = tx.send(cond);
			})
			.unwrap();
		let _client = std::net::TcpStream::connect(addr).unwrap();
		let cond = rx.recv_timeout(Duration::from_secs(2)).unwrap();
		assert!(cond.contains(Cond::IN));
		reactor.remove(&mut listener, token);
	}

	#[test]
	fn hangup_reported() {
		let reactor = Reactor::new().unwrap();
		let (mut client, server) = pair();
		let (tx, rx) = mpsc::channel();
		let _token = reactor
			.add(&mut client, Cond::IN, move |cond| {
				let _ = tx.send(cond);
			})
			.unwrap();
		drop(server);
		let cond = rx.recv_timeout(Duration::from_secs(2)).unwrap();
		assert!(cond.contains(Cond::HUP) || cond.contains(Cond::IN), "{cond:?}");
	}
}

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use strand_core::sched::SchedulerHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseState {
	Open,
	Closing,
	Closed,
}

/// Transport-independent identity of a remote endpoint. Ids are UUIDv4 and
/// never repeat within a process.
#[derive(Clone)]
pub struct Peer {
	shared: Arc<PeerShared>,
}

struct PeerShared {
	id: Uuid,
	transport: RwLock<Weak<dyn Transport>>,
	backlog: Mutex<VecDeque<Bytes>>,
	last_activity: Mutex<Instant>,
	close_state: Mutex<CloseState>,
	/// Transient view of the message being delivered; only valid during the
	/// receive emission.
	incoming: Mutex<Option<Bytes>>,
}

impl Peer {
	pub fn new(transport: &Arc<dyn Transport>) -> Peer {
		Peer {
			shared: Arc::new(PeerShared {
				id: Uuid::new_v4(),
				transport: RwLock::new(Arc::downgrade(transport)),
				backlog: Mutex::new(VecDeque::new()),
				last_activity: Mutex::new(Instant::now()),
				close_state: Mutex::new(CloseState::Open),
				incoming: Mutex::new(None),
			}),
		}
	}

	pub fn id(&self) -> Uuid {
		self.shared.id
	}

	pub fn transport(&self) -> Option<Arc<dyn Transport>> {
		self.shared.transport.read().upgrade()
	}

	pub fn touch(&self) {
		*self.shared.last_activity.lock() = Instant::now();
	}

	pub fn idle_for(&self) -> Duration {
		self.shared.last_activity.lock().elapsed()
	}

	pub fn close_state(&self) -> CloseState {
		*self.shared.close_state.lock()
	}

	/// A peer is alive while its transport reports it connected, or its last
	/// activity is within the timeout.
	pub fn is_alive(&self, timeout: Duration) -> bool {
		if self.close_state() == CloseState::Closed {
			return false;
		}
		if let Some(t) = self.transport()
			&& t.peer_is_connected(self)
		{
			return true;
		}
		self.idle_for() < timeout
	}

	/// Send a frame. If the transport has no open channel right now the
	/// frame joins the ordered backlog, flushed on next availability.
	pub fn send(&self, frame: Bytes) -> Result<()> {
		if self.close_state() != CloseState::Open {
			return Err(Error::Closed);
		}
		let Some(transport) = self.transport() else {
			return Err(Error::Closed);
		};
		self.touch();
		// Keep ordering: anything already backlogged goes first.
		if !self.shared.backlog.lock().is_empty() {
			self.shared.backlog.lock().push_back(frame);
			return Ok(());
		}
		match transport.send(self, frame.clone()) {
			Ok(()) => Ok(()),
			Err(Error::NotConnected) => {
				trace!(peer = %self.shared.id, "no channel, backlogging frame");
				self.shared.backlog.lock().push_back(frame);
				Ok(())
			},
			Err(e) => Err(e),
		}
	}

	pub fn backlog_len(&self) -> usize {
		self.shared.backlog.lock().len()
	}

	/// Push backlogged frames through the transport, oldest first, stopping
	/// at the first failure.
	pub fn flush_backlog(&self) -> Result<()> {
		let Some(transport) = self.transport() else {
			return Err(Error::Closed);
		};
		loop {
			let frame = {
				let mut backlog = self.shared.backlog.lock();
				match backlog.pop_front() {
					Some(f) => f,
					None => return Ok(()),
				}
			};
			if let Err(e) = transport.send(self, frame.clone()) {
				self.shared.backlog.lock().push_front(frame);
				return match e {
					Error::NotConnected => Ok(()),
					other => Err(other),
				};
			}
		}
	}

	pub fn discard_backlog(&self) {
		self.shared.backlog.lock().clear();
	}

	/// Close via the owning transport. Graceful flushes the backlog and
	/// waits for the channel to wind down; abrupt discards and closes now.
	pub fn close(&self, graceful: bool) {
		{
			let mut cs = self.shared.close_state.lock();
			if *cs != CloseState::Open {
				return;
			}
			*cs = if graceful {
				CloseState::Closing
			} else {
				CloseState::Closed
			};
		}
		if let Some(t) = self.transport() {
			t.close_peer(self, graceful);
		}
	}

	pub(crate) fn mark_closed(&self) {
		*self.shared.close_state.lock() = CloseState::Closed;
	}

	pub(crate) fn set_incoming(&self, frame: Option<Bytes>) {
		*self.shared.incoming.lock() = frame;
	}

	/// The message currently being delivered. Valid only inside a receive
	/// handler; the view is zeroed when the emission returns.
	pub fn receive_bytes(&self) -> Option<Bytes> {
		self.shared.incoming.lock().clone()
	}

	pub fn receive_text(&self) -> Option<String> {
		self
			.receive_bytes()
			.and_then(|b| String::from_utf8(b.to_vec()).ok())
	}
}

impl std::fmt::Debug for Peer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Peer")
			.field("id", &self.shared.id)
			.field("close_state", &self.close_state())
			.finish()
	}
}

/// Process-wide peer registry. Dead peers are swept out at most once per
/// cleanup interval, emitting peer-closed through their transport.
pub struct PeerManager {
	peers: Mutex<HashMap<Uuid, Peer>>,
	timeout: Duration,
	cleanup_interval: Duration,
	last_sweep: Mutex<Instant>,
}

static GLOBAL: Lazy<PeerManager> = Lazy::new(|| {
	let cfg = Config::default();
	PeerManager::new(cfg.peer_timeout, cfg.peer_cleanup_interval)
});

impl PeerManager {
	/// The lazily-created process-wide manager. Tear down transports before
	/// the core at exit; the registry itself holds no threads.
	pub fn global() -> &'static PeerManager {
		&GLOBAL
	}

	pub fn new(timeout: Duration, cleanup_interval: Duration) -> PeerManager {
		PeerManager {
			peers: Mutex::new(HashMap::new()),
			timeout,
			cleanup_interval,
			last_sweep: Mutex::new(Instant::now()),
		}
	}

	pub fn register(&self, peer: Peer) {
		self.maybe_sweep();
		self.peers.lock().insert(peer.id(), peer);
	}

	/// Look up a live peer. A dead peer is removed on the spot and reported
	/// as absent.
	pub fn lookup(&self, id: &Uuid) -> Option<Peer> {
		self.maybe_sweep();
		let peer = self.peers.lock().get(id).cloned()?;
		if peer.is_alive(self.timeout) {
			Some(peer)
		} else {
			self.remove(id);
			None
		}
	}

	pub fn remove(&self, id: &Uuid) -> Option<Peer> {
		let peer = self.peers.lock().remove(id)?;
		retire(&peer);
		Some(peer)
	}

	pub fn len(&self) -> usize {
		self.peers.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.peers.lock().is_empty()
	}

	/// Remove every dead peer now. Returns how many were dropped.
	pub fn sweep(&self) -> usize {
		*self.last_sweep.lock() = Instant::now();
		let dead: Vec<Peer> = {
			let mut peers = self.peers.lock();
			let ids: Vec<Uuid> = peers
				.iter()
				.filter(|(_, p)| !p.is_alive(self.timeout))
				.map(|(id, _)| *id)
				.collect();
			ids.iter().filter_map(|id| peers.remove(id)).collect()
		};
		let n = dead.len();
		for peer in dead {
			debug!(peer = %peer.id(), "sweeping dead peer");
			retire(&peer);
		}
		n
	}

	fn maybe_sweep(&self) {
		let due = {
			let last = self.last_sweep.lock();
			last.elapsed() >= self.cleanup_interval
		};
		if due {
			self.sweep();
		}
	}

	/// Schedule periodic sweeps on the scheduler. Reschedules itself until
	/// the scheduler shuts down.
	pub fn attach(self: &Arc<Self>, sched: &SchedulerHandle) {
		let this = self.clone();
		let sched2 = sched.clone();
		sched.post_after(self.cleanup_interval, 0, move || {
			this.sweep();
			this.attach(&sched2);
		});
	}
}

fn retire(peer: &Peer) {
	let transport = peer.transport();
	peer.mark_closed();
	if let Some(t) = transport {
		t.events().emit_peer_closed(peer, false);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

	use super::*;
	use crate::transport::TransportEvents;

	struct FakeTransport {
		events: TransportEvents,
		connected: AtomicBool,
		sent: AtomicUsize,
		accept: AtomicBool,
	}

	impl FakeTransport {
		fn new(connected: bool, accept: bool) -> Arc<FakeTransport> {
			Arc::new(FakeTransport {
				events: TransportEvents::new(),
				connected: AtomicBool::new(connected),
				sent: AtomicUsize::new(0),
				accept: AtomicBool::new(accept),
			})
		}
	}

	impl Transport for FakeTransport {
		fn send(&self, _peer: &Peer, _frame: Bytes) -> Result<()> {
			if self.accept.load(Ordering::SeqCst) {
				self.sent.fetch_add(1, Ordering::SeqCst);
				Ok(())
			} else {
				Err(Error::NotConnected)
			}
		}

		fn peer_is_connected(&self, _peer: &Peer) -> bool {
			self.connected.load(Ordering::SeqCst)
		}

		fn close_peer(&self, peer: &Peer, graceful: bool) {
			peer.mark_closed();
			self.events.emit_peer_closed(peer, graceful);
		}

		fn events(&self) -> &TransportEvents {
			&self.events
		}
	}

	fn as_dyn(t: &Arc<FakeTransport>) -> Arc<dyn Transport> {
		t.clone()
	}

	#[test]
	fn ids_are_unique() {
		let t = FakeTransport::new(true, true);
		let a = Peer::new(&as_dyn(&t));
		let b = Peer::new(&as_dyn(&t));
		assert_ne!(a.id(), b.id());
	}

	#[test]
	fn failed_send_goes_to_backlog_and_flushes_in_order() {
		let t = FakeTransport::new(true, false);
		let peer = Peer::new(&as_dyn(&t));
		peer.send(Bytes::from_static(b"one")).unwrap();
		peer.send(Bytes::from_static(b"two")).unwrap();
		assert_eq!(peer.backlog_len(), 2);
		assert_eq!(t.sent.load(Ordering::SeqCst), 0);

		t.accept.store(true, Ordering::SeqCst);
		peer.flush_backlog().unwrap();
		assert_eq!(peer.backlog_len(), 0);
		assert_eq!(t.sent.load(Ordering::SeqCst), 2);
	}

	#[test]
	fn lookup_removes_dead_peers() {
		let t = FakeTransport::new(false, true);
		let mgr = PeerManager::new(Duration::from_millis(20), Duration::from_secs(3600));
		let peer = Peer::new(&as_dyn(&t));
		let id = peer.id();
		mgr.register(peer);
		assert!(mgr.lookup(&id).is_some());

		std::thread::sleep(Duration::from_millis(40));
		// Disconnected and idle past the timeout: gone.
		assert!(mgr.lookup(&id).is_none());
		assert_eq!(mgr.len(), 0);
	}

	#[test]
	fn connected_peers_survive_sweeps() {
		let t = FakeTransport::new(true, true);
		let mgr = PeerManager::new(Duration::from_millis(1), Duration::from_secs(3600));
		let peer = Peer::new(&as_dyn(&t));
		let id = peer.id();
		mgr.register(peer);
		std::thread::sleep(Duration::from_millis(10));
		assert_eq!(mgr.sweep(), 0);
		assert!(mgr.lookup(&id).is_some());
	}

	#[test]
	fn sweep_emits_peer_closed_not_graceful() {
		let t = FakeTransport::new(false, true);
		let got = Arc::new(Mutex::new(Vec::new()));
		let sink = got.clone();
		t.events.on_peer_closed(move |_p, graceful| {
			sink.lock().push(graceful);
		});
		let mgr = PeerManager::new(Duration::from_millis(1), Duration::from_secs(3600));
		let peer = Peer::new(&as_dyn(&t));
		mgr.register(peer);
		std::thread::sleep(Duration::from_millis(10));
		assert_eq!(mgr.sweep(), 1);
		assert_eq!(got.lock().as_slice(), &[false]);
	}

	#[test]
	fn abrupt_close_discards_backlog() {
		let t = FakeTransport::new(true, false);
		let peer = Peer::new(&as_dyn(&t));
		peer.send(Bytes::from_static(b"queued")).unwrap();
		assert_eq!(peer.backlog_len(), 1);
		peer.discard_backlog();
		peer.close(false);
		assert_eq!(peer.close_state(), CloseState::Closed);
		assert!(matches!(
			peer.send(Bytes::from_static(b"late")),
			Err(Error::Closed)
		));
	}
}

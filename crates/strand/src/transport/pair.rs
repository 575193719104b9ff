use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use strand_core::sched::SchedulerHandle;

use super::{Transport, TransportEvents, create_peer};
use crate::errors::{Error, Result};
use crate::peer::{CloseState, Peer, PeerManager};

/// One end of an in-process transport pair. Frames sent on one end are
/// delivered on the other as scheduler tasks, so both sides observe the same
/// single-threaded discipline as socket-backed transports.
pub struct PairTransport {
	sched: SchedulerHandle,
	events: TransportEvents,
	remote: Mutex<Weak<PairTransport>>,
	peer: Mutex<Option<Peer>>,
	open: AtomicBool,
}

/// Build two connected in-memory transports, each with one peer registered
/// in `manager` representing the opposite endpoint.
pub fn pair(sched: &SchedulerHandle, manager: &PeerManager) -> (Arc<PairTransport>, Arc<PairTransport>) {
	let a = Arc::new(PairTransport {
		sched: sched.clone(),
		events: TransportEvents::new(),
		remote: Mutex::new(Weak::new()),
		peer: Mutex::new(None),
		open: AtomicBool::new(true),
	});
	let b = Arc::new(PairTransport {
		sched: sched.clone(),
		events: TransportEvents::new(),
		remote: Mutex::new(Weak::new()),
		peer: Mutex::new(None),
		open: AtomicBool::new(true),
	});
	*a.remote.lock() = Arc::downgrade(&b);
	*b.remote.lock() = Arc::downgrade(&a);

	let dyn_a: Arc<dyn Transport> = a.clone();
	let dyn_b: Arc<dyn Transport> = b.clone();
	*a.peer.lock() = Some(create_peer(&dyn_a, manager));
	*b.peer.lock() = Some(create_peer(&dyn_b, manager));
	(a, b)
}

impl PairTransport {
	/// The peer this end talks to.
	pub fn peer(&self) -> Peer {
		self
			.peer
			.lock()
			.clone()
			.expect("pair() always installs a peer")
	}

	fn remote(&self) -> Option<Arc<PairTransport>> {
		self.remote.lock().upgrade()
	}
}

impl Transport for PairTransport {
	fn send(&self, _peer: &Peer, frame: Bytes) -> Result<()> {
		if !self.open.load(Ordering::SeqCst) {
			return Err(Error::NotConnected);
		}
		let Some(remote) = self.remote() else {
			return Err(Error::NotConnected);
		};
		self.sched.post(0, move || {
			if !remote.open.load(Ordering::SeqCst) {
				return;
			}
			let peer = remote.peer.lock().clone();
			if let Some(peer) = peer {
				remote.events.emit_receive(&peer, frame);
			}
		});
		Ok(())
	}

	fn peer_is_connected(&self, _peer: &Peer) -> bool {
		self.open.load(Ordering::SeqCst) && self.remote().is_some_and(|r| r.open.load(Ordering::SeqCst))
	}

	fn close_peer(&self, peer: &Peer, graceful: bool) {
		if graceful && peer.close_state() == CloseState::Closing {
			let _ = peer.flush_backlog();
		} else {
			peer.discard_backlog();
		}
		let was_open = self.open.swap(false, Ordering::SeqCst);
		if !was_open {
			return;
		}
		peer.mark_closed();
		self.events.emit_peer_closed(peer, graceful);
		// Tell the other side its channel is gone.
		if let Some(remote) = self.remote() {
			self.sched.post(0, move || {
				if remote.open.swap(false, Ordering::SeqCst) {
					let peer = remote.peer.lock().clone();
					if let Some(peer) = peer {
						peer.mark_closed();
						remote.events.emit_peer_closed(&peer, graceful);
					}
				}
			});
		}
	}

	fn events(&self) -> &TransportEvents {
		&self.events
	}
}

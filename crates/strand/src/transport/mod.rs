mod line;
mod pair;

use std::sync::Arc;

use bytes::Bytes;
pub use line::LineTransport;
pub use pair::{PairTransport, pair};
use parking_lot::Mutex;

use crate::errors::Result;
use crate::peer::{Peer, PeerManager};

/// A byte-message carrier between peers. Delivery is at-most-once per
/// message; concrete transports may add their own retry framing above this
/// contract, the core does not.
pub trait Transport: Send + Sync + 'static {
	/// Deliver one framed message to the peer. `Err(NotConnected)` means the
	/// channel is not open right now; callers (the peer backlog) retry on
	/// the next availability.
	fn send(&self, peer: &Peer, frame: Bytes) -> Result<()>;

	fn peer_is_connected(&self, peer: &Peer) -> bool;

	/// Graceful close flushes the peer's backlog and winds the channel down;
	/// abrupt discards the backlog and closes immediately.
	fn close_peer(&self, peer: &Peer, graceful: bool);

	fn events(&self) -> &TransportEvents;
}

/// Create a peer owned by `transport`, register it, and announce it.
pub fn create_peer(transport: &Arc<dyn Transport>, manager: &PeerManager) -> Peer {
	let peer = Peer::new(transport);
	manager.register(peer.clone());
	transport.events().emit_new_peer(&peer);
	peer
}

type ReceiveFn = Arc<dyn Fn(&Peer) + Send + Sync>;
type PeerFn = Arc<dyn Fn(&Peer) + Send + Sync>;
type ClosedFn = Arc<dyn Fn(&Peer, bool) + Send + Sync>;

/// Listener registry for the three transport signals. During a receive
/// emission the message is attached to the peer as a transient view and
/// zeroed afterwards; handlers that keep the bytes must copy. Listener lists
/// are snapshotted before emission, so handlers may register further
/// listeners without deadlocking.
pub struct TransportEvents {
	receive: Mutex<Vec<ReceiveFn>>,
	new_peer: Mutex<Vec<PeerFn>>,
	peer_closed: Mutex<Vec<ClosedFn>>,
}

impl Default for TransportEvents {
	fn default() -> Self {
		Self::new()
	}
}

impl TransportEvents {
	pub fn new() -> TransportEvents {
		TransportEvents {
			receive: Mutex::new(Vec::new()),
			new_peer: Mutex::new(Vec::new()),
			peer_closed: Mutex::new(Vec::new()),
		}
	}

	pub fn on_receive(&self, f: impl Fn(&Peer) + Send + Sync + 'static) {
		self.receive.lock().push(Arc::new(f));
	}

	pub fn on_new_peer(&self, f: impl Fn(&Peer) + Send + Sync + 'static) {
		self.new_peer.lock().push(Arc::new(f));
	}

	pub fn on_peer_closed(&self, f: impl Fn(&Peer, bool) + Send + Sync + 'static) {
		self.peer_closed.lock().push(Arc::new(f));
	}

	pub fn emit_receive(&self, peer: &Peer, frame: Bytes) {
		peer.touch();
		peer.set_incoming(Some(frame));
		let listeners: Vec<ReceiveFn> = self.receive.lock().clone();
		for f in listeners {
			f(peer);
		}
		peer.set_incoming(None);
	}

	pub fn emit_new_peer(&self, peer: &Peer) {
		let listeners: Vec<PeerFn> = self.new_peer.lock().clone();
		for f in listeners {
			f(peer);
		}
	}

	pub fn emit_peer_closed(&self, peer: &Peer, graceful: bool) {
		let listeners: Vec<ClosedFn> = self.peer_closed.lock().clone();
		for f in listeners {
			f(peer, graceful);
		}
	}
}

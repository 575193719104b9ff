use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{trace, warn};

use super::{Transport, TransportEvents, create_peer};
use crate::errors::{Error, Result};
use crate::peer::{CloseState, Peer, PeerManager};
use crate::socket::{Socket, SocketHandler, State};

/// A transport carrying newline-delimited byte records over one connected
/// socket. One peer per socket; closing the socket closes the peer.
pub struct LineTransport {
	socket: Socket,
	events: TransportEvents,
	peer: Mutex<Option<Peer>>,
	rx: Mutex<BytesMut>,
	/// Unfinished output, drained before any new frame goes out.
	tx: Mutex<VecDeque<Bytes>>,
}

impl LineTransport {
	/// Bind a transport to a socket (usually already CONNECTED or about to
	/// be). Installs its own socket handler.
	pub fn new(socket: Socket, manager: &PeerManager) -> Arc<LineTransport> {
		let transport = Arc::new(LineTransport {
			socket: socket.clone(),
			events: TransportEvents::new(),
			peer: Mutex::new(None),
			rx: Mutex::new(BytesMut::new()),
			tx: Mutex::new(VecDeque::new()),
		});
		socket.set_handler(Arc::new(LineHandler {
			transport: Arc::downgrade(&transport),
		}));
		let dynamic: Arc<dyn Transport> = transport.clone();
		*transport.peer.lock() = Some(create_peer(&dynamic, manager));
		transport
	}

	pub fn peer(&self) -> Peer {
		self
			.peer
			.lock()
			.clone()
			.expect("new() always installs a peer")
	}

	pub fn socket(&self) -> &Socket {
		&self.socket
	}

	/// Push queued output into the socket. Stops when the socket buffers
	/// fill; the socket's writable event resumes it.
	fn drain_tx(&self) -> Result<()> {
		loop {
			let frame = {
				let mut tx = self.tx.lock();
				match tx.pop_front() {
					Some(f) => f,
					None => return Ok(()),
				}
			};
			let accepted = self.socket.write(&frame)?;
			if accepted < frame.len() {
				self.tx.lock().push_front(frame.slice(accepted..));
				return Ok(());
			}
		}
	}

	fn deliver_lines(&self, peer: &Peer) {
		loop {
			let line = {
				let mut rx = self.rx.lock();
				match rx.iter().position(|b| *b == b'\n') {
					Some(pos) => {
						let mut line = rx.split_to(pos + 1);
						line.truncate(pos);
						line.freeze()
					},
					None => return,
				}
			};
			trace!(len = line.len(), "line frame received");
			self.events.emit_receive(peer, line);
		}
	}
}

impl Transport for LineTransport {
	fn send(&self, _peer: &Peer, frame: Bytes) -> Result<()> {
		if self.socket.state() != State::Connected {
			return Err(Error::NotConnected);
		}
		let mut framed = BytesMut::with_capacity(frame.len() + 1);
		framed.extend_from_slice(&frame);
		framed.extend_from_slice(b"\n");
		self.tx.lock().push_back(framed.freeze());
		self.drain_tx()
	}

	fn peer_is_connected(&self, _peer: &Peer) -> bool {
		self.socket.state() == State::Connected
	}

	fn close_peer(&self, peer: &Peer, graceful: bool) {
		if graceful {
			let _ = peer.flush_backlog();
			let _ = self.drain_tx();
		} else {
			peer.discard_backlog();
			self.tx.lock().clear();
		}
		self.socket.close();
	}

	fn events(&self) -> &TransportEvents {
		&self.events
	}
}

struct LineHandler {
	transport: Weak<LineTransport>,
}

impl SocketHandler for LineHandler {
	fn on_readable(&self, socket: &Socket) {
		let Some(transport) = self.transport.upgrade() else {
			return;
		};
		let peer = transport.peer();
		let mut buf = [0u8; 8 * 1024];
		loop {
			match socket.read(&mut buf) {
				Ok(0) => break,
				Ok(n) => {
					transport.rx.lock().extend_from_slice(&buf[..n]);
				},
				Err(e) => {
					warn!("transport read failed: {e}");
					break;
				},
			}
		}
		transport.deliver_lines(&peer);
	}

	fn on_writable(&self, _socket: &Socket) {
		let Some(transport) = self.transport.upgrade() else {
			return;
		};
		if transport.drain_tx().is_ok() && transport.tx.lock().is_empty() {
			// Channel has room again: move the peer backlog.
			let _ = transport.peer().flush_backlog();
		}
	}

	fn on_closed(&self, _socket: &Socket) {
		let Some(transport) = self.transport.upgrade() else {
			return;
		};
		let peer = transport.peer();
		// A close we initiated (peer in Closing) is graceful; a close driven
		// by the remote end is not.
		let graceful = peer.close_state() == CloseState::Closing;
		peer.mark_closed();
		transport.events.emit_peer_closed(&peer, graceful);
	}

	fn on_error(&self, _socket: &Socket, error: &Error) {
		warn!("transport socket error: {error}");
	}
}

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::errors::{Error, Result};
use crate::runtime::Core;
use crate::socket::{Socket, SocketHandler, State};

/// Pool sizing for one upstream.
#[derive(Debug, Clone)]
pub struct PoolConfig {
	pub min: usize,
	pub max: usize,
	pub initial_idle_timeout: Duration,
}

impl PoolConfig {
	pub fn from_core(core: &Core) -> PoolConfig {
		let cfg = core.config();
		PoolConfig {
			min: cfg.backend_min_pool,
			max: cfg.backend_max_pool,
			initial_idle_timeout: cfg.backend_idle_timeout,
		}
	}
}

/// Snapshot of a backend's queues, for observation and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
	pub free: usize,
	pub busy: usize,
	pub connecting: usize,
	pub waiters: usize,
	pub idle_timeout: Duration,
	pub total_opened: u64,
}

/// One upstream connection owned by a backend.
pub struct Bridge {
	socket: Socket,
	backend: Weak<Backend>,
	last_activity: Mutex<Instant>,
}

impl Bridge {
	pub fn socket(&self) -> &Socket {
		&self.socket
	}

	/// The owning backend, if it is still around. Weak so that a backend
	/// tear-down is never blocked by outstanding bridge references.
	pub fn backend(&self) -> Option<Arc<Backend>> {
		self.backend.upgrade()
	}

	pub fn idle_for(&self) -> Duration {
		self.last_activity.lock().elapsed()
	}

	fn touch(&self) {
		*self.last_activity.lock() = Instant::now();
	}
}

/// A per-destination pool of upstream bridges. Scaling is demand-driven
/// between `min` and `max`; the idle timeout is learned from observed
/// upstream behavior.
///
/// Invariant: `|free| + |busy| + |connecting| <= max`.
pub struct Backend {
	core: Arc<Core>,
	upstream: String,
	cfg: PoolConfig,
	inner: Mutex<PoolInner>,
}

struct PoolInner {
	free: VecDeque<Arc<Bridge>>,
	busy: Vec<Arc<Bridge>>,
	connecting: Vec<Arc<Bridge>>,
	waiters: VecDeque<Socket>,
	idle_timeout: Duration,
	total_opened: u64,
	closed: bool,
}

impl PoolInner {
	fn total(&self) -> usize {
		self.free.len() + self.busy.len() + self.connecting.len()
	}
}

impl Backend {
	pub fn new(core: Arc<Core>, upstream: impl Into<String>, cfg: PoolConfig) -> Arc<Backend> {
		Arc::new(Backend {
			core,
			upstream: upstream.into(),
			inner: Mutex::new(PoolInner {
				free: VecDeque::new(),
				busy: Vec::new(),
				connecting: Vec::new(),
				waiters: VecDeque::new(),
				idle_timeout: cfg.initial_idle_timeout,
				total_opened: 0,
				closed: false,
			}),
			cfg,
		})
	}

	pub fn upstream(&self) -> &str {
		&self.upstream
	}

	pub fn stats(&self) -> PoolStats {
		let inner = self.inner.lock();
		PoolStats {
			free: inner.free.len(),
			busy: inner.busy.len(),
			connecting: inner.connecting.len(),
			waiters: inner.waiters.len(),
			idle_timeout: inner.idle_timeout,
			total_opened: inner.total_opened,
		}
	}

	/// True if a bridge is free right now. Otherwise opportunistically opens
	/// a new one (respecting `max`) and reports false.
	pub fn has_free_bridge(self: &Arc<Self>) -> bool {
		let mut inner = self.inner.lock();
		if !inner.free.is_empty() {
			return true;
		}
		self.open_bridge_locked(&mut inner);
		false
	}

	/// Pop a free bridge into the busy queue.
	pub fn acquire(self: &Arc<Self>) -> Option<Arc<Bridge>> {
		let mut inner = self.inner.lock();
		let bridge = inner.free.pop_front()?;
		inner.busy.push(bridge.clone());
		Some(bridge)
	}

	/// A client released its bridge. Refresh it if demand (or the minimum)
	/// warrants keeping the slot, otherwise destroy it.
	pub fn release(self: &Arc<Self>, bridge: &Arc<Bridge>) {
		let mut inner = self.inner.lock();
		remove_bridge(&mut inner.busy, bridge);
		let keep = !inner.waiters.is_empty() || inner.total() < self.cfg.min;
		detach(bridge);
		bridge.socket.close();
		if keep {
			trace!(upstream = %self.upstream, "refreshing released bridge");
			self.open_bridge_locked(&mut inner);
		}
		self.ensure_capacity_locked(&mut inner);
	}

	/// Record upstream activity on a bridge, raising the learned idle
	/// timeout toward the observed inter-activity gap.
	pub fn notify_activity(&self, bridge: &Arc<Bridge>) {
		let gap = bridge.idle_for();
		bridge.touch();
		let mut inner = self.inner.lock();
		if gap > inner.idle_timeout {
			debug!(
				upstream = %self.upstream,
				gap_ms = gap.as_millis() as u64,
				"raising learned idle timeout"
			);
			inner.idle_timeout = gap;
		}
	}

	/// Route an accepted client through the pool.
	pub fn serve(self: &Arc<Self>, client: Socket) {
		let bridge = {
			let mut inner = self.inner.lock();
			if inner.closed {
				drop(inner);
				client.close();
				return;
			}
			match inner.free.pop_front() {
				Some(bridge) => {
					inner.busy.push(bridge.clone());
					Some(bridge)
				},
				None => {
					inner.waiters.push_back(client.clone());
					self.ensure_capacity_locked(&mut inner);
					None
				},
			}
		};
		if let Some(bridge) = bridge {
			splice(self, client, bridge);
		}
	}

	/// Tear down every bridge and refuse new work.
	pub fn close(self: &Arc<Self>) {
		let mut inner = self.inner.lock();
		inner.closed = true;
		for bridge in inner
			.free
			.iter()
			.chain(inner.busy.iter())
			.chain(inner.connecting.iter())
		{
			detach(bridge);
			bridge.socket.close();
		}
		inner.free.clear();
		inner.busy.clear();
		inner.connecting.clear();
		for client in inner.waiters.drain(..) {
			client.close();
		}
	}

	/// A bridge failed. Lower the learned idle timeout toward the observed
	/// inactivity and proactively close any free bridge that has been idle
	/// longer, so the pool adapts to an upstream that silently drops idle
	/// connections.
	fn on_bridge_error(self: &Arc<Self>, bridge: &Arc<Bridge>) {
		let inactivity = bridge.idle_for();
		let mut inner = self.inner.lock();
		if inner.closed {
			return;
		}
		remove_bridge_deque(&mut inner.free, bridge);
		remove_bridge(&mut inner.busy, bridge);
		remove_bridge(&mut inner.connecting, bridge);
		if inactivity < inner.idle_timeout {
			debug!(
				upstream = %self.upstream,
				inactivity_ms = inactivity.as_millis() as u64,
				"lowering learned idle timeout"
			);
			inner.idle_timeout = inactivity;
		}
		let timeout = inner.idle_timeout;
		let stale: Vec<Arc<Bridge>> = inner
			.free
			.iter()
			.filter(|b| b.idle_for() > timeout)
			.cloned()
			.collect();
		for b in &stale {
			remove_bridge_deque(&mut inner.free, b);
			detach(b);
			b.socket.close();
			trace!(upstream = %self.upstream, "closing stale free bridge");
		}
		self.ensure_capacity_locked(&mut inner);
	}

	/// A bridge finished connecting: serve a waiter or park it in free.
	fn on_bridge_connected(self: &Arc<Self>, bridge: &Arc<Bridge>) {
		let client = {
			let mut inner = self.inner.lock();
			if inner.closed {
				return;
			}
			remove_bridge(&mut inner.connecting, bridge);
			bridge.touch();
			match inner.waiters.pop_front() {
				Some(client) => {
					inner.busy.push(bridge.clone());
					Some(client)
				},
				None => {
					inner.free.push_back(bridge.clone());
					self.ensure_capacity_locked(&mut inner);
					None
				},
			}
		};
		if let Some(client) = client {
			splice(self, client, bridge.clone());
		}
	}

	/// Open bridges until demand is covered: one per waiting client, plus
	/// enough to restore the minimum free pool, never exceeding `max`.
	fn ensure_capacity_locked(self: &Arc<Self>, inner: &mut PoolInner) {
		while (inner.connecting.len() < inner.waiters.len()
			|| inner.free.len() + inner.connecting.len() < self.cfg.min)
			&& inner.total() < self.cfg.max
		{
			if !self.open_bridge_locked(inner) {
				break;
			}
		}
	}

	fn open_bridge_locked(self: &Arc<Self>, inner: &mut PoolInner) -> bool {
		if inner.closed || inner.total() >= self.cfg.max {
			return false;
		}
		let socket = Socket::new(&self.core);
		let bridge = Arc::new(Bridge {
			socket: socket.clone(),
			backend: Arc::downgrade(self),
			last_activity: Mutex::new(Instant::now()),
		});
		socket.set_handler(Arc::new(BridgeHandler {
			backend: Arc::downgrade(self),
			bridge: Arc::downgrade(&bridge),
		}));
		match socket.connect(&self.upstream) {
			Ok(()) => {
				inner.total_opened += 1;
				inner.connecting.push(bridge);
				trace!(upstream = %self.upstream, connecting = inner.connecting.len(), "opening bridge");
				true
			},
			Err(e) => {
				warn!(upstream = %self.upstream, "bridge connect failed to start: {e}");
				false
			},
		}
	}
}

fn remove_bridge(list: &mut Vec<Arc<Bridge>>, bridge: &Arc<Bridge>) {
	list.retain(|b| !Arc::ptr_eq(b, bridge));
}

fn remove_bridge_deque(list: &mut VecDeque<Arc<Bridge>>, bridge: &Arc<Bridge>) {
	list.retain(|b| !Arc::ptr_eq(b, bridge));
}

/// Replace a socket's handler before deliberately closing it, so the close
/// is not misread as an upstream failure.
fn detach(bridge: &Arc<Bridge>) {
	struct Detached;
	impl SocketHandler for Detached {}
	bridge.socket.set_handler(Arc::new(Detached));
}

/// Watches an unpaired bridge: connect completion, idle death, errors.
struct BridgeHandler {
	backend: Weak<Backend>,
	bridge: Weak<Bridge>,
}

impl BridgeHandler {
	fn with(&self, f: impl FnOnce(Arc<Backend>, Arc<Bridge>)) {
		if let (Some(backend), Some(bridge)) = (self.backend.upgrade(), self.bridge.upgrade()) {
			f(backend, bridge);
		}
	}
}

impl SocketHandler for BridgeHandler {
	fn on_state_changed(&self, _socket: &Socket, _old: State, new: State) {
		if new == State::Connected {
			self.with(|backend, bridge| backend.on_bridge_connected(&bridge));
		}
	}

	fn on_readable(&self, socket: &Socket) {
		// A free bridge should be silent; data or EOF here means the
		// upstream is misbehaving or dropping us. Reading surfaces the EOF.
		let mut buf = [0u8; 512];
		while let Ok(n) = socket.read(&mut buf) {
			if n == 0 {
				break;
			}
			trace!("discarding {n} unexpected bytes from idle bridge");
		}
	}

	fn on_closed(&self, _socket: &Socket) {
		self.with(|backend, bridge| backend.on_bridge_error(&bridge));
	}

	fn on_error(&self, _socket: &Socket, error: &Error) {
		debug!("bridge error: {error}");
		self.with(|backend, bridge| backend.on_bridge_error(&bridge));
	}
}

/// Wire a client socket and a bridge together, copying bytes both ways with
/// unread-based backpressure.
fn splice(backend: &Arc<Backend>, client: Socket, bridge: Arc<Bridge>) {
	let link = Arc::new(Link {
		backend: Arc::downgrade(backend),
		client: client.clone(),
		bridge: bridge.clone(),
		torn_down: Mutex::new(false),
	});
	client.set_handler(Arc::new(LinkSide {
		link: link.clone(),
		client_side: true,
	}));
	bridge.socket.set_handler(Arc::new(LinkSide {
		link: link.clone(),
		client_side: false,
	}));
	debug!(
		client = client.id(),
		bridge = bridge.socket.id(),
		"client paired with bridge"
	);
	// Both sockets may already hold buffered input; pump once to start.
	link.pump(true);
	link.pump(false);
}

struct Link {
	backend: Weak<Backend>,
	client: Socket,
	bridge: Arc<Bridge>,
	torn_down: Mutex<bool>,
}

impl Link {
	/// Copy from one side to the other until the source runs dry or the sink
	/// fills. Unaccepted bytes go back into the source via unread, and the
	/// sink's writable event resumes the pump.
	fn pump(&self, from_client: bool) {
		let (from, to) = if from_client {
			(&self.client, &self.bridge.socket)
		} else {
			(&self.bridge.socket, &self.client)
		};
		let mut buf = [0u8; 8 * 1024];
		loop {
			let n = match from.read(&mut buf) {
				Ok(0) => break,
				Ok(n) => n,
				Err(_) => break,
			};
			if let Some(backend) = self.backend.upgrade() {
				backend.notify_activity(&self.bridge);
			}
			let accepted = match to.write(&buf[..n]) {
				Ok(a) => a,
				Err(_) => {
					let _ = from.unread(&buf[..n]);
					break;
				},
			};
			if accepted < n {
				let _ = from.unread(&buf[accepted..n]);
				break;
			}
		}
	}

	fn teardown(&self, bridge_failed: bool) {
		{
			let mut torn = self.torn_down.lock();
			if *torn {
				return;
			}
			*torn = true;
		}
		let Some(backend) = self.backend.upgrade() else {
			self.client.close();
			self.bridge.socket.close();
			return;
		};
		if bridge_failed {
			self.client.close();
			backend.on_bridge_error(&self.bridge);
		} else {
			backend.release(&self.bridge);
		}
	}
}

struct LinkSide {
	link: Arc<Link>,
	client_side: bool,
}

impl SocketHandler for LinkSide {
	fn on_readable(&self, _socket: &Socket) {
		self.link.pump(self.client_side);
	}

	fn on_writable(&self, _socket: &Socket) {
		// Our sink has room: pull from the opposite side.
		self.link.pump(!self.client_side);
	}

	fn on_closed(&self, _socket: &Socket) {
		self.link.teardown(!self.client_side);
	}

	fn on_error(&self, _socket: &Socket, error: &Error) {
		debug!(client_side = self.client_side, "link error: {error}");
	}
}

/// A reverse proxy: one listener feeding one pooled backend.
pub struct Reproxy {
	listener: Socket,
	backend: Arc<Backend>,
}

impl Reproxy {
	pub fn new(core: &Arc<Core>, listen_spec: &str, upstream_spec: &str) -> Result<Arc<Reproxy>> {
		Self::with_pool_config(core, listen_spec, upstream_spec, PoolConfig::from_core(core))
	}

	pub fn with_pool_config(
		core: &Arc<Core>,
		listen_spec: &str,
		upstream_spec: &str,
		cfg: PoolConfig,
	) -> Result<Arc<Reproxy>> {
		let backend = Backend::new(core.clone(), upstream_spec, cfg);
		let listener = Socket::new(core);
		listener.set_handler(Arc::new(FrontHandler {
			backend: backend.clone(),
		}));
		listener.listen(listen_spec)?;
		Ok(Arc::new(Reproxy { listener, backend }))
	}

	pub fn listener(&self) -> &Socket {
		&self.listener
	}

	pub fn backend(&self) -> &Arc<Backend> {
		&self.backend
	}

	pub fn shutdown(&self) {
		self.listener.close();
		self.backend.close();
	}
}

struct FrontHandler {
	backend: Arc<Backend>,
}

impl SocketHandler for FrontHandler {
	fn on_accept(&self, _listener: &Socket, accepted: Socket) {
		trace!(client = accepted.id(), "reproxy client accepted");
		self.backend.serve(accepted);
	}

	fn on_error(&self, _listener: &Socket, error: &Error) {
		warn!("reproxy listener error: {error}");
	}
}

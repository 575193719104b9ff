mod group;

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

pub use group::Group;
use mio::event::Source;
use parking_lot::Mutex;
use strand_core::reactor::{Cond, WatchToken};
use strand_core::sched::{PRIORITY_BUMP, PRIORITY_DEFAULT, Priority, TaskHandle};
use strand_core::throttle::Throttle;
use tracing::{debug, trace, warn};

use crate::addr::{Address, Family, Target};
use crate::errors::{Error, Result};
use crate::runtime::Core;
use crate::stream::{FlushState, HandshakeOutcome, Pipeline, RawStream, ReadOutcome, would_block};
use crate::tls::{TlsParams, TlsSession};

/// Lifecycle states of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Closed,
	Resolving,
	Bound,
	Listening,
	Connecting,
	Connected,
	TlsHandshaking,
	Closing,
}

/// Event sink for one socket. All callbacks run on the scheduler thread; a
/// state change is always delivered before any readable/writable callback
/// the new state triggers. Read handlers should drain until `read` returns
/// zero, per the edge-triggered contract.
#[allow(unused_variables)]
pub trait SocketHandler: Send + Sync + 'static {
	fn on_state_changed(&self, socket: &Socket, old: State, new: State) {}
	fn on_readable(&self, socket: &Socket) {}
	fn on_writable(&self, socket: &Socket) {}
	fn on_accept(&self, listener: &Socket, accepted: Socket) {}
	fn on_closed(&self, socket: &Socket) {}
	fn on_error(&self, socket: &Socket, error: &Error) {}
}

/// A non-blocking stream socket (or listener) driven by the reactor and
/// scheduler of its [`Core`].
///
/// Invariant: the socket is in `Connected` state iff it owns a live OS
/// stream and a pipeline.
#[derive(Clone)]
pub struct Socket {
	pub(crate) shared: Arc<Shared>,
}

pub(crate) struct Shared {
	id: u64,
	core: Arc<Core>,
	/// Priority readiness dispatches are posted at; bumped during connect
	/// and listen phases.
	actual_priority: AtomicI32,
	/// Reactor-side accumulator. The only state the reactor thread touches.
	readiness: Mutex<Readiness>,
	inner: Mutex<Inner>,
	handler: Mutex<Option<Arc<dyn SocketHandler>>>,
}

struct Readiness {
	new_cond: Cond,
	dispatch_pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
	Bind,
	Connect,
	Listen,
}

enum Io {
	None,
	Stream(RawStream),
	TcpListener(mio::net::TcpListener),
	#[cfg(unix)]
	UnixListener(mio::net::UnixListener),
	/// Bound but not yet listening; promoted by `listen_bound`.
	Bound(socket2::Socket, Family),
}

impl Io {
	fn source_mut(&mut self) -> Option<&mut dyn Source> {
		match self {
			Io::Stream(raw) => Some(raw.source_mut()),
			Io::TcpListener(l) => Some(l),
			#[cfg(unix)]
			Io::UnixListener(l) => Some(l),
			_ => None,
		}
	}
}

struct Inner {
	state: State,
	intent: Option<Intent>,
	family: Option<Family>,
	io: Io,
	token: Option<WatchToken>,
	watched_cond: Cond,
	cond: Cond,
	priority: Priority,
	group: Option<Group>,
	throttle_in: Arc<Throttle>,
	throttle_out: Arc<Throttle>,
	pipeline: Option<Pipeline>,
	tls_params: Option<Arc<TlsParams>>,
	tls_autostart: bool,
	server_name_hint: Option<String>,
	resolve: Option<crate::resolver::ResolveHandle>,
	connect_timer: Option<TaskHandle>,
	delayed_close: bool,
	local_addr: Option<Address>,
	peer_addr: Option<Address>,
	bytes_in: u64,
	bytes_out: u64,
}

/// Deferred emissions, run strictly after the state lock is released.
enum Ev {
	State(State, State),
	Readable,
	Writable,
	Accept(Socket),
	Closed,
	Error(Error),
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl Socket {
	pub fn new(core: &Arc<Core>) -> Socket {
		Socket {
			shared: Arc::new(Shared {
				id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
				core: core.clone(),
				actual_priority: AtomicI32::new(PRIORITY_DEFAULT),
				readiness: Mutex::new(Readiness {
					new_cond: Cond::NONE,
					dispatch_pending: false,
				}),
				inner: Mutex::new(Inner {
					state: State::Closed,
					intent: None,
					family: None,
					io: Io::None,
					token: None,
					watched_cond: Cond::NONE,
					cond: Cond::NONE,
					priority: PRIORITY_DEFAULT,
					group: None,
					throttle_in: Throttle::disabled(),
					throttle_out: Throttle::disabled(),
					pipeline: None,
					tls_params: None,
					tls_autostart: false,
					server_name_hint: None,
					resolve: None,
					connect_timer: None,
					delayed_close: false,
					local_addr: None,
					peer_addr: None,
					bytes_in: 0,
					bytes_out: 0,
				}),
				handler: Mutex::new(None),
			}),
		}
	}

	pub fn id(&self) -> u64 {
		self.shared.id
	}

	pub fn core(&self) -> &Arc<Core> {
		&self.shared.core
	}

	pub fn state(&self) -> State {
		self.shared.inner.lock().state
	}

	pub fn is_connected(&self) -> bool {
		self.state() == State::Connected
	}

	pub fn set_handler(&self, handler: Arc<dyn SocketHandler>) {
		*self.shared.handler.lock() = Some(handler);
	}

	pub fn set_family(&self, family: Option<Family>) {
		self.shared.inner.lock().family = family;
	}

	pub fn priority(&self) -> Priority {
		self.shared.inner.lock().priority
	}

	pub fn set_priority(&self, priority: Priority) {
		let mut inner = self.shared.inner.lock();
		inner.priority = priority;
		// The bumped value stays in effect while connecting/listening.
		if !matches!(
			inner.state,
			State::Resolving | State::Connecting | State::Listening
		) {
			self
				.shared
				.actual_priority
				.store(priority, Ordering::Relaxed);
		}
	}

	pub fn set_group(&self, group: Option<Group>) {
		if let Some(g) = &group {
			g.add_member(self);
		}
		self.shared.inner.lock().group = group;
	}

	pub fn group(&self) -> Option<Group> {
		self.shared.inner.lock().group.clone()
	}

	pub fn throttle_in(&self) -> Arc<Throttle> {
		self.shared.inner.lock().throttle_in.clone()
	}

	pub fn throttle_out(&self) -> Arc<Throttle> {
		self.shared.inner.lock().throttle_out.clone()
	}

	/// Arrange for TLS to start automatically: on connect success (client
	/// mode) or on every accepted socket (server mode, inherited).
	pub fn set_tls_autostart(&self, params: Arc<TlsParams>) {
		let mut inner = self.shared.inner.lock();
		inner.tls_params = Some(params);
		inner.tls_autostart = true;
	}

	pub fn local_addr(&self) -> Option<Address> {
		self.shared.inner.lock().local_addr.clone()
	}

	pub fn peer_addr(&self) -> Option<Address> {
		self.shared.inner.lock().peer_addr.clone()
	}

	pub fn bytes_received(&self) -> u64 {
		self.shared.inner.lock().bytes_in
	}

	pub fn bytes_sent(&self) -> u64 {
		self.shared.inner.lock().bytes_out
	}

	/// Peer certificate status of the active TLS session, if any.
	pub fn tls_peer_status(&self) -> Option<crate::tls::CertStatus> {
		let inner = self.shared.inner.lock();
		inner
			.pipeline
			.as_ref()
			.and_then(|p| p.tls())
			.map(|t| t.verify_peer())
	}

	// ---- lifecycle operations ------------------------------------------------

	pub fn connect(&self, spec: &str) -> Result<()> {
		self.begin(spec, Intent::Connect)
	}

	pub fn listen(&self, spec: &str) -> Result<()> {
		self.begin(spec, Intent::Listen)
	}

	pub fn bind(&self, spec: &str) -> Result<()> {
		self.begin(spec, Intent::Bind)
	}

	fn begin(&self, spec: &str, intent: Intent) -> Result<()> {
		let target = Target::parse(spec)?;
		{
			let mut inner = self.shared.inner.lock();
			if inner.state != State::Closed {
				return Err(Error::AlreadyActive);
			}
			inner.state = State::Resolving;
			inner.intent = Some(intent);
			inner.delayed_close = false;
			if intent == Intent::Connect {
				inner.server_name_hint = target.host().map(str::to_string);
			}
			self
				.shared
				.actual_priority
				.store(inner.priority - PRIORITY_BUMP, Ordering::Relaxed);
		}
		let this = self.clone();
		let spec = spec.to_string();
		let prio = self.shared.actual_priority.load(Ordering::Relaxed);
		self.shared.core.sched().post(prio, move || {
			this.start_resolve(spec);
		});
		Ok(())
	}

	fn start_resolve(&self, spec: String) {
		self.emit(&[Ev::State(State::Closed, State::Resolving)]);
		let prio = self.shared.actual_priority.load(Ordering::Relaxed);
		let this = self.clone();
		let handle = self
			.shared
			.core
			.resolver()
			.resolve(&spec, prio, move |result| {
				this.resolve_done(result);
			});
		let mut inner = self.shared.inner.lock();
		if inner.state == State::Resolving {
			inner.resolve = Some(handle);
			let timeout = self.shared.core.config().connect_timeout;
			if inner.intent == Some(Intent::Connect) && !timeout.is_zero() {
				let this = self.clone();
				inner.connect_timer = Some(self.shared.core.sched().post_after(timeout, prio, move || {
					this.connect_timed_out()
				}));
			}
		} else {
			// Closed while the task was queued.
			handle.cancel();
		}
	}

	fn resolve_done(&self, result: std::result::Result<Vec<Address>, Error>) {
		let mut evs = Vec::new();
		{
			let mut inner = self.shared.inner.lock();
			inner.resolve = None;
			if inner.state != State::Resolving {
				return;
			}
			let candidates = match result {
				Ok(c) => c,
				Err(e) => {
					evs.push(Ev::Error(e));
					self.finalize_locked(&mut inner, &mut evs);
					drop(inner);
					self.emit(&evs);
					return;
				},
			};
			let chosen = candidates
				.into_iter()
				.find(|a| inner.family.is_none_or(|f| a.family() == f));
			let Some(addr) = chosen else {
				evs.push(Ev::Error(Error::InvalidAddress(
					"no candidate matches the socket family".into(),
				)));
				self.finalize_locked(&mut inner, &mut evs);
				drop(inner);
				self.emit(&evs);
				return;
			};
			let step = match inner.intent {
				Some(Intent::Connect) => self.open_connect(&mut inner, addr, &mut evs),
				Some(Intent::Listen) => self.open_listen(&mut inner, addr, &mut evs),
				Some(Intent::Bind) => self.open_bind(&mut inner, addr, &mut evs),
				None => Ok(()),
			};
			if let Err(e) = step {
				evs.push(Ev::Error(e));
				self.finalize_locked(&mut inner, &mut evs);
			}
		}
		self.emit(&evs);
	}

	fn open_connect(&self, inner: &mut Inner, addr: Address, evs: &mut Vec<Ev>) -> Result<()> {
		let raw = match &addr {
			Address::Inet(sa) => {
				let stream = mio::net::TcpStream::connect(*sa)?;
				let _ = stream.set_nodelay(true);
				RawStream::Tcp(stream)
			},
			#[cfg(unix)]
			Address::Local(path) => RawStream::Unix(mio::net::UnixStream::connect(path)?),
			#[cfg(not(unix))]
			Address::Local(_) => {
				return Err(Error::InvalidAddress("local sockets unsupported".into()));
			},
		};
		inner.io = Io::Stream(raw);
		inner.peer_addr = Some(addr);
		self.register(inner, Cond::OUT)?;
		inner.state = State::Connecting;
		evs.push(Ev::State(State::Resolving, State::Connecting));
		trace!(socket = self.shared.id, "connecting");
		Ok(())
	}

	fn open_listen(&self, inner: &mut Inner, addr: Address, evs: &mut Vec<Ev>) -> Result<()> {
		match &addr {
			Address::Inet(sa) => {
				inner.io = Io::TcpListener(mio::net::TcpListener::bind(*sa)?);
				if let Io::TcpListener(l) = &inner.io {
					inner.local_addr = Some(Address::Inet(l.local_addr()?));
				}
			},
			#[cfg(unix)]
			Address::Local(path) => {
				inner.io = Io::UnixListener(mio::net::UnixListener::bind(path)?);
				inner.local_addr = Some(addr.clone());
			},
			#[cfg(not(unix))]
			Address::Local(_) => {
				return Err(Error::InvalidAddress("local sockets unsupported".into()));
			},
		}
		// Listeners keep the elevated priority so accepts beat ordinary I/O.
		self.register(inner, Cond::IN)?;
		inner.state = State::Listening;
		evs.push(Ev::State(State::Resolving, State::Listening));
		debug!(socket = self.shared.id, addr = %addr, "listening");
		Ok(())
	}

	fn open_bind(&self, inner: &mut Inner, addr: Address, evs: &mut Vec<Ev>) -> Result<()> {
		let (sock, family) = match &addr {
			Address::Inet(sa) => {
				let domain = if sa.is_ipv4() {
					socket2::Domain::IPV4
				} else {
					socket2::Domain::IPV6
				};
				let sock = socket2::Socket::new(domain, socket2::Type::STREAM, None)?;
				sock.set_nonblocking(true)?;
				sock.set_reuse_address(true)?;
				sock.bind(&(*sa).into())?;
				let family = addr.family();
				(sock, family)
			},
			#[cfg(unix)]
			Address::Local(path) => {
				let sock = socket2::Socket::new(socket2::Domain::UNIX, socket2::Type::STREAM, None)?;
				sock.set_nonblocking(true)?;
				sock.bind(&socket2::SockAddr::unix(path)?)?;
				(sock, Family::Local)
			},
			#[cfg(not(unix))]
			Address::Local(_) => {
				return Err(Error::InvalidAddress("local sockets unsupported".into()));
			},
		};
		// The OS may have assigned the port; report what it actually bound.
		let bound_addr = sock
			.local_addr()
			.ok()
			.and_then(|sa| sa.as_socket().map(Address::Inet))
			.unwrap_or(addr);
		inner.io = Io::Bound(sock, family);
		inner.local_addr = Some(bound_addr);
		inner.state = State::Bound;
		self
			.shared
			.actual_priority
			.store(inner.priority, Ordering::Relaxed);
		evs.push(Ev::State(State::Resolving, State::Bound));
		Ok(())
	}

	/// Promote a `Bound` socket to `Listening`.
	pub fn listen_bound(&self) -> Result<()> {
		let mut evs = Vec::new();
		{
			let mut inner = self.shared.inner.lock();
			if inner.state != State::Bound {
				return Err(Error::AlreadyActive);
			}
			let Io::Bound(sock, family) = std::mem::replace(&mut inner.io, Io::None) else {
				return Err(Error::AlreadyActive);
			};
			sock.listen(1024)?;
			match family {
				Family::Ipv4 | Family::Ipv6 => {
					let std_listener: std::net::TcpListener = sock.into();
					inner.io = Io::TcpListener(mio::net::TcpListener::from_std(std_listener));
				},
				#[cfg(unix)]
				Family::Local => {
					let std_listener: std::os::unix::net::UnixListener = sock.into();
					inner.io = Io::UnixListener(mio::net::UnixListener::from_std(std_listener));
				},
				#[cfg(not(unix))]
				Family::Local => return Err(Error::InvalidAddress("local sockets unsupported".into())),
			}
			self
				.shared
				.actual_priority
				.store(inner.priority - PRIORITY_BUMP, Ordering::Relaxed);
			self.register(&mut inner, Cond::IN)?;
			inner.state = State::Listening;
			evs.push(Ev::State(State::Bound, State::Listening));
		}
		self.emit(&evs);
		Ok(())
	}

	/// Insert a TLS layer into the pipeline of a connected socket.
	pub fn starttls(&self, params: Arc<TlsParams>) -> Result<()> {
		let mut evs = Vec::new();
		{
			let mut inner = self.shared.inner.lock();
			if inner.state != State::Connected {
				return Err(Error::NotConnected);
			}
			let Some(pipeline) = inner.pipeline.as_ref() else {
				return Err(Error::NotConnected);
			};
			if pipeline.has_tls() {
				return Err(Error::AlreadyActive);
			}
			let session = TlsSession::new(&params, inner.server_name_hint.as_deref())?;
			if let Some(p) = inner.pipeline.as_mut() {
				p.install_tls(session);
			}
			inner.tls_params = Some(params);
			inner.state = State::TlsHandshaking;
			evs.push(Ev::State(State::Connected, State::TlsHandshaking));
		}
		self.emit(&evs);
		self.drive_handshake();
		Ok(())
	}

	/// Graceful close: queue a TLS bye if applicable, flush buffered output,
	/// then release the OS handle and emit `on_closed` once.
	pub fn close(&self) {
		let this = self.clone();
		let prio = self.shared.actual_priority.load(Ordering::Relaxed);
		self.shared.core.sched().post(prio, move || this.do_close());
	}

	fn do_close(&self) {
		let mut evs = Vec::new();
		{
			let mut inner = self.shared.inner.lock();
			match inner.state {
				State::Closed | State::Closing => {},
				State::Connected | State::TlsHandshaking => {
					if let Some(p) = inner.pipeline.as_mut()
						&& let Some(tls) = p.tls_mut()
					{
						tls.close();
					}
					self.flush_locked(&mut inner);
					if inner
						.pipeline
						.as_ref()
						.is_some_and(|p| p.has_pending_output())
					{
						let old = inner.state;
						inner.state = State::Closing;
						ensure_watch(&self.shared, &mut inner, Cond::OUT);
						evs.push(Ev::State(old, State::Closing));
					} else {
						self.finalize_locked(&mut inner, &mut evs);
					}
				},
				_ => {
					self.finalize_locked(&mut inner, &mut evs);
				},
			}
		}
		self.emit(&evs);
	}

	/// Half-close the write direction. With TLS, the session's bye goes out
	/// before the transport shutdown.
	pub fn shutdown_write(&self) -> Result<()> {
		let mut inner = self.shared.inner.lock();
		if inner.state != State::Connected {
			return Err(Error::NotConnected);
		}
		if let Some(p) = inner.pipeline.as_mut()
			&& let Some(tls) = p.tls_mut()
		{
			tls.shutdown_write();
		}
		self.flush_locked(&mut inner);
		if let Io::Stream(raw) = &inner.io {
			raw.shutdown_write()?;
		}
		Ok(())
	}

	// ---- data path -----------------------------------------------------------

	/// Read decrypted, throttled bytes. Returns `Ok(0)` when nothing is
	/// available right now (readiness has been rearmed) and on end of
	/// stream, where the close event carries the real signal.
	pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
		if buf.is_empty() {
			return Ok(0);
		}
		let mut evs = Vec::new();
		let out;
		{
			let mut guard = self.shared.inner.lock();
			let inner = &mut *guard;
			match inner.state {
				State::Connected | State::Closing => {},
				State::Closed => return Err(Error::Closed),
				_ => return Err(Error::NotReadable),
			}
			let Io::Stream(raw) = &mut inner.io else {
				return Err(Error::NotReadable);
			};
			let Some(pipeline) = inner.pipeline.as_mut() else {
				return Err(Error::NotReadable);
			};
			match pipeline.read(raw, buf) {
				ReadOutcome::Data { n, drained } => {
					inner.bytes_in += n as u64;
					if drained {
						ensure_watch(&self.shared, inner, Cond::IN);
					}
					out = Ok(n);
				},
				ReadOutcome::WouldBlock => {
					inner.cond = inner.cond & !Cond::IN;
					ensure_watch(&self.shared, inner, Cond::IN);
					out = Ok(0);
				},
				ReadOutcome::Throttled(wait) => {
					let this = self.clone();
					let prio = self.shared.actual_priority.load(Ordering::Relaxed);
					self
						.shared
						.core
						.sched()
						.post_after(wait, prio, move || this.retry_read());
					out = Ok(0);
				},
				ReadOutcome::Eof => {
					self.finalize_locked(inner, &mut evs);
					out = Ok(0);
				},
			}
		}
		self.emit(&evs);
		out
	}

	/// Push bytes back into the buffered layer; the next read returns them
	/// first.
	pub fn unread(&self, bytes: &[u8]) -> Result<()> {
		let mut inner = self.shared.inner.lock();
		match inner.state {
			State::Connected | State::Closing => {},
			_ => return Err(Error::NotReadable),
		}
		match inner.pipeline.as_mut() {
			Some(p) => {
				p.unread(bytes);
				Ok(())
			},
			None => Err(Error::NotReadable),
		}
	}

	/// Write through the pipeline. Bytes not accepted by the OS are buffered
	/// up to the configured cap; the return value is what the pipeline took.
	pub fn write(&self, buf: &[u8]) -> Result<usize> {
		if buf.is_empty() {
			return Ok(0);
		}
		let mut guard = self.shared.inner.lock();
		let inner = &mut *guard;
		match inner.state {
			State::Connected => {},
			State::Closed | State::Closing => return Err(Error::Closed),
			_ => return Err(Error::NotWritable),
		}
		let Io::Stream(raw) = &mut inner.io else {
			return Err(Error::NotWritable);
		};
		let Some(pipeline) = inner.pipeline.as_mut() else {
			return Err(Error::NotWritable);
		};
		let result = pipeline.write(raw, buf);
		inner.bytes_out += result.accepted as u64;
		if result.filled {
			ensure_watch(&self.shared, inner, Cond::OUT);
		}
		match result.flush {
			FlushState::Idle => {},
			FlushState::Blocked => {
				inner.cond = inner.cond & !Cond::OUT;
				ensure_watch(&self.shared, inner, Cond::OUT);
			},
			FlushState::Throttled(wait) => {
				let this = self.clone();
				let prio = self.shared.actual_priority.load(Ordering::Relaxed);
				self
					.shared
					.core
					.sched()
					.post_after(wait, prio, move || this.retry_flush());
			},
		}
		Ok(result.accepted)
	}

	// ---- readiness plumbing --------------------------------------------------

	fn register(&self, inner: &mut Inner, interest: Cond) -> Result<()> {
		if inner.token.is_some() {
			return Err(Error::AlreadyActive);
		}
		let weak = Arc::downgrade(&self.shared);
		let Some(source) = inner.io.source_mut() else {
			return Err(Error::NotConnected);
		};
		let token = self
			.shared
			.core
			.reactor()
			.add(source, interest, move |cond| {
				if let Some(shared) = weak.upgrade() {
					Socket { shared }.on_reactor_event(cond);
				}
			})?;
		inner.token = Some(token);
		inner.watched_cond = interest;
		Ok(())
	}

	/// Runs on the reactor thread: coalesce bits and post at most one
	/// dispatch task.
	fn on_reactor_event(&self, cond: Cond) {
		let mut r = self.shared.readiness.lock();
		r.new_cond |= cond;
		if !r.dispatch_pending {
			r.dispatch_pending = true;
			let this = self.clone();
			let prio = self.shared.actual_priority.load(Ordering::Relaxed);
			self.shared.core.sched().post(prio, move || this.dispatch());
		}
	}

	fn dispatch(&self) {
		let newly = {
			let mut r = self.shared.readiness.lock();
			r.dispatch_pending = false;
			std::mem::replace(&mut r.new_cond, Cond::NONE)
		};
		if newly.is_empty() {
			return;
		}
		self.process(newly);
	}

	fn process(&self, newly: Cond) {
		let mut evs = Vec::new();
		let mut handshake = false;
		{
			let mut guard = self.shared.inner.lock();
			let inner = &mut *guard;
			let hup = newly.intersects(Cond::HUP | Cond::ERR);
			trace!(socket = self.shared.id, state = ?inner.state, cond = ?newly, "dispatch");
			match inner.state {
				State::Connecting => {
					self.connecting_ready(inner, newly, hup, &mut evs);
				},
				State::Listening => {
					if newly.contains(Cond::IN) {
						self.accept_loop(inner, &mut evs);
					}
				},
				State::TlsHandshaking => {
					inner.cond |= newly & (Cond::IN | Cond::OUT);
					if hup {
						evs.push(Ev::Error(Error::Closed));
						self.finalize_locked(inner, &mut evs);
					} else {
						handshake = true;
					}
				},
				State::Connected | State::Closing => {
					inner.cond |= newly & (Cond::IN | Cond::OUT);
					if newly.contains(Cond::OUT) {
						self.writable_ready(inner, &mut evs);
					}
					if newly.contains(Cond::IN)
						&& matches!(inner.state, State::Connected | State::Closing)
					{
						evs.push(Ev::Readable);
					}
					if hup {
						self.hangup(inner, &mut evs);
					}
				},
				State::Closed | State::Resolving | State::Bound => {},
			}
		}
		self.emit(&evs);
		// Covers the connect side; accepted sockets start theirs right after
		// the on_accept emission.
		self.maybe_autostart_tls();
		if handshake {
			self.drive_handshake();
		}
	}

	fn connecting_ready(&self, inner: &mut Inner, newly: Cond, hup: bool, evs: &mut Vec<Ev>) {
		let so_error = match &inner.io {
			Io::Stream(raw) => raw.take_error(),
			_ => return,
		};
		match so_error {
			Ok(Some(e)) => {
				debug!(socket = self.shared.id, "connect refused: {e}");
				evs.push(Ev::Error(Error::ConnectRefused));
				self.finalize_locked(inner, evs);
				return;
			},
			Ok(None) => {},
			Err(e) => {
				evs.push(Ev::Error(Error::Io(e)));
				self.finalize_locked(inner, evs);
				return;
			},
		}
		let established = match &inner.io {
			Io::Stream(raw) => newly.contains(Cond::OUT) && raw.peer_addr().is_ok(),
			_ => false,
		};
		if established {
			self.finish_connect(inner, evs);
		} else if hup {
			evs.push(Ev::Error(Error::ConnectRefused));
			self.finalize_locked(inner, evs);
		}
	}

	fn finish_connect(&self, inner: &mut Inner, evs: &mut Vec<Ev>) {
		if let Some(t) = inner.connect_timer.take() {
			t.cancel();
		}
		if let Io::Stream(raw) = &inner.io {
			inner.local_addr = raw.local_addr().ok();
			if inner.peer_addr.is_none() {
				inner.peer_addr = raw.peer_addr().ok();
			}
		}
		inner.pipeline = Some(self.build_pipeline(inner));
		inner.cond |= Cond::OUT;
		inner.state = State::Connected;
		self
			.shared
			.actual_priority
			.store(inner.priority, Ordering::Relaxed);
		set_watch(&self.shared, inner, Cond::IN);
		evs.push(Ev::State(State::Connecting, State::Connected));
		evs.push(Ev::Writable);
		debug!(socket = self.shared.id, peer = ?inner.peer_addr, "connected");
	}

	fn build_pipeline(&self, inner: &Inner) -> Pipeline {
		let mut throttles_in = vec![inner.throttle_in.clone()];
		let mut throttles_out = vec![inner.throttle_out.clone()];
		if let Some(group) = &inner.group {
			throttles_in.push(group.throttle_in().clone());
			throttles_out.push(group.throttle_out().clone());
		}
		Pipeline::new(
			throttles_in,
			throttles_out,
			self.shared.core.config().write_buffer_size,
		)
	}

	fn accept_loop(&self, inner: &mut Inner, evs: &mut Vec<Ev>) {
		loop {
			let accepted = match &mut inner.io {
				Io::TcpListener(l) => l.accept().map(|(s, _)| {
					let _ = s.set_nodelay(true);
					RawStream::Tcp(s)
				}),
				#[cfg(unix)]
				Io::UnixListener(l) => l.accept().map(|(s, _)| RawStream::Unix(s)),
				_ => return,
			};
			match accepted {
				Ok(raw) => match self.adopt_child(inner, raw) {
					Ok(child) => evs.push(Ev::Accept(child)),
					Err(e) => evs.push(Ev::Error(e)),
				},
				Err(e) if would_block(&e) => {
					inner.cond = inner.cond & !Cond::IN;
					break;
				},
				Err(e) => {
					warn!(socket = self.shared.id, "accept failed: {e}");
					evs.push(Ev::Error(Error::AcceptFailed(e)));
					break;
				},
			}
		}
	}

	/// Build a `Connected` socket for an accepted stream, inheriting the
	/// listener's priority, group and TLS properties.
	fn adopt_child(&self, parent: &Inner, raw: RawStream) -> Result<Socket> {
		let child = Socket::new(&self.shared.core);
		{
			let mut ci = child.shared.inner.lock();
			ci.priority = parent.priority;
			child
				.shared
				.actual_priority
				.store(parent.priority, Ordering::Relaxed);
			ci.family = parent.family;
			ci.group = parent.group.clone();
			ci.tls_params = parent.tls_params.clone();
			ci.tls_autostart = parent.tls_autostart;
			ci.local_addr = raw.local_addr().ok();
			ci.peer_addr = raw.peer_addr().ok();
			ci.io = Io::Stream(raw);
			ci.pipeline = Some(child.build_pipeline(&ci));
			ci.cond = Cond::OUT;
			child.register(&mut ci, Cond::IN)?;
			ci.state = State::Connected;
		}
		if let Some(group) = parent.group.clone() {
			group.add_member(&child);
		}
		Ok(child)
	}

	fn writable_ready(&self, inner: &mut Inner, evs: &mut Vec<Ev>) {
		let pending = inner
			.pipeline
			.as_ref()
			.is_some_and(|p| p.has_pending_output());
		if pending {
			self.flush_locked(inner);
		}
		let still_pending = inner
			.pipeline
			.as_ref()
			.is_some_and(|p| p.has_pending_output());
		if inner.state == State::Closing {
			if !still_pending {
				self.finalize_locked(inner, evs);
			}
		} else if !still_pending {
			evs.push(Ev::Writable);
		}
	}

	fn flush_locked(&self, inner: &mut Inner) {
		let Io::Stream(raw) = &mut inner.io else {
			return;
		};
		let Some(pipeline) = inner.pipeline.as_mut() else {
			return;
		};
		match pipeline.flush(raw) {
			FlushState::Idle => {},
			FlushState::Blocked => {
				inner.cond = inner.cond & !Cond::OUT;
				ensure_watch(&self.shared, inner, Cond::OUT);
			},
			FlushState::Throttled(wait) => {
				let this = self.clone();
				let prio = self.shared.actual_priority.load(Ordering::Relaxed);
				self
					.shared
					.core
					.sched()
					.post_after(wait, prio, move || this.retry_flush());
			},
		}
	}

	fn hangup(&self, inner: &mut Inner, evs: &mut Vec<Ev>) {
		if !matches!(inner.state, State::Connected | State::Closing) {
			return;
		}
		let has_tls = inner.pipeline.as_ref().is_some_and(|p| p.has_tls());
		let buffered = inner
			.pipeline
			.as_ref()
			.is_some_and(|p| p.has_buffered_input());
		let mut pending = buffered;
		if !buffered && !has_tls {
			// Read-confirmation: a one-byte read distinguishes a spurious
			// hang-up notification from a true half-close.
			let Io::Stream(raw) = &mut inner.io else {
				return;
			};
			let Some(pipeline) = inner.pipeline.as_mut() else {
				return;
			};
			let mut probe = [0u8; 1];
			match pipeline.read(raw, &mut probe) {
				ReadOutcome::Data { n, .. } if n > 0 => {
					pipeline.unread(&probe[..n]);
					pending = true;
				},
				ReadOutcome::Data { .. } => {},
				ReadOutcome::Eof => pending = false,
				ReadOutcome::WouldBlock => {
					// Nothing to read and the stream is still open.
					trace!(socket = self.shared.id, "spurious hangup");
					return;
				},
				ReadOutcome::Throttled(_) => pending = true,
			}
		}
		if pending {
			inner.delayed_close = true;
			// Nudge the application to drain the remaining bytes.
			evs.push(Ev::Readable);
		} else {
			self.finalize_locked(inner, evs);
		}
	}

	fn drive_handshake(&self) {
		let mut evs = Vec::new();
		{
			let mut guard = self.shared.inner.lock();
			let inner = &mut *guard;
			if inner.state != State::TlsHandshaking {
				return;
			}
			let Io::Stream(raw) = &mut inner.io else {
				return;
			};
			let Some(pipeline) = inner.pipeline.as_mut() else {
				return;
			};
			match pipeline.handshake(raw) {
				Ok(HandshakeOutcome::Done) => {
					inner.state = State::Connected;
					evs.push(Ev::State(State::TlsHandshaking, State::Connected));
					if inner.cond.contains(Cond::OUT) {
						evs.push(Ev::Writable);
					}
				},
				Ok(HandshakeOutcome::WantRead) => {
					inner.cond = inner.cond & !Cond::IN;
					ensure_watch(&self.shared, inner, Cond::IN);
				},
				Ok(HandshakeOutcome::WantWrite) => {
					inner.cond = inner.cond & !Cond::OUT;
					ensure_watch(&self.shared, inner, Cond::OUT);
				},
				Ok(HandshakeOutcome::Throttled(wait)) => {
					let this = self.clone();
					let prio = self.shared.actual_priority.load(Ordering::Relaxed);
					self
						.shared
						.core
						.sched()
						.post_after(wait, prio, move || this.drive_handshake());
				},
				Err(e) => {
					evs.push(Ev::Error(Error::TlsHandshake(e)));
					self.finalize_locked(inner, &mut evs);
				},
			}
		}
		self.emit(&evs);
	}

	fn retry_read(&self) {
		let allowed = matches!(self.state(), State::Connected | State::Closing);
		if allowed {
			self.emit(&[Ev::Readable]);
		}
	}

	fn retry_flush(&self) {
		let mut evs = Vec::new();
		{
			let mut inner = self.shared.inner.lock();
			if !matches!(inner.state, State::Connected | State::Closing) {
				return;
			}
			self.flush_locked(&mut inner);
			let still_pending = inner
				.pipeline
				.as_ref()
				.is_some_and(|p| p.has_pending_output());
			if !still_pending {
				if inner.state == State::Closing {
					self.finalize_locked(&mut inner, &mut evs);
				} else {
					evs.push(Ev::Writable);
				}
			}
		}
		self.emit(&evs);
	}

	fn connect_timed_out(&self) {
		let mut evs = Vec::new();
		{
			let mut inner = self.shared.inner.lock();
			if !matches!(inner.state, State::Resolving | State::Connecting) {
				return;
			}
			debug!(socket = self.shared.id, "connect timed out");
			evs.push(Ev::Error(Error::ConnectTimeout));
			self.finalize_locked(&mut inner, &mut evs);
		}
		self.emit(&evs);
	}

	/// Release the OS handle and transition to `Closed`. Emission of the
	/// state change and `on_closed` happens after the lock drops.
	fn finalize_locked(&self, inner: &mut Inner, evs: &mut Vec<Ev>) {
		if inner.state == State::Closed {
			return;
		}
		if let Some(t) = inner.connect_timer.take() {
			t.cancel();
		}
		if let Some(r) = inner.resolve.take() {
			r.cancel();
		}
		if let Some(token) = inner.token.take()
			&& let Some(source) = inner.io.source_mut()
		{
			self.shared.core.reactor().remove(source, token);
		}
		inner.io = Io::None;
		inner.pipeline = None;
		inner.watched_cond = Cond::NONE;
		inner.cond = Cond::NONE;
		inner.delayed_close = false;
		let old = inner.state;
		inner.state = State::Closed;
		self
			.shared
			.actual_priority
			.store(inner.priority, Ordering::Relaxed);
		evs.push(Ev::State(old, State::Closed));
		evs.push(Ev::Closed);
		debug!(socket = self.shared.id, from = ?old, "closed");
	}

	fn handler(&self) -> Option<Arc<dyn SocketHandler>> {
		self.shared.handler.lock().clone()
	}

	fn emit(&self, evs: &[Ev]) {
		if evs.is_empty() {
			return;
		}
		let Some(handler) = self.handler() else {
			// Still run TLS autostart for accepted children.
			for ev in evs {
				if let Ev::Accept(child) = ev {
					child.maybe_autostart_tls();
				}
			}
			return;
		};
		for ev in evs {
			match ev {
				Ev::State(old, new) => handler.on_state_changed(self, *old, *new),
				Ev::Readable => handler.on_readable(self),
				Ev::Writable => handler.on_writable(self),
				Ev::Closed => handler.on_closed(self),
				Ev::Error(e) => handler.on_error(self, e),
				Ev::Accept(child) => {
					handler.on_accept(self, child.clone());
					child.maybe_autostart_tls();
				},
			}
		}
	}

	fn maybe_autostart_tls(&self) {
		let params = {
			let inner = self.shared.inner.lock();
			if !inner.tls_autostart
				|| inner.state != State::Connected
				|| inner.pipeline.as_ref().is_some_and(|p| p.has_tls())
			{
				None
			} else {
				inner.tls_params.clone()
			}
		};
		if let Some(params) = params
			&& let Err(e) = self.starttls(params)
		{
			self.emit(&[Ev::Error(e)]);
		}
	}
}

fn set_watch(shared: &Shared, inner: &mut Inner, watched: Cond) {
	let Some(token) = inner.token else {
		return;
	};
	if inner.watched_cond == watched {
		return;
	}
	let reactor = shared.core.reactor().clone();
	let Some(source) = inner.io.source_mut() else {
		return;
	};
	match reactor.modify(source, token, watched) {
		Ok(()) => inner.watched_cond = watched,
		Err(e) => warn!("reactor modify failed: {e}"),
	}
}

/// Add `dir` to the watched set if it is not already there. Bits already
/// known-ready in `cond` still get watched; the reactor only reports edges,
/// so a bit is watched from the moment the socket cares about it.
fn ensure_watch(shared: &Shared, inner: &mut Inner, dir: Cond) {
	if inner.watched_cond.contains(dir) {
		return;
	}
	let watched = inner.watched_cond | dir;
	set_watch(shared, inner, watched);
}

impl std::fmt::Debug for Socket {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Socket")
			.field("id", &self.shared.id)
			.field("state", &self.state())
			.finish()
	}
}

// Tests for the state machine live in tests/socket.rs; the loopback setup
// they need is too heavy for a unit module.

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn new_socket_starts_closed() {
		let core = Core::with_config(crate::config::Config::default()).unwrap();
		let s = Socket::new(&core);
		assert_eq!(s.state(), State::Closed);
		assert_eq!(s.bytes_sent(), 0);
		core.shutdown();
	}

	#[test]
	fn begin_twice_is_already_active() {
		let core = Core::with_config(crate::config::Config::default()).unwrap();
		let s = Socket::new(&core);
		s.listen("127.0.0.1:0").unwrap();
		assert!(matches!(
			s.connect("127.0.0.1:1"),
			Err(Error::AlreadyActive)
		));
		core.shutdown();
	}

	#[test]
	fn read_write_require_connection() {
		let core = Core::with_config(crate::config::Config::default()).unwrap();
		let s = Socket::new(&core);
		let mut buf = [0u8; 4];
		assert!(matches!(s.read(&mut buf), Err(Error::Closed)));
		assert!(matches!(s.write(b"x"), Err(Error::Closed)));
		core.shutdown();
	}
}

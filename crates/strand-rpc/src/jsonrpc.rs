use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strand::errors::Error;
use strand::peer::Peer;
use strand::transport::Transport;
use tracing::{debug, trace};

/// Wire shape of a request: strictly `{id, method, params}`. A null id
/// marks a notification.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RequestMsg {
	id: Value,
	method: String,
	params: Value,
}

/// Wire shape of a response: strictly `{id, result, error}`, exactly one of
/// `result`/`error` non-null.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResponseMsg {
	id: Value,
	result: Value,
	error: Value,
}

/// Terminal outcome of an outbound invocation: exactly one of these fires
/// per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
	Result(Value),
	Error(Value),
	Cancelled,
}

type Completion = Box<dyn FnOnce(CallOutcome) + Send + 'static>;
type MethodHandler = Arc<dyn Fn(MethodCall) + Send + Sync + 'static>;

struct InboundOrigin {
	peer: Peer,
	id: Value,
}

/// A JSON-RPC session multiplexing over any number of transports.
///
/// Outbound ids are `"<session-handle>.<counter>"`, unique across sessions
/// sharing a transport. Inbound ids are echoed verbatim.
#[derive(Clone)]
pub struct Session {
	shared: Arc<SessionShared>,
}

struct SessionShared {
	handle: u64,
	counter: AtomicU64,
	outbound: Mutex<HashMap<String, Completion>>,
	inbound: Mutex<HashMap<String, InboundOrigin>>,
	method_handler: Mutex<Option<MethodHandler>>,
	/// The peer whose message is currently being read; responses route back
	/// through it without appearing on the wire.
	current_peer: Mutex<Option<Peer>>,
}

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

impl Default for Session {
	fn default() -> Self {
		Self::new()
	}
}

impl Session {
	pub fn new() -> Session {
		Session {
			shared: Arc::new(SessionShared {
				handle: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
				counter: AtomicU64::new(0),
				outbound: Mutex::new(HashMap::new()),
				inbound: Mutex::new(HashMap::new()),
				method_handler: Mutex::new(None),
				current_peer: Mutex::new(None),
			}),
		}
	}

	/// Handler for inbound method calls (and notifications, which carry no
	/// way to respond).
	pub fn set_method_handler(&self, f: impl Fn(MethodCall) + Send + Sync + 'static) {
		*self.shared.method_handler.lock() = Some(Arc::new(f));
	}

	/// Route a transport's receive signal into this session.
	pub fn attach(&self, transport: &Arc<dyn Transport>) {
		let session = self.clone();
		transport.events().on_receive(move |peer| {
			let Some(bytes) = peer.receive_bytes() else {
				return;
			};
			if let Err(e) = session.read(peer, &bytes) {
				debug!(peer = %peer.id(), "dropping bad frame: {e}");
			}
		});
	}

	fn next_id(&self) -> String {
		let n = self.shared.counter.fetch_add(1, Ordering::Relaxed) + 1;
		format!("{:x}.{n}", self.shared.handle)
	}

	/// Invoke `method` on the peer. The completion fires exactly once with
	/// the result, the remote error, or cancellation.
	pub fn call(
		&self,
		peer: &Peer,
		method: &str,
		params: Value,
		completion: impl FnOnce(CallOutcome) + Send + 'static,
	) -> Result<CallHandle, Error> {
		let id = self.next_id();
		let msg = RequestMsg {
			id: Value::String(id.clone()),
			method: method.to_string(),
			params,
		};
		let frame = serde_json::to_vec(&msg)
			.map_err(|e| Error::ProtocolViolation(e.to_string()))?;
		self
			.shared
			.outbound
			.lock()
			.insert(id.clone(), Box::new(completion));
		if let Err(e) = peer.send(Bytes::from(frame)) {
			self.shared.outbound.lock().remove(&id);
			return Err(e);
		}
		trace!(%id, %method, "invocation sent");
		Ok(CallHandle {
			session: Arc::downgrade(&self.shared),
			id,
		})
	}

	/// A request with a null id: fire-and-forget, no response expected.
	pub fn notify(&self, peer: &Peer, method: &str, params: Value) -> Result<(), Error> {
		let msg = RequestMsg {
			id: Value::Null,
			method: method.to_string(),
			params,
		};
		let frame = serde_json::to_vec(&msg)
			.map_err(|e| Error::ProtocolViolation(e.to_string()))?;
		peer.send(Bytes::from(frame))
	}

	/// The peer whose message is currently being dispatched, if any. Only
	/// meaningful from inside a method or completion handler.
	pub fn current_peer(&self) -> Option<Peer> {
		self.shared.current_peer.lock().clone()
	}

	/// Feed one framed message received from `peer` into the session.
	///
	/// A malformed message aborts with `ProtocolViolation` but leaves the
	/// session and its pending invocations intact.
	pub fn read(&self, peer: &Peer, frame: &[u8]) -> Result<(), Error> {
		*self.shared.current_peer.lock() = Some(peer.clone());
		let outcome = self.read_inner(peer, frame);
		*self.shared.current_peer.lock() = None;
		outcome
	}

	fn read_inner(&self, peer: &Peer, frame: &[u8]) -> Result<(), Error> {
		let value: Value = serde_json::from_slice(frame)
			.map_err(|e| Error::ProtocolViolation(format!("bad json: {e}")))?;
		let Value::Object(ref obj) = value else {
			return Err(Error::ProtocolViolation("message is not an object".into()));
		};
		if obj.contains_key("method") {
			let req: RequestMsg = serde_json::from_value(value)
				.map_err(|e| Error::ProtocolViolation(format!("bad request: {e}")))?;
			self.dispatch_request(peer, req)
		} else {
			let resp: ResponseMsg = serde_json::from_value(value)
				.map_err(|e| Error::ProtocolViolation(format!("bad response: {e}")))?;
			self.dispatch_response(resp)
		}
	}

	fn dispatch_request(&self, peer: &Peer, req: RequestMsg) -> Result<(), Error> {
		let id = if req.id.is_null() {
			None
		} else {
			let key = id_key(&req.id);
			self.shared.inbound.lock().insert(
				key,
				InboundOrigin {
					peer: peer.clone(),
					id: req.id.clone(),
				},
			);
			Some(req.id)
		};
		let handler = self.shared.method_handler.lock().clone();
		let call = MethodCall {
			session: self.clone(),
			peer: peer.clone(),
			method: req.method,
			params: req.params,
			id: id.clone(),
		};
		match handler {
			Some(h) => {
				h(call);
				Ok(())
			},
			None => {
				// No dispatcher: answer requests with an error, drop
				// notifications.
				if id.is_some() {
					call.respond_error(Value::String("method not handled".into()))?;
				}
				Ok(())
			},
		}
	}

	fn dispatch_response(&self, resp: ResponseMsg) -> Result<(), Error> {
		let one_null = resp.result.is_null() != resp.error.is_null();
		if !one_null {
			return Err(Error::ProtocolViolation(
				"response must carry exactly one of result/error".into(),
			));
		}
		let key = id_key(&resp.id);
		let Some(completion) = self.shared.outbound.lock().remove(&key) else {
			return Err(Error::ProtocolViolation(format!(
				"response for unknown invocation {key}"
			)));
		};
		if resp.error.is_null() {
			completion(CallOutcome::Result(resp.result));
		} else {
			completion(CallOutcome::Error(resp.error));
		}
		Ok(())
	}

	fn respond_with(&self, id: &Value, result: Value, error: Value) -> Result<(), Error> {
		let key = id_key(id);
		let origin = self
			.shared
			.inbound
			.lock()
			.remove(&key)
			.ok_or_else(|| Error::ProtocolViolation(format!("no pending invocation {key}")))?;
		let msg = ResponseMsg {
			id: origin.id,
			result,
			error,
		};
		let frame = serde_json::to_vec(&msg)
			.map_err(|e| Error::ProtocolViolation(e.to_string()))?;
		origin.peer.send(Bytes::from(frame))
	}

	pub fn pending_calls(&self) -> usize {
		self.shared.outbound.lock().len()
	}
}

/// Stable map key for an id value; ids are echoed verbatim, so the JSON
/// text itself is the identity.
fn id_key(id: &Value) -> String {
	id.to_string()
}

/// An inbound invocation handed to the method handler. Responding consumes
/// the registered origin; a second respond fails.
pub struct MethodCall {
	session: Session,
	peer: Peer,
	method: String,
	params: Value,
	id: Option<Value>,
}

impl MethodCall {
	pub fn method(&self) -> &str {
		&self.method
	}

	pub fn params(&self) -> &Value {
		&self.params
	}

	pub fn peer(&self) -> &Peer {
		&self.peer
	}

	pub fn is_notification(&self) -> bool {
		self.id.is_none()
	}

	pub fn respond(&self, result: Value) -> Result<(), Error> {
		match &self.id {
			Some(id) => self.session.respond_with(id, result, Value::Null),
			None => Ok(()),
		}
	}

	pub fn respond_error(&self, error: Value) -> Result<(), Error> {
		match &self.id {
			Some(id) => self.session.respond_with(id, Value::Null, error),
			None => Ok(()),
		}
	}
}

/// Cancellation handle for an outbound invocation.
pub struct CallHandle {
	session: Weak<SessionShared>,
	id: String,
}

impl CallHandle {
	pub fn id(&self) -> &str {
		&self.id
	}

	/// Complete the invocation with `Cancelled`, exactly once. A no-op if
	/// the response already arrived.
	pub fn cancel(&self) {
		let Some(shared) = self.session.upgrade() else {
			return;
		};
		if let Some(completion) = shared.outbound.lock().remove(&self.id) {
			completion(CallOutcome::Cancelled);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::mpsc;
	use std::time::Duration;

	use strand::peer::PeerManager;
	use strand::transport::pair;
	use strand_core::sched::Scheduler;

	use super::*;

	fn rt() -> (
		strand_core::sched::SchedulerHandle,
		std::thread::JoinHandle<()>,
		PeerManager,
	) {
		let (sched, join) = Scheduler::spawn();
		let mgr = PeerManager::new(Duration::from_secs(60), Duration::from_secs(3600));
		(sched, join, mgr)
	}

	#[test]
	fn call_round_trip_over_pair_transport() {
		let (sched, join, mgr) = rt();
		let (a, b) = pair(&sched, &mgr);

		let caller = Session::new();
		let callee = Session::new();
		let dyn_a: Arc<dyn Transport> = a.clone();
		let dyn_b: Arc<dyn Transport> = b.clone();
		caller.attach(&dyn_a);
		callee.attach(&dyn_b);

		callee.set_method_handler(move |call| {
			assert_eq!(call.method(), "add");
			let args = call.params().as_array().cloned().unwrap();
			let sum = args[0].as_i64().unwrap() + args[1].as_i64().unwrap();
			call.respond(Value::from(sum)).unwrap();
		});

		let (tx, rx) = mpsc::channel();
		caller
			.call(
				&a.peer(),
				"add",
				serde_json::json!([2, 3]),
				move |outcome| {
					tx.send(outcome).unwrap();
				},
			)
			.unwrap();

		let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
		assert_eq!(outcome, CallOutcome::Result(Value::from(5)));
		assert_eq!(caller.pending_calls(), 0);

		sched.shutdown();
		join.join().unwrap();
	}

	#[test]
	fn notification_gets_no_response() {
		let (sched, join, mgr) = rt();
		let (a, b) = pair(&sched, &mgr);
		let caller = Session::new();
		let callee = Session::new();
		let dyn_a: Arc<dyn Transport> = a.clone();
		let dyn_b: Arc<dyn Transport> = b.clone();
		caller.attach(&dyn_a);
		callee.attach(&dyn_b);

		let (tx, rx) = mpsc::channel();
		callee.set_method_handler(move |call| {
			assert!(call.is_notification());
			// respond() on a notification is a no-op, not an error
			call.respond(Value::from(1)).unwrap();
			tx.send(call.method().to_string()).unwrap();
		});

		caller
			.notify(&a.peer(), "ping", Value::Null)
			.unwrap();
		assert_eq!(
			rx.recv_timeout(Duration::from_secs(5)).unwrap(),
			"ping"
		);
		// Nothing came back to the caller.
		assert_eq!(caller.pending_calls(), 0);

		sched.shutdown();
		join.join().unwrap();
	}

	#[test]
	fn malformed_response_is_a_violation_and_keeps_session_open() {
		let session = Session::new();
		let (sched, join, mgr) = rt();
		let (a, _b) = pair(&sched, &mgr);
		let peer = a.peer();

		// Both result and error non-null.
		let bad = br#"{"id":"x.1","result":5,"error":"boom"}"#;
		assert!(matches!(
			session.read(&peer, bad),
			Err(Error::ProtocolViolation(_))
		));
		// Unknown keys are rejected too.
		let unknown = br#"{"id":null,"method":"m","params":[],"extra":1}"#;
		assert!(matches!(
			session.read(&peer, unknown),
			Err(Error::ProtocolViolation(_))
		));
		// The session still dispatches afterwards.
		let (tx, rx) = mpsc::channel();
		session.set_method_handler(move |call| {
			tx.send(call.method().to_string()).unwrap();
		});
		session
			.read(&peer, br#"{"id":null,"method":"ok","params":[]}"#)
			.unwrap();
		assert_eq!(rx.try_recv().unwrap(), "ok");

		sched.shutdown();
		join.join().unwrap();
	}

	#[test]
	fn cancel_fires_exactly_once() {
		let (sched, join, mgr) = rt();
		let (a, _b) = pair(&sched, &mgr);
		let session = Session::new();
		let (tx, rx) = mpsc::channel();
		let handle = session
			.call(&a.peer(), "slow", Value::Null, move |outcome| {
				tx.send(outcome).unwrap();
			})
			.unwrap();
		handle.cancel();
		handle.cancel();
		assert_eq!(
			rx.recv_timeout(Duration::from_secs(1)).unwrap(),
			CallOutcome::Cancelled
		);
		assert!(rx.try_recv().is_err());

		sched.shutdown();
		join.join().unwrap();
	}

	#[test]
	fn outbound_ids_are_unique_across_sessions() {
		let s1 = Session::new();
		let s2 = Session::new();
		let a = s1.next_id();
		let b = s2.next_id();
		let c = s1.next_id();
		assert_ne!(a, b);
		assert_ne!(a, c);
		assert!(a.contains('.'));
		assert_ne!(
			a.split('.').next().unwrap(),
			b.split('.').next().unwrap(),
			"sessions must not share a handle prefix"
		);
	}
}

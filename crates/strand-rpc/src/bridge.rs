use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde_json::Value;
use strand::peer::Peer;
use strand::transport::Transport;
use tracing::{debug, trace};

/// Commands of the control-bridge wire protocol. Each message is a
/// line-framed JSON array `[cmd, serial, subject, args]` where `args` is a
/// JSON-encoded tuple matching the command's signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
	Error = 1,
	Reply = 2,
	NewConnection = 3,
	CloseConnection = 4,
	OwnName = 5,
	UnownName = 6,
	NameAcquired = 7,
	NameLost = 8,
	RegisterObject = 9,
	UnregisterObject = 10,
	NewProxy = 11,
	CloseProxy = 12,
	CallMethod = 13,
	CallMethodReturn = 14,
	EmitSignal = 15,
}

impl Cmd {
	fn from_u8(v: u8) -> Option<Cmd> {
		Some(match v {
			1 => Cmd::Error,
			2 => Cmd::Reply,
			3 => Cmd::NewConnection,
			4 => Cmd::CloseConnection,
			5 => Cmd::OwnName,
			6 => Cmd::UnownName,
			7 => Cmd::NameAcquired,
			8 => Cmd::NameLost,
			9 => Cmd::RegisterObject,
			10 => Cmd::UnregisterObject,
			11 => Cmd::NewProxy,
			12 => Cmd::CloseProxy,
			13 => Cmd::CallMethod,
			14 => Cmd::CallMethodReturn,
			15 => Cmd::EmitSignal,
			_ => return None,
		})
	}
}

/// Error codes carried in `ERROR` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
	Failed = 0,
	InvalidMsg = 1,
	UnknownCommand = 2,
	InvalidSubject = 3,
	InvalidArgs = 4,
	ConnectionFailed = 5,
	AlreadyRegistered = 6,
	ProxyFailed = 7,
	UnknownMethod = 8,
}

/// A failure reported by the agent, mapped onto an `ERROR` reply.
#[derive(Debug, Clone)]
pub struct AgentError {
	pub code: ErrorCode,
	pub msg: Option<String>,
}

impl AgentError {
	pub fn new(code: ErrorCode, msg: impl Into<String>) -> AgentError {
		AgentError {
			code,
			msg: Some(msg.into()),
		}
	}

	pub fn code(code: ErrorCode) -> AgentError {
		AgentError { code, msg: None }
	}
}

/// Asynchronous completion for `CALL_METHOD`. Resolving sends
/// `CALL_METHOD_RETURN` (or `ERROR`) with the original serial.
pub struct MethodReply {
	peer: Peer,
	serial: u64,
	subject: u32,
}

impl MethodReply {
	pub fn resolve(self, json_result: &str, signature: &str) {
		send_msg(
			&self.peer,
			Cmd::CallMethodReturn,
			self.serial,
			self.subject,
			&args_tuple(&[Value::from(json_result), Value::from(signature)]),
		);
	}

	pub fn fail(self, error: AgentError) {
		send_error(&self.peer, self.serial, self.subject, &error);
	}
}

/// Pushes name-ownership notifications for one `OWN_NAME` registration.
/// Notifications reuse the registering request's serial for correlation.
pub struct NameWatch {
	peer: Peer,
	serial: u64,
	subject: u32,
}

impl NameWatch {
	pub fn acquired(&self, owning_id: u32) {
		send_msg(
			&self.peer,
			Cmd::NameAcquired,
			self.serial,
			self.subject,
			&args_tuple(&[Value::from(owning_id)]),
		);
	}

	pub fn lost(&self, owning_id: u32) {
		send_msg(
			&self.peer,
			Cmd::NameLost,
			self.serial,
			self.subject,
			&args_tuple(&[Value::from(owning_id)]),
		);
	}
}

/// The agent behind the bridge: the component that actually talks D-Bus.
/// All methods are invoked on the scheduler thread and must not block;
/// `call_method` completes through its reply handle.
pub trait DbusAgent: Send + Sync + 'static {
	fn new_connection(&self, address: &str) -> Result<u32, AgentError>;
	fn close_connection(&self, conn: u32) -> Result<(), AgentError>;
	fn own_name(&self, conn: u32, name: &str, flags: u32, watch: NameWatch)
	-> Result<u32, AgentError>;
	fn unown_name(&self, conn: u32, owning_id: u32) -> Result<(), AgentError>;
	fn register_object(&self, conn: u32, path: &str, iface_xml: &str) -> Result<u32, AgentError>;
	fn unregister_object(&self, registration: u32) -> Result<(), AgentError>;
	fn new_proxy(
		&self,
		conn: u32,
		name: &str,
		path: &str,
		iface: &str,
		flags: u32,
	) -> Result<u32, AgentError>;
	fn close_proxy(&self, proxy: u32) -> Result<(), AgentError>;
	fn call_method(
		&self,
		proxy: u32,
		method: &str,
		json_args: &str,
		signature: &str,
		flags: u32,
		timeout_ms: i32,
		reply: MethodReply,
	);
	fn emit_signal(
		&self,
		registration: u32,
		name: &str,
		json_args: &str,
		signature: &str,
	) -> Result<(), AgentError>;
}

/// Thin dispatcher between line-framed bridge messages and a [`DbusAgent`].
pub struct Bridge {
	agent: Arc<dyn DbusAgent>,
}

impl Bridge {
	pub fn new(agent: Arc<dyn DbusAgent>) -> Arc<Bridge> {
		Arc::new(Bridge { agent })
	}

	/// Route a transport's receive signal into this bridge.
	pub fn attach(self: &Arc<Self>, transport: &Arc<dyn Transport>) {
		let bridge = Arc::downgrade(self);
		transport.events().on_receive(move |peer| {
			let Some(bridge) = Weak::upgrade(&bridge) else {
				return;
			};
			let Some(frame) = peer.receive_bytes() else {
				return;
			};
			bridge.handle(peer, &frame);
		});
	}

	/// Process one message and send whatever replies it produces.
	pub fn handle(&self, peer: &Peer, frame: &[u8]) {
		let (cmd_byte, serial, subject, args) =
			match serde_json::from_slice::<(u8, u64, u32, String)>(frame) {
				Ok(msg) => msg,
				Err(e) => {
					debug!("unparseable bridge message: {e}");
					send_error(peer, 0, 0, &AgentError::code(ErrorCode::InvalidMsg));
					return;
				},
			};
		let Some(cmd) = Cmd::from_u8(cmd_byte) else {
			send_error(peer, serial, subject, &AgentError::code(ErrorCode::UnknownCommand));
			return;
		};
		trace!(?cmd, serial, subject, "bridge command");
		if let Err(e) = self.dispatch(peer, cmd, serial, subject, &args) {
			send_error(peer, serial, subject, &e);
		}
	}

	fn dispatch(
		&self,
		peer: &Peer,
		cmd: Cmd,
		serial: u64,
		subject: u32,
		args: &str,
	) -> Result<(), AgentError> {
		match cmd {
			Cmd::NewConnection => {
				let (address,): (String,) = parse_args(args)?;
				let conn = self.agent.new_connection(&address)?;
				reply_payload(peer, serial, subject, &conn.to_string());
			},
			Cmd::CloseConnection => {
				let _: [Value; 0] = parse_args(args)?;
				self.agent.close_connection(subject)?;
				reply_payload(peer, serial, subject, "");
			},
			Cmd::OwnName => {
				let (name, flags): (String, u32) = parse_args(args)?;
				let watch = NameWatch {
					peer: peer.clone(),
					serial,
					subject,
				};
				let owning_id = self.agent.own_name(subject, &name, flags, watch)?;
				reply_payload(peer, serial, subject, &owning_id.to_string());
			},
			Cmd::UnownName => {
				let (owning_id,): (u32,) = parse_args(args)?;
				self.agent.unown_name(subject, owning_id)?;
				reply_payload(peer, serial, subject, "");
			},
			Cmd::RegisterObject => {
				let (path, iface_xml): (String, String) = parse_args(args)?;
				let registration = self.agent.register_object(subject, &path, &iface_xml)?;
				reply_payload(peer, serial, subject, &registration.to_string());
			},
			Cmd::UnregisterObject => {
				let _: [Value; 0] = parse_args(args)?;
				self.agent.unregister_object(subject)?;
				reply_payload(peer, serial, subject, "");
			},
			Cmd::NewProxy => {
				let (name, path, iface, flags): (String, String, String, u32) = parse_args(args)?;
				let proxy = self.agent.new_proxy(subject, &name, &path, &iface, flags)?;
				reply_payload(peer, serial, subject, &proxy.to_string());
			},
			Cmd::CloseProxy => {
				let _: [Value; 0] = parse_args(args)?;
				self.agent.close_proxy(subject)?;
				reply_payload(peer, serial, subject, "");
			},
			Cmd::CallMethod => {
				let (method, json_args, signature, flags, timeout_ms): (String, String, String, u32, i32) =
					parse_args(args)?;
				let reply = MethodReply {
					peer: peer.clone(),
					serial,
					subject,
				};
				self
					.agent
					.call_method(subject, &method, &json_args, &signature, flags, timeout_ms, reply);
			},
			Cmd::EmitSignal => {
				let (name, json_args, signature): (String, String, String) = parse_args(args)?;
				self
					.agent
					.emit_signal(subject, &name, &json_args, &signature)?;
				reply_payload(peer, serial, subject, "");
			},
			// Reply-direction commands are never valid from a client.
			Cmd::Error | Cmd::Reply | Cmd::NameAcquired | Cmd::NameLost | Cmd::CallMethodReturn => {
				return Err(AgentError::code(ErrorCode::UnknownCommand));
			},
		}
		Ok(())
	}
}

/// Parse the JSON-encoded args tuple for a command. Any mismatch in arity
/// or type is `INVALID_ARGS`.
fn parse_args<'a, T: serde::Deserialize<'a>>(args: &'a str) -> Result<T, AgentError> {
	serde_json::from_str(args).map_err(|_| AgentError::code(ErrorCode::InvalidArgs))
}

fn args_tuple(values: &[Value]) -> String {
	serde_json::to_string(&values).unwrap_or_else(|_| "[]".into())
}

fn send_msg(peer: &Peer, cmd: Cmd, serial: u64, subject: u32, args: &str) {
	let frame = match serde_json::to_vec(&(cmd as u8, serial, subject, args)) {
		Ok(f) => f,
		Err(e) => {
			debug!("bridge reply encoding failed: {e}");
			return;
		},
	};
	if let Err(e) = peer.send(Bytes::from(frame)) {
		debug!(peer = %peer.id(), "bridge reply dropped: {e}");
	}
}

fn reply_payload(peer: &Peer, serial: u64, subject: u32, payload: &str) {
	send_msg(
		peer,
		Cmd::Reply,
		serial,
		subject,
		&args_tuple(&[Value::from(payload)]),
	);
}

fn send_error(peer: &Peer, serial: u64, subject: u32, error: &AgentError) {
	let mut tuple = vec![Value::from(error.code as i32)];
	if let Some(msg) = &error.msg {
		tuple.push(Value::from(msg.as_str()));
	}
	send_msg(peer, Cmd::Error, serial, subject, &args_tuple(&tuple));
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;
	use std::sync::mpsc;
	use std::time::Duration;

	use parking_lot::Mutex;
	use strand::peer::PeerManager;
	use strand::transport::pair;
	use strand_core::sched::Scheduler;

	use super::*;

	/// Agent that resolves everything locally, for dispatcher tests.
	#[derive(Default)]
	struct LoopbackAgent {
		connections: Mutex<HashMap<u32, String>>,
		next: Mutex<u32>,
	}

	impl LoopbackAgent {
		fn next_id(&self) -> u32 {
			let mut n = self.next.lock();
			*n += 1;
			*n
		}
	}

	impl DbusAgent for LoopbackAgent {
		fn new_connection(&self, address: &str) -> Result<u32, AgentError> {
			if address.is_empty() {
				return Err(AgentError::new(ErrorCode::ConnectionFailed, "empty address"));
			}
			let id = self.next_id();
			self.connections.lock().insert(id, address.to_string());
			Ok(id)
		}

		fn close_connection(&self, conn: u32) -> Result<(), AgentError> {
			self
				.connections
				.lock()
				.remove(&conn)
				.map(|_| ())
				.ok_or(AgentError::code(ErrorCode::InvalidSubject))
		}

		fn own_name(
			&self,
			_conn: u32,
			_name: &str,
			_flags: u32,
			watch: NameWatch,
		) -> Result<u32, AgentError> {
			let id = self.next_id();
			watch.acquired(id);
			Ok(id)
		}

		fn unown_name(&self, _conn: u32, _owning_id: u32) -> Result<(), AgentError> {
			Ok(())
		}

		fn register_object(&self, _conn: u32, _path: &str, _xml: &str) -> Result<u32, AgentError> {
			Ok(self.next_id())
		}

		fn unregister_object(&self, _registration: u32) -> Result<(), AgentError> {
			Ok(())
		}

		fn new_proxy(
			&self,
			_conn: u32,
			_name: &str,
			_path: &str,
			_iface: &str,
			_flags: u32,
		) -> Result<u32, AgentError> {
			Ok(self.next_id())
		}

		fn close_proxy(&self, _proxy: u32) -> Result<(), AgentError> {
			Ok(())
		}

		fn call_method(
			&self,
			_proxy: u32,
			method: &str,
			json_args: &str,
			signature: &str,
			_flags: u32,
			_timeout_ms: i32,
			reply: MethodReply,
		) {
			if method == "Echo" {
				reply.resolve(json_args, signature);
			} else {
				reply.fail(AgentError::code(ErrorCode::UnknownMethod));
			}
		}

		fn emit_signal(
			&self,
			_registration: u32,
			_name: &str,
			_json_args: &str,
			_signature: &str,
		) -> Result<(), AgentError> {
			Ok(())
		}
	}

	/// Run a bridge on one end of a pair transport, returning frames the
	/// client side receives for the given request.
	fn exchange(requests: &[&str]) -> Vec<(u8, u64, u32, String)> {
		let (sched, join) = Scheduler::spawn();
		let mgr = PeerManager::new(Duration::from_secs(60), Duration::from_secs(3600));
		let (client, server) = pair(&sched, &mgr);

		let bridge = Bridge::new(Arc::new(LoopbackAgent::default()));
		let dyn_server: Arc<dyn Transport> = server.clone();
		bridge.attach(&dyn_server);

		let (tx, rx) = mpsc::channel();
		client.events().on_receive(move |peer| {
			if let Some(frame) = peer.receive_bytes() {
				let parsed: (u8, u64, u32, String) = serde_json::from_slice(&frame).unwrap();
				tx.send(parsed).unwrap();
			}
		});

		for req in requests {
			client.peer().send(Bytes::from(req.as_bytes().to_vec())).unwrap();
		}

		let mut got = Vec::new();
		while let Ok(frame) = rx.recv_timeout(Duration::from_millis(500)) {
			got.push(frame);
		}
		sched.shutdown();
		join.join().unwrap();
		got
	}

	#[test]
	fn new_connection_with_wrong_args_is_invalid_args() {
		let got = exchange(&[r#"[3, 7, 0, "[]"]"#]);
		assert_eq!(got.len(), 1);
		let (cmd, serial, _subject, args) = &got[0];
		assert_eq!(*cmd, Cmd::Error as u8);
		assert_eq!(*serial, 7);
		let tuple: Vec<Value> = serde_json::from_str(args).unwrap();
		assert_eq!(tuple[0], Value::from(ErrorCode::InvalidArgs as i32));
	}

	#[test]
	fn unknown_command_is_rejected() {
		let got = exchange(&[r#"[99, 1, 0, "[]"]"#]);
		assert_eq!(got.len(), 1);
		let (cmd, serial, _, args) = &got[0];
		assert_eq!(*cmd, Cmd::Error as u8);
		assert_eq!(*serial, 1);
		let tuple: Vec<Value> = serde_json::from_str(args).unwrap();
		assert_eq!(tuple[0], Value::from(ErrorCode::UnknownCommand as i32));
	}

	#[test]
	fn unparseable_message_is_invalid_msg() {
		let got = exchange(&["not json"]);
		assert_eq!(got.len(), 1);
		let (cmd, serial, _, args) = &got[0];
		assert_eq!(*cmd, Cmd::Error as u8);
		assert_eq!(*serial, 0);
		let tuple: Vec<Value> = serde_json::from_str(args).unwrap();
		assert_eq!(tuple[0], Value::from(ErrorCode::InvalidMsg as i32));
	}

	#[test]
	fn new_connection_then_call_method() {
		let got = exchange(&[
			r#"[3, 1, 0, "[\"unix:/run/bus\"]"]"#,
			r#"[13, 2, 1, "[\"Echo\", \"[42]\", \"i\", 0, -1]"]"#,
		]);
		assert_eq!(got.len(), 2);

		let (cmd, serial, _, args) = &got[0];
		assert_eq!(*cmd, Cmd::Reply as u8);
		assert_eq!(*serial, 1);
		let tuple: Vec<Value> = serde_json::from_str(args).unwrap();
		assert_eq!(tuple[0], Value::from("1"));

		let (cmd, serial, subject, args) = &got[1];
		assert_eq!(*cmd, Cmd::CallMethodReturn as u8);
		assert_eq!(*serial, 2);
		assert_eq!(*subject, 1);
		let tuple: Vec<Value> = serde_json::from_str(args).unwrap();
		assert_eq!(tuple[0], Value::from("[42]"));
		assert_eq!(tuple[1], Value::from("i"));
	}

	#[test]
	fn own_name_acknowledges_and_notifies() {
		let got = exchange(&[r#"[5, 9, 1, "[\"org.example.Name\", 0]"]"#]);
		// NAME_ACQUIRED (pushed during own_name) and the REPLY, both with
		// the request serial.
		assert_eq!(got.len(), 2);
		assert!(got.iter().all(|(_, serial, _, _)| *serial == 9));
		let cmds: Vec<u8> = got.iter().map(|(c, _, _, _)| *c).collect();
		assert!(cmds.contains(&(Cmd::Reply as u8)));
		assert!(cmds.contains(&(Cmd::NameAcquired as u8)));
	}

	#[test]
	fn close_connection_of_unknown_subject_is_invalid_subject() {
		let got = exchange(&[r#"[4, 3, 42, "[]"]"#]);
		assert_eq!(got.len(), 1);
		let (cmd, _, _, args) = &got[0];
		assert_eq!(*cmd, Cmd::Error as u8);
		let tuple: Vec<Value> = serde_json::from_str(args).unwrap();
		assert_eq!(tuple[0], Value::from(ErrorCode::InvalidSubject as i32));
	}
}

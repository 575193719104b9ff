mod raw;

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
pub use raw::{RawStream, would_block};
use strand_core::throttle::Throttle;
use tracing::trace;

use crate::tls::{Handshake, TlsError, TlsSession};

/// Result of driving the read side of a pipeline.
#[derive(Debug)]
pub enum ReadOutcome {
	/// Bytes delivered. `drained` is the one-shot transition of the buffered
	/// layer from holding replay bytes to empty.
	Data { n: usize, drained: bool },
	/// The OS has nothing; clear `cond` readable and rearm.
	WouldBlock,
	/// A throttle denied the operation; retry after the hint.
	Throttled(Duration),
	/// Clean end of stream.
	Eof,
}

/// State of the buffered output after a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
	/// Everything buffered reached the OS.
	Idle,
	/// The OS would block; rearm writable.
	Blocked,
	/// A throttle denied the flush; retry after the hint.
	Throttled(Duration),
}

#[derive(Debug)]
pub struct WriteResult {
	/// Bytes accepted into the pipeline (possibly buffered, not yet sent).
	pub accepted: usize,
	/// One-shot: this write filled the output buffer.
	pub filled: bool,
	pub flush: FlushState,
}

/// The fixed stream stack over one socket:
/// raw ↔ throttled ↔ (optional) TLS ↔ buffered.
///
/// The pipeline holds no I/O handle; the socket lends it the raw stream per
/// operation, which keeps registration (needing `&mut Source`) and I/O in
/// one place.
pub struct Pipeline {
	tls: Option<TlsSession>,
	throttles_in: Vec<Arc<Throttle>>,
	throttles_out: Vec<Arc<Throttle>>,
	/// Replay buffer for unread(); served before any real I/O.
	unread: BytesMut,
	/// Plaintext accepted but not yet handed to the OS (or to TLS).
	out_plain: BytesMut,
	out_cap: usize,
}

impl Pipeline {
	pub fn new(
		throttles_in: Vec<Arc<Throttle>>,
		throttles_out: Vec<Arc<Throttle>>,
		out_cap: usize,
	) -> Pipeline {
		Pipeline {
			tls: None,
			throttles_in,
			throttles_out,
			unread: BytesMut::new(),
			out_plain: BytesMut::new(),
			out_cap,
		}
	}

	pub fn tls(&self) -> Option<&TlsSession> {
		self.tls.as_ref()
	}

	pub fn tls_mut(&mut self) -> Option<&mut TlsSession> {
		self.tls.as_mut()
	}

	pub fn has_tls(&self) -> bool {
		self.tls.is_some()
	}

	pub fn install_tls(&mut self, session: TlsSession) {
		self.tls = Some(session);
	}

	/// Bytes the application could read without touching the OS.
	pub fn has_buffered_input(&self) -> bool {
		!self.unread.is_empty()
			|| self
				.tls
				.as_ref()
				.is_some_and(|t| t.has_pending_plaintext())
	}

	/// Bytes still owed to the wire.
	pub fn has_pending_output(&self) -> bool {
		!self.out_plain.is_empty() || self.tls.as_ref().is_some_and(|t| t.wants_write())
	}

	/// Push bytes back so the next read returns them first.
	pub fn unread(&mut self, bytes: &[u8]) {
		if bytes.is_empty() {
			return;
		}
		if self.unread.is_empty() {
			self.unread.extend_from_slice(bytes);
			return;
		}
		let mut replay = BytesMut::with_capacity(bytes.len() + self.unread.len());
		replay.extend_from_slice(bytes);
		replay.extend_from_slice(&self.unread);
		self.unread = replay;
	}

	pub fn read(&mut self, raw: &mut RawStream, buf: &mut [u8]) -> ReadOutcome {
		if buf.is_empty() {
			return ReadOutcome::Data {
				n: 0,
				drained: false,
			};
		}
		// Replayed bytes were throttled when they first moved; serve them
		// without charging the bucket twice.
		if !self.unread.is_empty() {
			let n = self.unread.len().min(buf.len());
			buf[..n].copy_from_slice(&self.unread[..n]);
			let _ = self.unread.split_to(n);
			let drained = self.unread.is_empty();
			return ReadOutcome::Data { n, drained };
		}

		match &mut self.tls {
			Some(tls) => {
				let mut io = ThrottledIo::new(raw, &self.throttles_in, &self.throttles_out);
				match tls.read(&mut io, buf) {
					Ok(0) => ReadOutcome::Eof,
					Ok(n) => ReadOutcome::Data { n, drained: false },
					Err(e) if would_block(&e) => match io.read_wait.take() {
						Some(wait) => ReadOutcome::Throttled(wait),
						None => ReadOutcome::WouldBlock,
					},
					Err(e) => {
						trace!("tls read error treated as eof: {e}");
						ReadOutcome::Eof
					},
				}
			},
			None => {
				let decision = Throttle::request_stack(&self.throttles_in, buf.len());
				if decision.allowed == 0 {
					return ReadOutcome::Throttled(
						decision.wait.unwrap_or(Duration::from_millis(1)),
					);
				}
				match raw.read(&mut buf[..decision.allowed]) {
					Ok(0) => ReadOutcome::Eof,
					Ok(n) => {
						Throttle::report_stack(&self.throttles_in, n);
						ReadOutcome::Data { n, drained: false }
					},
					Err(e) if would_block(&e) => ReadOutcome::WouldBlock,
					Err(e) => {
						trace!("read error treated as eof: {e}");
						ReadOutcome::Eof
					},
				}
			},
		}
	}

	pub fn write(&mut self, raw: &mut RawStream, buf: &[u8]) -> WriteResult {
		let room = self.out_cap.saturating_sub(self.out_plain.len());
		let accepted = room.min(buf.len());
		let was_full = room == 0;
		self.out_plain.extend_from_slice(&buf[..accepted]);
		let filled = !was_full && self.out_plain.len() >= self.out_cap;
		let flush = self.flush(raw);
		WriteResult {
			accepted,
			filled,
			flush,
		}
	}

	/// Move buffered output toward the wire as far as throttles and the OS
	/// allow.
	pub fn flush(&mut self, raw: &mut RawStream) -> FlushState {
		match &mut self.tls {
			Some(tls) => loop {
				// Drain TLS's pending ciphertext before feeding it more.
				if tls.wants_write() {
					let mut io = ThrottledIo::new(raw, &self.throttles_in, &self.throttles_out);
					match tls.write_out(&mut io) {
						Ok(_) => {},
						Err(e) if would_block(&e) => {
							return match io.write_wait.take() {
								Some(wait) => FlushState::Throttled(wait),
								None => FlushState::Blocked,
							};
						},
						Err(e) => {
							trace!("tls flush error: {e}");
							return FlushState::Blocked;
						},
					}
					continue;
				}
				if self.out_plain.is_empty() {
					return FlushState::Idle;
				}
				match tls.write_plaintext(&self.out_plain) {
					Ok(0) => {
						if !tls.wants_write() {
							// No room and nothing to drain: session is wedged
							// (mid-handshake write); wait for writability.
							return FlushState::Blocked;
						}
						continue;
					},
					Ok(n) => {
						let _ = self.out_plain.split_to(n);
					},
					Err(e) => {
						trace!("tls write error: {e}");
						return FlushState::Blocked;
					},
				}
			},
			None => {
				while !self.out_plain.is_empty() {
					let decision = Throttle::request_stack(&self.throttles_out, self.out_plain.len());
					if decision.allowed == 0 {
						return FlushState::Throttled(
							decision.wait.unwrap_or(Duration::from_millis(1)),
						);
					}
					match raw.write(&self.out_plain[..decision.allowed]) {
						Ok(0) => return FlushState::Blocked,
						Ok(n) => {
							Throttle::report_stack(&self.throttles_out, n);
							let _ = self.out_plain.split_to(n);
						},
						Err(e) if would_block(&e) => return FlushState::Blocked,
						Err(e) => {
							trace!("flush error: {e}");
							return FlushState::Blocked;
						},
					}
				}
				FlushState::Idle
			},
		}
	}

	/// Drive the TLS handshake through the throttled layer.
	pub fn handshake(&mut self, raw: &mut RawStream) -> Result<HandshakeOutcome, TlsError> {
		let tls = self
			.tls
			.as_mut()
			.expect("handshake without a TLS session");
		let mut io = ThrottledIo::new(raw, &self.throttles_in, &self.throttles_out);
		let progress = tls.handshake(&mut io)?;
		Ok(match progress {
			Handshake::Done => HandshakeOutcome::Done,
			Handshake::WantRead => match io.read_wait.take() {
				Some(wait) => HandshakeOutcome::Throttled(wait),
				None => HandshakeOutcome::WantRead,
			},
			Handshake::WantWrite => match io.write_wait.take() {
				Some(wait) => HandshakeOutcome::Throttled(wait),
				None => HandshakeOutcome::WantWrite,
			},
		})
	}
}

/// Handshake progress seen through the throttled layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
	Done,
	WantRead,
	WantWrite,
	Throttled(Duration),
}

/// io::Read/Write adapter that charges the throttle stacks and reports the
/// bytes that actually moved. A throttle denial surfaces as WouldBlock with
/// the retry hint stored alongside.
struct ThrottledIo<'a> {
	raw: &'a mut RawStream,
	throttles_in: &'a [Arc<Throttle>],
	throttles_out: &'a [Arc<Throttle>],
	read_wait: Option<Duration>,
	write_wait: Option<Duration>,
}

impl<'a> ThrottledIo<'a> {
	fn new(
		raw: &'a mut RawStream,
		throttles_in: &'a [Arc<Throttle>],
		throttles_out: &'a [Arc<Throttle>],
	) -> ThrottledIo<'a> {
		ThrottledIo {
			raw,
			throttles_in,
			throttles_out,
			read_wait: None,
			write_wait: None,
		}
	}
}

impl Read for ThrottledIo<'_> {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		if buf.is_empty() {
			return Ok(0);
		}
		let decision = Throttle::request_stack(self.throttles_in, buf.len());
		if decision.allowed == 0 {
			self.read_wait = Some(decision.wait.unwrap_or(Duration::from_millis(1)));
			return Err(io::ErrorKind::WouldBlock.into());
		}
		let n = self.raw.read(&mut buf[..decision.allowed])?;
		Throttle::report_stack(self.throttles_in, n);
		Ok(n)
	}
}

impl Write for ThrottledIo<'_> {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		if buf.is_empty() {
			return Ok(0);
		}
		let decision = Throttle::request_stack(self.throttles_out, buf.len());
		if decision.allowed == 0 {
			self.write_wait = Some(decision.wait.unwrap_or(Duration::from_millis(1)));
			return Err(io::ErrorKind::WouldBlock.into());
		}
		let n = self.raw.write(&buf[..decision.allowed])?;
		Throttle::report_stack(self.throttles_out, n);
		Ok(n)
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

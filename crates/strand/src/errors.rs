use crate::tls::CertStatus;

/// Closed error taxonomy for every public operation.
///
/// `WouldBlock` never escapes this crate; an operation that cannot progress
/// rearms readiness and reports zero progress instead.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("invalid address: {0}")]
	InvalidAddress(String),
	#[error("socket is not connected")]
	NotConnected,
	#[error("operation already active")]
	AlreadyActive,
	#[error("address resolution failed: {0}")]
	ResolveFailure(String),
	#[error("connection refused")]
	ConnectRefused,
	#[error("connect timed out")]
	ConnectTimeout,
	#[error("accept failed: {0}")]
	AcceptFailed(std::io::Error),
	#[error("socket is not readable")]
	NotReadable,
	#[error("socket is not writable")]
	NotWritable,
	#[error("tls handshake failed: {0}")]
	TlsHandshake(#[from] crate::tls::TlsError),
	#[error("peer certificate rejected: {0:?}")]
	TlsPeerInvalid(CertStatus),
	#[error("protocol violation: {0}")]
	ProtocolViolation(String),
	#[error("operation cancelled")]
	Cancelled,
	#[error("closed")]
	Closed,
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),
}

impl Error {
	/// True for errors that end the socket lifecycle rather than one operation.
	pub fn is_fatal(&self) -> bool {
		matches!(
			self,
			Error::ConnectRefused
				| Error::ConnectTimeout
				| Error::TlsHandshake(_)
				| Error::TlsPeerInvalid(_)
				| Error::Closed
				| Error::Io(_)
		)
	}
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

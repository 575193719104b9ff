use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::Once;
use std::time::{SystemTime, UNIX_EPOCH};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};
use tracing::{debug, trace, warn};

/// Install the process-wide crypto provider. One-time latch; later calls are
/// no-ops. Called implicitly by every session constructor.
pub fn init() {
	static ONCE: Once = Once::new();
	ONCE.call_once(|| {
		if rustls::crypto::aws_lc_rs::default_provider()
			.install_default()
			.is_err()
		{
			// Another component of the process installed a provider first;
			// sessions will use that one.
			debug!("crypto provider already installed");
		}
	});
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
	Client,
	Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
	NotStarted,
	InProgress,
	Done,
	Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
	Done,
	WantRead,
	WantWrite,
}

#[derive(thiserror::Error, Debug)]
pub enum TlsError {
	#[error("invalid credentials: {0}")]
	Credentials(String),
	#[error("handshake failed: {0}")]
	Handshake(rustls::Error),
	#[error("peer certificate rejected: {0:?}")]
	Peer(CertStatus),
	#[error("i/o during handshake: {0}")]
	Io(io::Error),
}

/// Peer certificate verification status bitmask. An empty mask means OK.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CertStatus(u32);

impl CertStatus {
	pub const OK: CertStatus = CertStatus(0);
	pub const NO_CERT: CertStatus = CertStatus(1);
	pub const INVALID: CertStatus = CertStatus(1 << 1);
	pub const REVOKED: CertStatus = CertStatus(1 << 2);
	pub const SIGNER_NOT_FOUND: CertStatus = CertStatus(1 << 3);
	pub const SIGNER_NOT_CA: CertStatus = CertStatus(1 << 4);
	pub const INSECURE_ALG: CertStatus = CertStatus(1 << 5);
	pub const EXPIRED: CertStatus = CertStatus(1 << 6);
	pub const NOT_YET_ACTIVATED: CertStatus = CertStatus(1 << 7);

	pub fn is_ok(self) -> bool {
		self.0 == 0
	}

	pub fn contains(self, other: CertStatus) -> bool {
		self.0 & other.0 == other.0
	}

	pub fn with(self, other: CertStatus) -> CertStatus {
		CertStatus(self.0 | other.0)
	}
}

impl std::fmt::Debug for CertStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		if self.is_ok() {
			return f.write_str("OK");
		}
		let names = [
			(CertStatus::NO_CERT, "NO_CERT"),
			(CertStatus::INVALID, "INVALID"),
			(CertStatus::REVOKED, "REVOKED"),
			(CertStatus::SIGNER_NOT_FOUND, "SIGNER_NOT_FOUND"),
			(CertStatus::SIGNER_NOT_CA, "SIGNER_NOT_CA"),
			(CertStatus::INSECURE_ALG, "INSECURE_ALG"),
			(CertStatus::EXPIRED, "EXPIRED"),
			(CertStatus::NOT_YET_ACTIVATED, "NOT_YET_ACTIVATED"),
		];
		let mut first = true;
		for (bit, name) in names {
			if self.contains(bit) {
				if !first {
					f.write_str("|")?;
				}
				f.write_str(name)?;
				first = false;
			}
		}
		Ok(())
	}
}

/// An opaque credential blob: leaf chain, private key, and trust anchors.
/// The priority string is carried verbatim; `"NORMAL"` (the default) and any
/// unrecognized value select the provider's default suites.
pub struct Credentials {
	certs: Vec<CertificateDer<'static>>,
	key: Option<PrivateKeyDer<'static>>,
	ca: Vec<CertificateDer<'static>>,
	priority: String,
}

impl Credentials {
	pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Credentials, TlsError> {
		let certs = rustls_pemfile::certs(&mut &cert_pem[..])
			.collect::<Result<Vec<_>, _>>()
			.map_err(|e| TlsError::Credentials(format!("bad certificate pem: {e}")))?;
		if certs.is_empty() {
			return Err(TlsError::Credentials("no certificates in pem".into()));
		}
		let key = rustls_pemfile::private_key(&mut &key_pem[..])
			.map_err(|e| TlsError::Credentials(format!("bad key pem: {e}")))?
			.ok_or_else(|| TlsError::Credentials("no private key in pem".into()))?;
		Ok(Credentials {
			certs,
			key: Some(key),
			ca: Vec::new(),
			priority: "NORMAL".into(),
		})
	}

	/// A throwaway identity. TLS without configured credentials still needs a
	/// certificate on the wire; an ephemeral self-signed one preserves the
	/// anonymous-credentials behavior (peers that don't require a verified
	/// cert accept it).
	pub fn anonymous() -> Result<Credentials, TlsError> {
		let rcgen::CertifiedKey { cert, key_pair } =
			rcgen::generate_simple_self_signed(vec!["strand.invalid".to_string()])
				.map_err(|e| TlsError::Credentials(format!("keygen failed: {e}")))?;
		let key = PrivateKeyDer::Pkcs8(key_pair.serialize_der().into());
		Ok(Credentials {
			certs: vec![cert.der().clone()],
			key: Some(key),
			ca: Vec::new(),
			priority: "NORMAL".into(),
		})
	}

	pub fn add_ca_pem(&mut self, ca_pem: &[u8]) -> Result<(), TlsError> {
		let mut added = rustls_pemfile::certs(&mut &ca_pem[..])
			.collect::<Result<Vec<_>, _>>()
			.map_err(|e| TlsError::Credentials(format!("bad ca pem: {e}")))?;
		self.ca.append(&mut added);
		Ok(())
	}

	pub fn set_priority(&mut self, priority: impl Into<String>) {
		self.priority = priority.into();
	}

	pub fn priority(&self) -> &str {
		&self.priority
	}

	fn root_store(&self) -> Result<RootCertStore, TlsError> {
		let mut roots = RootCertStore::empty();
		for ca in &self.ca {
			roots
				.add(ca.clone())
				.map_err(|e| TlsError::Credentials(format!("bad trust anchor: {e}")))?;
		}
		Ok(roots)
	}
}

/// Everything a socket needs to start TLS in one direction.
pub struct TlsParams {
	pub mode: TlsMode,
	pub credentials: Arc<Credentials>,
	/// Require and verify the peer's certificate against the credential's
	/// trust anchors.
	pub peer_required: bool,
	/// SNI / verification name for client mode. Falls back to the host the
	/// socket connected to.
	pub server_name: Option<String>,
}

/// A pull/push TLS state machine over the throttled layer. The caller drives
/// `handshake` until `Done`, rearming readiness in whichever direction the
/// session reports.
pub struct TlsSession {
	conn: Connection,
	state: HandshakeState,
	peer_required: bool,
	/// Decrypted bytes buffered inside rustls, tracked so the socket can
	/// defer a close while the application still has input to drain.
	pending_plaintext: usize,
}

impl TlsSession {
	pub fn new(params: &TlsParams, fallback_name: Option<&str>) -> Result<TlsSession, TlsError> {
		init();
		match params.mode {
			TlsMode::Client => Self::client(params, fallback_name),
			TlsMode::Server => Self::server(params),
		}
	}

	fn client(params: &TlsParams, fallback_name: Option<&str>) -> Result<TlsSession, TlsError> {
		let creds = &params.credentials;
		let builder = ClientConfig::builder();
		let builder = if params.peer_required {
			builder.with_root_certificates(creds.root_store()?)
		} else {
			// No verification requested: accept whatever the peer presents.
			// verify_peer() can still interrogate the certificate afterwards.
			builder
				.dangerous()
				.with_custom_certificate_verifier(Arc::new(danger::NoVerifier))
		};
		let config = match (&creds.certs[..], &creds.key) {
			(certs, Some(key)) if !certs.is_empty() => builder
				.with_client_auth_cert(certs.to_vec(), key.clone_key())
				.map_err(|e| TlsError::Credentials(e.to_string()))?,
			_ => builder.with_no_client_auth(),
		};
		let name = params
			.server_name
			.as_deref()
			.or(fallback_name)
			.unwrap_or("localhost");
		let server_name = ServerName::try_from(name.to_string())
			.map_err(|e| TlsError::Credentials(format!("bad server name {name:?}: {e}")))?;
		let conn = ClientConnection::new(Arc::new(config), server_name)
			.map_err(TlsError::Handshake)?;
		Ok(TlsSession {
			conn: Connection::Client(conn),
			state: HandshakeState::NotStarted,
			peer_required: params.peer_required,
			pending_plaintext: 0,
		})
	}

	fn server(params: &TlsParams) -> Result<TlsSession, TlsError> {
		let creds = &params.credentials;
		let builder = ServerConfig::builder();
		let builder = if params.peer_required {
			let roots = creds.root_store()?;
			let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
				.build()
				.map_err(|e| TlsError::Credentials(e.to_string()))?;
			builder.with_client_cert_verifier(verifier)
		} else {
			builder.with_no_client_auth()
		};
		let key = creds
			.key
			.as_ref()
			.ok_or_else(|| TlsError::Credentials("server mode needs a private key".into()))?;
		let config = builder
			.with_single_cert(creds.certs.clone(), key.clone_key())
			.map_err(|e| TlsError::Credentials(e.to_string()))?;
		let conn = ServerConnection::new(Arc::new(config)).map_err(TlsError::Handshake)?;
		Ok(TlsSession {
			conn: Connection::Server(conn),
			state: HandshakeState::NotStarted,
			peer_required: params.peer_required,
			pending_plaintext: 0,
		})
	}

	pub fn state(&self) -> HandshakeState {
		self.state
	}

	pub fn wants_write(&self) -> bool {
		self.conn.wants_write()
	}

	pub fn has_pending_plaintext(&self) -> bool {
		self.pending_plaintext > 0
	}

	/// Advance the handshake as far as the transport allows.
	pub fn handshake<IO: Read + Write>(&mut self, io: &mut IO) -> Result<Handshake, TlsError> {
		if self.state == HandshakeState::NotStarted {
			self.state = HandshakeState::InProgress;
		}
		loop {
			while self.conn.wants_write() {
				match self.conn.write_tls(io) {
					Ok(_) => {},
					Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
						return Ok(Handshake::WantWrite);
					},
					Err(e) => return Err(TlsError::Io(e)),
				}
			}
			if !self.conn.is_handshaking() {
				self.state = HandshakeState::Done;
				if self.peer_required {
					let status = self.verify_peer();
					if !status.is_ok() {
						return Err(TlsError::Peer(status));
					}
				}
				trace!("handshake complete");
				return Ok(Handshake::Done);
			}
			if self.conn.wants_read() {
				match self.conn.read_tls(io) {
					Ok(0) => {
						return Err(TlsError::Io(io::ErrorKind::UnexpectedEof.into()));
					},
					Ok(_) => {
						let io_state = self.conn.process_new_packets().map_err(|e| {
							let status = cert_status_of(&e);
							if status.is_ok() {
								TlsError::Handshake(e)
							} else {
								TlsError::Peer(status)
							}
						})?;
						self.pending_plaintext = io_state.plaintext_bytes_to_read();
					},
					Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
						return Ok(Handshake::WantRead);
					},
					Err(e) => return Err(TlsError::Io(e)),
				}
			}
		}
	}

	/// Read decrypted bytes, pulling ciphertext through `io` as needed.
	/// Returns Ok(0) on end of stream.
	pub fn read<IO: Read + Write>(&mut self, io: &mut IO, buf: &mut [u8]) -> io::Result<usize> {
		loop {
			match self.conn.reader().read(buf) {
				Ok(n) => {
					self.pending_plaintext = self.pending_plaintext.saturating_sub(n);
					return Ok(n);
				},
				Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
					match self.conn.read_tls(io) {
						Ok(0) => return Ok(0),
						Ok(_) => {
							let io_state = self
								.conn
								.process_new_packets()
								.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
							self.pending_plaintext = io_state.plaintext_bytes_to_read();
						},
						Err(e) => return Err(e),
					}
				},
				Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
					// Peer closed without close_notify. Surface as EOF; the
					// bytes received so far were authenticated.
					warn!("peer closed tls without close_notify");
					return Ok(0);
				},
				Err(e) => return Err(e),
			}
		}
	}

	/// Queue plaintext for encryption. Returns the bytes accepted; zero means
	/// the session's outgoing buffer is full and must be drained first.
	pub fn write_plaintext(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.conn.writer().write(buf)
	}

	/// Push pending ciphertext into `io`.
	pub fn write_out<IO: Write>(&mut self, io: &mut IO) -> io::Result<usize> {
		self.conn.write_tls(io)
	}

	/// Queue a close_notify covering both directions.
	pub fn close(&mut self) {
		if self.state != HandshakeState::Closed {
			self.conn.send_close_notify();
			self.state = HandshakeState::Closed;
		}
	}

	/// Queue a write-direction close; reads stay valid.
	pub fn shutdown_write(&mut self) {
		if self.state == HandshakeState::Done {
			self.conn.send_close_notify();
		}
	}

	/// Inspect the peer's certificate after the handshake.
	pub fn verify_peer(&self) -> CertStatus {
		let Some(certs) = self.conn.peer_certificates() else {
			return CertStatus::NO_CERT;
		};
		let Some(leaf) = certs.first() else {
			return CertStatus::NO_CERT;
		};
		let Ok((_, cert)) = x509_parser::parse_x509_certificate(leaf.as_ref()) else {
			return CertStatus::INVALID;
		};
		let mut status = CertStatus::OK;
		let now = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_secs() as i64)
			.unwrap_or(0);
		let validity = cert.validity();
		if validity.not_after.timestamp() < now {
			status = status.with(CertStatus::EXPIRED);
		}
		if validity.not_before.timestamp() > now {
			status = status.with(CertStatus::NOT_YET_ACTIVATED);
		}
		status
	}
}

/// Map rustls certificate errors onto the status bitmask.
fn cert_status_of(e: &rustls::Error) -> CertStatus {
	use rustls::CertificateError::*;
	match e {
		rustls::Error::InvalidCertificate(ce) => match ce {
			Expired => CertStatus::EXPIRED,
			NotValidYet => CertStatus::NOT_YET_ACTIVATED,
			Revoked => CertStatus::REVOKED,
			UnknownIssuer => CertStatus::SIGNER_NOT_FOUND,
			BadSignature => CertStatus::INVALID,
			_ => CertStatus::INVALID,
		},
		rustls::Error::NoCertificatesPresented => CertStatus::NO_CERT,
		_ => CertStatus::OK,
	}
}

mod danger {
	use rustls::DigitallySignedStruct;
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::crypto::{verify_tls12_signature, verify_tls13_signature};
	use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

	/// Accepts any server certificate. Used when the session does not require
	/// peer verification; callers can still interrogate the certificate via
	/// `verify_peer`.
	#[derive(Debug)]
	pub struct NoVerifier;

	impl ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer<'_>,
			_intermediates: &[CertificateDer<'_>],
			_server_name: &ServerName<'_>,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			message: &[u8],
			cert: &CertificateDer<'_>,
			dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			let provider = rustls::crypto::CryptoProvider::get_default()
				.expect("provider installed in init()");
			verify_tls12_signature(
				message,
				cert,
				dss,
				&provider.signature_verification_algorithms,
			)
		}

		fn verify_tls13_signature(
			&self,
			message: &[u8],
			cert: &CertificateDer<'_>,
			dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			let provider = rustls::crypto::CryptoProvider::get_default()
				.expect("provider installed in init()");
			verify_tls13_signature(
				message,
				cert,
				dss,
				&provider.signature_verification_algorithms,
			)
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			rustls::crypto::CryptoProvider::get_default()
				.map(|p| p.signature_verification_algorithms.supported_schemes())
				.unwrap_or_default()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn anonymous_credentials_carry_a_key() {
		let creds = Credentials::anonymous().unwrap();
		assert!(!creds.certs.is_empty());
		assert!(creds.key.is_some());
		assert_eq!(creds.priority(), "NORMAL");
	}

	#[test]
	fn cert_status_formats_bits() {
		let s = CertStatus::EXPIRED.with(CertStatus::NO_CERT);
		let formatted = format!("{s:?}");
		assert!(formatted.contains("EXPIRED"));
		assert!(formatted.contains("NO_CERT"));
		assert_eq!(format!("{:?}", CertStatus::OK), "OK");
	}

	#[test]
	fn client_session_builds_without_verification() {
		let creds = Arc::new(Credentials::anonymous().unwrap());
		let params = TlsParams {
			mode: TlsMode::Client,
			credentials: creds,
			peer_required: false,
			server_name: Some("localhost".into()),
		};
		let session = TlsSession::new(&params, None).unwrap();
		assert_eq!(session.state(), HandshakeState::NotStarted);
	}

	#[test]
	fn server_session_requires_key() {
		let mut creds = Credentials::anonymous().unwrap();
		creds.key = None;
		let params = TlsParams {
			mode: TlsMode::Server,
			credentials: Arc::new(creds),
			peer_required: false,
			server_name: None,
		};
		assert!(matches!(
			TlsSession::new(&params, None),
			Err(TlsError::Credentials(_))
		));
	}

	#[test]
	fn handshake_over_memory_pipes_completes() {
		let server_creds = Arc::new(Credentials::anonymous().unwrap());
		// Client does not verify; the server presents the throwaway identity.
		let mut client = TlsSession::new(
			&TlsParams {
				mode: TlsMode::Client,
				credentials: Arc::new(Credentials::anonymous().unwrap()),
				peer_required: false,
				server_name: Some("localhost".into()),
			},
			None,
		)
		.unwrap();
		let mut server = TlsSession::new(
			&TlsParams {
				mode: TlsMode::Server,
				credentials: server_creds,
				peer_required: false,
				server_name: None,
			},
			None,
		)
		.unwrap();

		// Two in-memory unidirectional pipes.
		let mut c2s: MemPipe = MemPipe::default();
		let mut s2c: MemPipe = MemPipe::default();

		for _ in 0..32 {
			let c = {
				let mut io = PipeEnd {
					rx: &mut s2c,
					tx: &mut c2s,
				};
				client.handshake(&mut io).unwrap()
			};
			let s = {
				let mut io = PipeEnd {
					rx: &mut c2s,
					tx: &mut s2c,
				};
				server.handshake(&mut io).unwrap()
			};
			if c == Handshake::Done && s == Handshake::Done {
				// Plaintext round trip.
				client.write_plaintext(b"ping").unwrap();
				{
					let mut io = PipeEnd {
						rx: &mut s2c,
						tx: &mut c2s,
					};
					while client.wants_write() {
						client.write_out(&mut io).unwrap();
					}
				}
				let mut buf = [0u8; 4];
				let mut io = PipeEnd {
					rx: &mut c2s,
					tx: &mut s2c,
				};
				let n = server.read(&mut io, &mut buf).unwrap();
				assert_eq!(&buf[..n], b"ping");
				return;
			}
		}
		panic!("handshake did not converge");
	}

	/// An unbounded in-memory byte queue standing in for one direction of a
	/// socket.
	#[derive(Default)]
	struct MemPipe(Vec<u8>);

	struct PipeEnd<'a> {
		rx: &'a mut MemPipe,
		tx: &'a mut MemPipe,
	}

	impl Read for PipeEnd<'_> {
		fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
			if self.rx.0.is_empty() {
				return Err(io::ErrorKind::WouldBlock.into());
			}
			let n = buf.len().min(self.rx.0.len());
			buf[..n].copy_from_slice(&self.rx.0[..n]);
			self.rx.0.drain(..n);
			Ok(n)
		}
	}

	impl Write for PipeEnd<'_> {
		fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
			self.tx.0.extend_from_slice(buf);
			Ok(buf.len())
		}

		fn flush(&mut self) -> io::Result<()> {
			Ok(())
		}
	}
}

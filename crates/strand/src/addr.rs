use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// A concrete endpoint a socket can bind or connect to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
	Inet(SocketAddr),
	Local(PathBuf),
}

impl Address {
	pub fn family(&self) -> Family {
		match self {
			Address::Inet(sa) if sa.is_ipv4() => Family::Ipv4,
			Address::Inet(_) => Family::Ipv6,
			Address::Local(_) => Family::Local,
		}
	}
}

impl std::fmt::Display for Address {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Address::Inet(sa) => write!(f, "{sa}"),
			Address::Local(p) => write!(f, "{}", p.display()),
		}
	}
}

/// Address family constraint on a socket. A socket with a constraint only
/// accepts resolver candidates of that family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
	Ipv4,
	Ipv6,
	Local,
}

/// A textual target before resolution: either something that needs a name
/// lookup, an already-literal socket address, or a filesystem path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
	Name { host: String, port: u16 },
	Addr(SocketAddr),
	Path(PathBuf),
}

impl Target {
	/// Parse `"host:port"` (name or IP literal) or a filesystem path.
	/// Filesystem paths are recognized by a leading `/`, `./` or `../`.
	pub fn parse(spec: &str) -> Result<Target, Error> {
		if spec.is_empty() {
			return Err(Error::InvalidAddress(spec.into()));
		}
		if spec.starts_with('/') || spec.starts_with("./") || spec.starts_with("../") {
			return Ok(Target::Path(PathBuf::from(spec)));
		}
		// Fast path: a complete literal like `127.0.0.1:80` or `[::1]:80`.
		if let Ok(sa) = spec.parse::<SocketAddr>() {
			return Ok(Target::Addr(sa));
		}
		let (host, port) = spec
			.rsplit_once(':')
			.ok_or_else(|| Error::InvalidAddress(spec.into()))?;
		let port: u16 = port
			.parse()
			.map_err(|_| Error::InvalidAddress(spec.into()))?;
		let host = host.trim_start_matches('[').trim_end_matches(']');
		if host.is_empty() {
			return Err(Error::InvalidAddress(spec.into()));
		}
		if let Ok(ip) = host.parse::<IpAddr>() {
			return Ok(Target::Addr(SocketAddr::new(ip, port)));
		}
		Ok(Target::Name {
			host: host.to_string(),
			port,
		})
	}

	pub fn host(&self) -> Option<&str> {
		match self {
			Target::Name { host, .. } => Some(host),
			_ => None,
		}
	}
}

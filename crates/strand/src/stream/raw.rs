use std::io::{self, Read, Write};
use std::net::Shutdown;

use mio::event::Source;
use mio::net::TcpStream;
#[cfg(unix)]
use mio::net::UnixStream;

use crate::addr::Address;

/// The innermost pipeline layer: direct non-blocking OS I/O on a connected
/// stream. Would-block is returned as-is; the socket layer translates it
/// into clearing the matching `cond` bit, never into an error.
pub enum RawStream {
	Tcp(TcpStream),
	#[cfg(unix)]
	Unix(UnixStream),
}

impl RawStream {
	pub fn source_mut(&mut self) -> &mut dyn Source {
		match self {
			RawStream::Tcp(s) => s,
			#[cfg(unix)]
			RawStream::Unix(s) => s,
		}
	}

	pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		match self {
			RawStream::Tcp(s) => s.read(buf),
			#[cfg(unix)]
			RawStream::Unix(s) => s.read(buf),
		}
	}

	pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self {
			RawStream::Tcp(s) => s.write(buf),
			#[cfg(unix)]
			RawStream::Unix(s) => s.write(buf),
		}
	}

	pub fn shutdown_write(&self) -> io::Result<()> {
		match self {
			RawStream::Tcp(s) => s.shutdown(Shutdown::Write),
			#[cfg(unix)]
			RawStream::Unix(s) => s.shutdown(Shutdown::Write),
		}
	}

	pub fn take_error(&self) -> io::Result<Option<io::Error>> {
		match self {
			RawStream::Tcp(s) => s.take_error(),
			#[cfg(unix)]
			RawStream::Unix(s) => s.take_error(),
		}
	}

	pub fn peer_addr(&self) -> io::Result<Address> {
		match self {
			RawStream::Tcp(s) => Ok(Address::Inet(s.peer_addr()?)),
			#[cfg(unix)]
			RawStream::Unix(s) => {
				let addr = s.peer_addr()?;
				Ok(Address::Local(
					addr.as_pathname().map(Into::into).unwrap_or_default(),
				))
			},
		}
	}

	pub fn local_addr(&self) -> io::Result<Address> {
		match self {
			RawStream::Tcp(s) => Ok(Address::Inet(s.local_addr()?)),
			#[cfg(unix)]
			RawStream::Unix(s) => {
				let addr = s.local_addr()?;
				Ok(Address::Local(
					addr.as_pathname().map(Into::into).unwrap_or_default(),
				))
			},
		}
	}
}

pub fn would_block(e: &io::Error) -> bool {
	e.kind() == io::ErrorKind::WouldBlock
}

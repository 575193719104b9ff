//! A reactive peer-to-peer IPC substrate: non-blocking sockets driven by a
//! readiness reactor and a cooperative scheduler, a layered stream pipeline
//! (throttle, TLS, buffering), a pooled reverse proxy, and a peer/transport
//! abstraction carrying at-most-once byte messages.

pub mod addr;
pub mod config;
pub mod errors;
pub mod peer;
pub mod reproxy;
pub mod resolver;
pub mod runtime;
pub mod socket;
pub mod stream;
pub mod tls;
pub mod transport;

pub use addr::{Address, Family, Target};
pub use config::Config;
pub use errors::{Error, Result};
pub use peer::{CloseState, Peer, PeerManager};
pub use reproxy::{Backend, Bridge, PoolConfig, PoolStats, Reproxy};
pub use resolver::{ResolveHandle, Resolver};
pub use runtime::Core;
pub use socket::{Group, Socket, SocketHandler, State};
pub use strand_core::sched::Priority;
pub use strand_core::throttle::Throttle;
pub use tls::{CertStatus, Credentials, TlsMode, TlsParams};
pub use transport::{LineTransport, PairTransport, Transport, TransportEvents, create_peer, pair};

pub use std::fmt::{Debug, Display};
pub use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
pub use std::sync::Arc;
pub use std::sync::Weak;
pub use std::time::{Duration, Instant};

pub use bytes::{Bytes, BytesMut};
pub use parking_lot::{Condvar, Mutex, RwLock};
pub use tracing::{debug, error, info, trace, warn};

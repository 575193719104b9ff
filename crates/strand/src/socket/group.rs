use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use strand_core::throttle::Throttle;

use super::{Shared, Socket};

/// A throttling and closure container. Member sockets stack the group's
/// throttles on top of their own, and closing the group closes every member
/// still alive.
#[derive(Clone)]
pub struct Group {
	shared: Arc<GroupShared>,
}

pub(super) struct GroupShared {
	pub(super) throttle_in: Arc<Throttle>,
	pub(super) throttle_out: Arc<Throttle>,
	members: Mutex<Vec<Weak<Shared>>>,
}

impl Default for Group {
	fn default() -> Self {
		Self::new()
	}
}

impl Group {
	pub fn new() -> Group {
		Group {
			shared: Arc::new(GroupShared {
				throttle_in: Throttle::disabled(),
				throttle_out: Throttle::disabled(),
				members: Mutex::new(Vec::new()),
			}),
		}
	}

	pub fn throttle_in(&self) -> &Arc<Throttle> {
		&self.shared.throttle_in
	}

	pub fn throttle_out(&self) -> &Arc<Throttle> {
		&self.shared.throttle_out
	}

	pub fn set_bandwidth_in(&self, bytes_per_sec: u64) {
		self.shared.throttle_in.set_bandwidth(bytes_per_sec);
	}

	pub fn set_bandwidth_out(&self, bytes_per_sec: u64) {
		self.shared.throttle_out.set_bandwidth(bytes_per_sec);
	}

	pub fn set_latency_in(&self, latency: Duration) {
		self.shared.throttle_in.set_latency(latency);
	}

	pub fn set_latency_out(&self, latency: Duration) {
		self.shared.throttle_out.set_latency(latency);
	}

	pub(super) fn add_member(&self, member: &Socket) {
		let mut members = self.shared.members.lock();
		members.retain(|w| w.upgrade().is_some());
		members.push(Arc::downgrade(&member.shared));
	}

	pub fn len(&self) -> usize {
		let mut members = self.shared.members.lock();
		members.retain(|w| w.upgrade().is_some());
		members.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Close every live member.
	pub fn close(&self) {
		let sockets: Vec<Socket> = {
			let members = self.shared.members.lock();
			members
				.iter()
				.filter_map(|w| w.upgrade().map(|shared| Socket { shared }))
				.collect()
		};
		for socket in sockets {
			socket.close();
		}
	}
}

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Outcome of a throttle request: how much may move now, and if not all of
/// it, how long to wait before asking again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
	pub allowed: usize,
	pub wait: Option<Duration>,
}

impl Decision {
	pub fn unlimited(size: usize) -> Decision {
		Decision {
			allowed: size,
			wait: None,
		}
	}

	/// Combine with another throttle's decision: stacked throttles allow the
	/// minimum and wait for the furthest deadline.
	pub fn and(self, other: Decision) -> Decision {
		Decision {
			allowed: self.allowed.min(other.allowed),
			wait: match (self.wait, other.wait) {
				(Some(a), Some(b)) => Some(a.max(b)),
				(w, None) | (None, w) => w,
			},
		}
	}
}

/// Token-bucket rate limiter with a minimum inter-operation latency.
///
/// `bandwidth` is bytes per second, 0 disables rate limiting. `latency` is
/// the minimum gap between operations in microseconds, 0 disables it. The
/// byte budget resets on one-second window boundaries, so over any window
/// the reported bytes never exceed `bandwidth`.
pub struct Throttle {
	bandwidth: AtomicU64,
	latency_us: AtomicU64,
	state: Mutex<State>,
}

struct State {
	window_start: Instant,
	consumed: u64,
	last_op: Option<Instant>,
}

const WINDOW: Duration = Duration::from_secs(1);

impl Throttle {
	pub fn new(bandwidth: u64, latency: Duration) -> Arc<Throttle> {
		Arc::new(Throttle {
			bandwidth: AtomicU64::new(bandwidth),
			latency_us: AtomicU64::new(latency.as_micros() as u64),
			state: Mutex::new(State {
				window_start: Instant::now(),
				consumed: 0,
				last_op: None,
			}),
		})
	}

	pub fn disabled() -> Arc<Throttle> {
		Self::new(0, Duration::ZERO)
	}

	pub fn bandwidth(&self) -> u64 {
		self.bandwidth.load(Ordering::Relaxed)
	}

	pub fn set_bandwidth(&self, bytes_per_sec: u64) {
		self.bandwidth.store(bytes_per_sec, Ordering::Relaxed);
	}

	pub fn latency(&self) -> Duration {
		Duration::from_micros(self.latency_us.load(Ordering::Relaxed))
	}

	pub fn set_latency(&self, latency: Duration) {
		self
			.latency_us
			.store(latency.as_micros() as u64, Ordering::Relaxed);
	}

	pub fn is_active(&self) -> bool {
		self.bandwidth() > 0 || self.latency_us.load(Ordering::Relaxed) > 0
	}

	/// How much of `size` may move right now.
	pub fn request(&self, size: usize) -> Decision {
		let bandwidth = self.bandwidth.load(Ordering::Relaxed);
		let latency_us = self.latency_us.load(Ordering::Relaxed);
		if bandwidth == 0 && latency_us == 0 {
			return Decision::unlimited(size);
		}

		let now = Instant::now();
		let mut state = self.state.lock();
		roll_window(&mut state, now);

		if latency_us > 0
			&& let Some(last) = state.last_op
		{
			let gap = Duration::from_micros(latency_us);
			let elapsed = now - last;
			if elapsed < gap {
				return Decision {
					allowed: 0,
					wait: Some(gap - elapsed),
				};
			}
		}

		if bandwidth > 0 {
			let remaining = bandwidth.saturating_sub(state.consumed);
			let allowed = (size as u64).min(remaining) as usize;
			if allowed < size {
				let elapsed = now - state.window_start;
				let wait = WINDOW.saturating_sub(elapsed);
				return Decision {
					allowed,
					wait: Some(wait.max(Duration::from_millis(1))),
				};
			}
		}

		Decision::unlimited(size)
	}

	/// Account for bytes actually moved.
	pub fn report(&self, size: usize) {
		let now = Instant::now();
		let mut state = self.state.lock();
		roll_window(&mut state, now);
		state.consumed += size as u64;
		state.last_op = Some(now);
	}

	/// Evaluate a stack of throttles; the tightest wins.
	pub fn request_stack(throttles: &[Arc<Throttle>], size: usize) -> Decision {
		throttles
			.iter()
			.map(|t| t.request(size))
			.fold(Decision::unlimited(size), Decision::and)
	}

	pub fn report_stack(throttles: &[Arc<Throttle>], size: usize) {
		for t in throttles {
			t.report(size);
		}
	}
}

fn roll_window(state: &mut State, now: Instant) {
	if now - state.window_start >= WINDOW {
		state.window_start = now;
		state.consumed = 0;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unlimited_passes_everything() {
		let t = Throttle::disabled();
		let d = t.request(1 << 20);
		assert_eq!(d.allowed, 1 << 20);
		assert_eq!(d.wait, None);
	}

	#[test]
	fn bandwidth_caps_within_window() {
		let t = Throttle::new(1024, Duration::ZERO);
		let d = t.request(4096);
		assert_eq!(d.allowed, 1024);
		assert!(d.wait.is_some());
		t.report(1024);

		let d = t.request(1);
		assert_eq!(d.allowed, 0);
		let wait = d.wait.unwrap();
		assert!(wait <= WINDOW, "{wait:?}");
	}

	#[test]
	fn window_resets_budget() {
		let t = Throttle::new(100, Duration::ZERO);
		assert_eq!(t.request(100).allowed, 100);
		t.report(100);
		assert_eq!(t.request(100).allowed, 0);
		std::thread::sleep(WINDOW + Duration::from_millis(20));
		assert_eq!(t.request(100).allowed, 100);
	}

	#[test]
	fn latency_spaces_operations() {
		let t = Throttle::new(0, Duration::from_millis(40));
		// First op is never latency-delayed.
		assert_eq!(t.request(10).allowed, 10);
		t.report(10);
		let d = t.request(10);
		assert_eq!(d.allowed, 0);
		assert!(d.wait.unwrap() <= Duration::from_millis(40));
		std::thread::sleep(Duration::from_millis(50));
		assert_eq!(t.request(10).allowed, 10);
	}

	#[test]
	fn reported_bytes_bounded_per_window() {
		let t = Throttle::new(2048, Duration::ZERO);
		let mut moved = 0usize;
		loop {
			let d = t.request(512);
			if d.allowed == 0 {
				break;
			}
			t.report(d.allowed);
			moved += d.allowed;
		}
		assert!(moved <= 2048, "{moved}");
	}

	#[test]
	fn stacked_throttles_take_min() {
		let wide = Throttle::new(4096, Duration::ZERO);
		let narrow = Throttle::new(512, Duration::ZERO);
		let stack = vec![wide, narrow];
		let d = Throttle::request_stack(&stack, 2048);
		assert_eq!(d.allowed, 512);
		assert!(d.wait.is_some());
	}
}

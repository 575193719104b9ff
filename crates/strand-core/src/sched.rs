use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::prelude::{Duration, Instant};

/// Dispatch priority. Lower values run first.
pub type Priority = i32;

pub const PRIORITY_DEFAULT: Priority = 0;
/// Subtracted from a socket's priority while it is connecting or accepting.
pub const PRIORITY_BUMP: Priority = 2;

type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// A cooperative, single-threaded task queue. One thread calls [`Scheduler::run`]
/// and becomes the serialization point for everything built on top: any other
/// thread may `post`, but side effects only ever happen on the running thread.
///
/// Tasks run in priority order, ties broken by insertion order. Delayed tasks
/// enter the priority queue once their deadline passes.
pub struct Scheduler {
	shared: Arc<Shared>,
}

struct Shared {
	queue: Mutex<Queue>,
	condvar: Condvar,
}

struct Queue {
	ready: BinaryHeap<ReadyTask>,
	delayed: BinaryHeap<DelayedTask>,
	seq: u64,
	stopped: bool,
}

struct ReadyTask {
	priority: Priority,
	seq: u64,
	cancelled: Arc<AtomicBool>,
	f: TaskFn,
}

struct DelayedTask {
	due: Instant,
	priority: Priority,
	seq: u64,
	cancelled: Arc<AtomicBool>,
	f: TaskFn,
}

// BinaryHeap is a max-heap; invert the comparisons so the smallest
// (priority, seq) / earliest deadline pops first.
impl Ord for ReadyTask {
	fn cmp(&self, other: &Self) -> CmpOrdering {
		(other.priority, other.seq).cmp(&(self.priority, self.seq))
	}
}
impl PartialOrd for ReadyTask {
	fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
		Some(self.cmp(other))
	}
}
impl Eq for ReadyTask {}
impl PartialEq for ReadyTask {
	fn eq(&self, other: &Self) -> bool {
		self.priority == other.priority && self.seq == other.seq
	}
}

impl Ord for DelayedTask {
	fn cmp(&self, other: &Self) -> CmpOrdering {
		(other.due, other.seq).cmp(&(self.due, self.seq))
	}
}
impl PartialOrd for DelayedTask {
	fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
		Some(self.cmp(other))
	}
}
impl Eq for DelayedTask {}
impl PartialEq for DelayedTask {
	fn eq(&self, other: &Self) -> bool {
		self.due == other.due && self.seq == other.seq
	}
}

/// Handle to a posted task. Cancelling before the task fires prevents it from
/// running; cancelling afterwards is a no-op.
#[derive(Clone)]
pub struct TaskHandle {
	cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
	pub fn cancel(&self) {
		self.cancelled.store(true, Ordering::SeqCst);
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancelled.load(Ordering::SeqCst)
	}
}

impl Default for Scheduler {
	fn default() -> Self {
		Self::new()
	}
}

impl Scheduler {
	pub fn new() -> Scheduler {
		Scheduler {
			shared: Arc::new(Shared {
				queue: Mutex::new(Queue {
					ready: BinaryHeap::new(),
					delayed: BinaryHeap::new(),
					seq: 0,
					stopped: false,
				}),
				condvar: Condvar::new(),
			}),
		}
	}

	pub fn handle(&self) -> SchedulerHandle {
		SchedulerHandle {
			shared: self.shared.clone(),
		}
	}

	/// Run tasks on the calling thread until [`SchedulerHandle::shutdown`] is
	/// called and the ready queue is drained.
	pub fn run(&self) {
		loop {
			let task = {
				let mut q = self.shared.queue.lock();
				loop {
					let now = Instant::now();
					promote_due(&mut q, now);
					if let Some(t) = q.ready.pop() {
						break Some(t);
					}
					if q.stopped {
						break None;
					}
					match q.delayed.peek().map(|d| d.due) {
						Some(deadline) => {
							self.shared.condvar.wait_until(&mut q, deadline);
						},
						None => self.shared.condvar.wait(&mut q),
					}
				}
			};
			match task {
				Some(t) => {
					if !t.cancelled.load(Ordering::SeqCst) {
						(t.f)();
					}
				},
				None => return,
			}
		}
	}

	/// Run on a dedicated named thread, returning a handle for posting.
	pub fn spawn() -> (SchedulerHandle, thread::JoinHandle<()>) {
		let sched = Scheduler::new();
		let handle = sched.handle();
		let join = thread::Builder::new()
			.name("strand-sched".into())
			.spawn(move || sched.run())
			.expect("spawn scheduler thread");
		(handle, join)
	}
}

fn promote_due(q: &mut Queue, now: Instant) {
	while q.delayed.peek().is_some_and(|d| d.due <= now) {
		let d = q.delayed.pop().expect("peeked");
		q.ready.push(ReadyTask {
			priority: d.priority,
			seq: d.seq,
			cancelled: d.cancelled,
			f: d.f,
		});
	}
}

/// Cloneable posting surface of a [`Scheduler`]. Valid from any thread.
#[derive(Clone)]
pub struct SchedulerHandle {
	shared: Arc<Shared>,
}

impl SchedulerHandle {
	pub fn post(&self, priority: Priority, f: impl FnOnce() + Send + 'static) -> TaskHandle {
		let cancelled = Arc::new(AtomicBool::new(false));
		let mut q = self.shared.queue.lock();
		if q.stopped {
			trace!("task posted after shutdown, dropping");
			return TaskHandle {
				cancelled: Arc::new(AtomicBool::new(true)),
			};
		}
		q.seq += 1;
		let seq = q.seq;
		q.ready.push(ReadyTask {
			priority,
			seq,
			cancelled: cancelled.clone(),
			f: Box::new(f),
		});
		self.shared.condvar.notify_one();
		TaskHandle { cancelled }
	}

	pub fn post_after(
		&self,
		delay: Duration,
		priority: Priority,
		f: impl FnOnce() + Send + 'static,
	) -> TaskHandle {
		let cancelled = Arc::new(AtomicBool::new(false));
		let mut q = self.shared.queue.lock();
		if q.stopped {
			return TaskHandle {
				cancelled: Arc::new(AtomicBool::new(true)),
			};
		}
		q.seq += 1;
		let seq = q.seq;
		q.delayed.push(DelayedTask {
			due: Instant::now() + delay,
			priority,
			seq,
			cancelled: cancelled.clone(),
			f: Box::new(f),
		});
		// The runner may be sleeping past the new deadline.
		self.shared.condvar.notify_one();
		TaskHandle { cancelled }
	}

	/// Stop the runner once the ready queue drains. Pending delayed tasks are
	/// discarded.
	pub fn shutdown(&self) {
		let mut q = self.shared.queue.lock();
		q.stopped = true;
		q.delayed.clear();
		self.shared.condvar.notify_all();
	}
}

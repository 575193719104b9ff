use std::sync::Arc;
use std::thread;

use strand_core::reactor::Reactor;
use strand_core::sched::{Scheduler, SchedulerHandle};
use tracing::debug;

use crate::config::Config;
use crate::errors::Result;
use crate::resolver::Resolver;

/// The shared runtime behind every socket: one reactor thread, one scheduler
/// thread (the "main context" all state transitions run on), and the
/// resolver worker.
///
/// Teardown order on [`Core::shutdown`]: resolver first (no new completions),
/// then the scheduler (drains the ready queue), then the reactor.
pub struct Core {
	config: Config,
	sched: SchedulerHandle,
	reactor: Arc<Reactor>,
	resolver: Resolver,
	sched_thread: parking_lot::Mutex<Option<thread::JoinHandle<()>>>,
}

impl Core {
	pub fn new() -> Result<Arc<Core>> {
		Self::with_config(Config::from_env())
	}

	pub fn with_config(config: Config) -> Result<Arc<Core>> {
		let (sched, sched_thread) = Scheduler::spawn();
		let reactor = Reactor::new()?;
		let resolver = Resolver::new(sched.clone());
		Ok(Arc::new(Core {
			config,
			sched,
			reactor,
			resolver,
			sched_thread: parking_lot::Mutex::new(Some(sched_thread)),
		}))
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn sched(&self) -> &SchedulerHandle {
		&self.sched
	}

	pub fn reactor(&self) -> &Arc<Reactor> {
		&self.reactor
	}

	pub fn resolver(&self) -> &Resolver {
		&self.resolver
	}

	pub fn shutdown(&self) {
		debug!("core shutting down");
		self.resolver.shutdown();
		self.sched.shutdown();
		if let Some(t) = self.sched_thread.lock().take() {
			let _ = t.join();
		}
		self.reactor.shutdown();
	}
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use parking_lot::Mutex;
use strand_core::sched::{Priority, SchedulerHandle};
use tracing::{debug, trace};

use crate::addr::{Address, Target};
use crate::errors::Error;

type Completion = Box<dyn FnOnce(Result<Vec<Address>, Error>) + Send + 'static>;

/// Asynchronous name resolution. Lookups run on a dedicated worker thread;
/// completions are always delivered as scheduler tasks, so callers observe
/// them on the main context like every other event.
pub struct Resolver {
	sched: SchedulerHandle,
	jobs: Mutex<Option<mpsc::Sender<Job>>>,
	worker: Mutex<Option<thread::JoinHandle<()>>>,
}

struct Job {
	host: String,
	port: u16,
	priority: Priority,
	request: Arc<Request>,
}

struct Request {
	completion: Mutex<Option<Completion>>,
}

/// Cancellation token for an in-flight resolution. After `cancel` returns
/// the success callback will never fire; the request instead completes with
/// [`Error::Cancelled`], exactly once.
#[derive(Clone)]
pub struct ResolveHandle {
	request: Arc<Request>,
	sched: SchedulerHandle,
	priority: Priority,
}

impl ResolveHandle {
	pub fn cancel(&self) {
		if let Some(completion) = self.request.completion.lock().take() {
			trace!("resolve cancelled");
			self
				.sched
				.post(self.priority, move || completion(Err(Error::Cancelled)));
		}
	}
}

impl Resolver {
	pub fn new(sched: SchedulerHandle) -> Resolver {
		let (tx, rx) = mpsc::channel::<Job>();
		let worker_sched = sched.clone();
		let worker = thread::Builder::new()
			.name("strand-resolver".into())
			.spawn(move || worker_loop(rx, worker_sched))
			.expect("spawn resolver thread");
		Resolver {
			sched,
			jobs: Mutex::new(Some(tx)),
			worker: Mutex::new(Some(worker)),
		}
	}

	/// Resolve a textual target into an ordered candidate list.
	///
	/// Literal addresses and filesystem paths complete without a lookup, but
	/// still via the scheduler: the completion never runs inside this call.
	pub fn resolve(
		&self,
		spec: &str,
		priority: Priority,
		completion: impl FnOnce(Result<Vec<Address>, Error>) + Send + 'static,
	) -> ResolveHandle {
		let request = Arc::new(Request {
			completion: Mutex::new(Some(Box::new(completion) as Completion)),
		});
		let handle = ResolveHandle {
			request: request.clone(),
			sched: self.sched.clone(),
			priority,
		};

		match Target::parse(spec) {
			Err(e) => self.finish(priority, request, Err(e)),
			Ok(Target::Addr(sa)) => {
				self.finish(priority, request, Ok(vec![Address::Inet(sa)]));
			},
			Ok(Target::Path(p)) => {
				self.finish(priority, request, Ok(vec![Address::Local(p)]));
			},
			Ok(Target::Name { host, port }) => {
				let job = Job {
					host,
					port,
					priority,
					request,
				};
				let send_failed = {
					let jobs = self.jobs.lock();
					match jobs.as_ref() {
						Some(tx) => tx.send(job).err().map(|e| e.0),
						None => Some(job),
					}
				};
				if let Some(job) = send_failed {
					self.finish(
						priority,
						job.request,
						Err(Error::ResolveFailure("resolver shut down".into())),
					);
				}
			},
		}
		handle
	}

	fn finish(&self, priority: Priority, request: Arc<Request>, result: Result<Vec<Address>, Error>) {
		if let Some(completion) = request.completion.lock().take() {
			self.sched.post(priority, move || completion(result));
		}
	}

	pub fn shutdown(&self) {
		// Dropping the sender ends the worker loop.
		self.jobs.lock().take();
		if let Some(w) = self.worker.lock().take() {
			let _ = w.join();
		}
	}
}

fn worker_loop(rx: mpsc::Receiver<Job>, sched: SchedulerHandle) {
	let lookup = Lookup::new();
	while let Ok(job) = rx.recv() {
		// Skip the OS round-trip if the caller already cancelled.
		if job.request.completion.lock().is_none() {
			continue;
		}
		let result = lookup.lookup(&job.host, job.port);
		if let Some(completion) = job.request.completion.lock().take() {
			sched.post(job.priority, move || completion(result));
		}
	}
	debug!("resolver worker exiting");
}

enum Lookup {
	System(Box<hickory_resolver::Resolver>),
	Unavailable(String),
}

impl Lookup {
	fn new() -> Lookup {
		let built = hickory_resolver::Resolver::from_system_conf().or_else(|_| {
			hickory_resolver::Resolver::new(
				hickory_resolver::config::ResolverConfig::default(),
				hickory_resolver::config::ResolverOpts::default(),
			)
		});
		match built {
			Ok(r) => Lookup::System(Box::new(r)),
			Err(e) => Lookup::Unavailable(e.to_string()),
		}
	}

	fn lookup(&self, host: &str, port: u16) -> Result<Vec<Address>, Error> {
		let resolver = match self {
			Lookup::System(r) => r,
			Lookup::Unavailable(e) => return Err(Error::ResolveFailure(e.clone())),
		};
		let ips = resolver
			.lookup_ip(host)
			.map_err(|e| Error::ResolveFailure(e.to_string()))?;
		let mut out: Vec<Address> = ips
			.iter()
			.map(|ip| Address::Inet(SocketAddr::new(ip, port)))
			.collect();
		// Prefer v4 first; callers pick the first candidate matching their
		// family constraint, and unconstrained sockets take the head.
		out.sort_by_key(|a| matches!(a, Address::Inet(sa) if sa.is_ipv6()));
		if out.is_empty() {
			return Err(Error::ResolveFailure(format!("no addresses for {host}")));
		}
		Ok(out)
	}
}

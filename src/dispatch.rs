use crate::errors::{
	DispatchError,
	InvalidDispatchModeError,
};
use parking_lot::Mutex;
use std::{
	fmt::{self, Display, Formatter},
	io,
	num::NonZeroUsize,
	panic::{self, AssertUnwindSafe},
	str::FromStr,
	sync::{mpsc, Arc},
	thread,
};

#[cfg(doc)]
use crate::Acceptor;

/// A unit of work submitted to a [`Dispatch`]: invoking the on-accept callback for one connection.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// How an [`Acceptor`] runs its on-accept callback for each accepted connection.
///
/// The default is [`Synchronous`][Self::Synchronous].
///
/// The dispatch strategy is chosen with [`Acceptor::set_dispatch`], which is only allowed while the acceptor is not running.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub enum Dispatch {
	/// Run the callback on the accept loop thread itself.
	///
	/// Callbacks run strictly in the order that connections were accepted, one at a time. No new connection is accepted until the callback returns, so this is only appropriate when the callback is fast or hands off its work elsewhere.
	#[default]
	Synchronous,

	/// Spawn a new thread for each connection.
	///
	/// There is no limit on the number of threads. A flood of connections can exhaust system resources.
	SpawnPerConnection,

	/// Submit each connection to a fixed pool of pre-spawned worker threads. Connections queue up, without limit, while all workers are busy.
	///
	/// Create this with [`Dispatch::fixed_pool`].
	FixedPool(WorkerPool),
}

impl Dispatch {
	/// Spawns a pool of `workers` threads and returns a `Dispatch` that submits work to it.
	///
	/// The pool lives as long as this `Dispatch` or any clone of it. It is *not* shut down when the acceptor using it is stopped or closed; the worker threads only exit once every clone of this `Dispatch` has been dropped.
	pub fn fixed_pool(workers: usize) -> Result<Self, DispatchError> {
		let workers = NonZeroUsize::new(workers).ok_or(DispatchError::ZeroWorkers)?;
		WorkerPool::new(workers).map(Self::FixedPool)
	}

	/// Runs `job` according to this strategy.
	///
	/// For [`Synchronous`][Self::Synchronous], this returns after `job` does, and a panic in `job` propagates to the caller. For the other strategies, this returns as soon as `job` has been handed off, and an error means that it could not be.
	pub fn run(&self, job: Job) -> io::Result<()> {
		match self {
			Self::Synchronous => {
				job();
				Ok(())
			},

			Self::SpawnPerConnection => {
				thread::Builder::new()
				.name("acceptor-connection".into())
				.spawn(job)?;

				Ok(())
			},

			Self::FixedPool(pool) => pool.submit(job),
		}
	}
}

/// A fixed-size pool of worker threads with an unbounded job queue. See [`Dispatch::FixedPool`].
#[derive(Clone, Debug)]
pub struct WorkerPool {
	sender: mpsc::Sender<Job>,
	workers: NonZeroUsize,
}

impl WorkerPool {
	fn new(workers: NonZeroUsize) -> Result<Self, DispatchError> {
		let (sender, receiver) = mpsc::channel::<Job>();
		let receiver = Arc::new(Mutex::new(receiver));

		for index in 0..workers.get() {
			let receiver = receiver.clone();

			thread::Builder::new()
			.name(format!("acceptor-worker-{index}"))
			.spawn(move || worker_main(&receiver))
			.map_err(|error| DispatchError::SpawnWorker { error })?;
		}

		Ok(Self { sender, workers })
	}

	/// A pool whose workers are all gone, so that every submission fails.
	#[cfg(test)]
	pub(crate) fn closed() -> Self {
		let (sender, _) = mpsc::channel::<Job>();
		Self { sender, workers: NonZeroUsize::MIN }
	}

	/// The number of worker threads in this pool.
	pub fn workers(&self) -> usize {
		self.workers.get()
	}

	fn submit(&self, job: Job) -> io::Result<()> {
		self.sender.send(job)
		.map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker pool has shut down"))
	}
}

fn worker_main(receiver: &Mutex<mpsc::Receiver<Job>>) {
	loop {
		// The lock is released before the job runs, so other workers can pick up jobs meanwhile.
		let job = match receiver.lock().recv() {
			Ok(job) => job,
			Err(mpsc::RecvError) => break,
		};

		if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
			tracing::error!("on-accept callback panicked on a pool worker");
		}
	}

	tracing::trace!("worker pool closed; worker exiting");
}

/// A configurable selector for a [`Dispatch`] strategy, suitable for command-line options and configuration files.
///
/// # Syntax
///
/// * `sync`: [`Dispatch::Synchronous`]
/// * `thread`: [`Dispatch::SpawnPerConnection`]
/// * <code>pool:<var>n</var></code>: [`Dispatch::FixedPool`] with <code><var>n</var></code> workers
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde_with::DeserializeFromStr, serde_with::SerializeDisplay))]
#[non_exhaustive]
pub enum DispatchMode {
	/// See [`Dispatch::Synchronous`].
	#[default]
	Synchronous,

	/// See [`Dispatch::SpawnPerConnection`].
	SpawnPerConnection,

	/// See [`Dispatch::FixedPool`].
	#[non_exhaustive]
	FixedPool {
		/// The number of worker threads.
		workers: NonZeroUsize,
	},
}

impl DispatchMode {
	/// A `FixedPool` mode with the given number of workers.
	pub fn fixed_pool(workers: NonZeroUsize) -> Self {
		Self::FixedPool { workers }
	}

	/// Sets up the selected strategy. For a fixed pool, this spawns its worker threads.
	pub fn build(self) -> Result<Dispatch, DispatchError> {
		match self {
			Self::Synchronous => Ok(Dispatch::Synchronous),
			Self::SpawnPerConnection => Ok(Dispatch::SpawnPerConnection),
			Self::FixedPool { workers } => WorkerPool::new(workers).map(Dispatch::FixedPool),
		}
	}
}

impl FromStr for DispatchMode {
	type Err = InvalidDispatchModeError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"sync" => return Ok(Self::Synchronous),
			"thread" => return Ok(Self::SpawnPerConnection),
			_ => {},
		}

		let workers = s.strip_prefix("pool:").ok_or(InvalidDispatchModeError::Unrecognized)?;

		let workers: NonZeroUsize =
			workers.parse()
			.map_err(|error| InvalidDispatchModeError::InvalidWorkerCount { error })?;

		Ok(Self::FixedPool { workers })
	}
}

impl Display for DispatchMode {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			Self::Synchronous => f.write_str("sync"),
			Self::SpawnPerConnection => f.write_str("thread"),
			Self::FixedPool { workers } => write!(f, "pool:{workers}"),
		}
	}
}

#[cfg(test)]
use {
	assert_matches::assert_matches,
	std::{
		collections::HashSet,
		sync::Barrier,
		time::Duration,
	},
};

#[test]
fn test_parse_dispatch_mode() {
	assert_matches!("sync".parse::<DispatchMode>(), Ok(DispatchMode::Synchronous));
	assert_matches!("thread".parse::<DispatchMode>(), Ok(DispatchMode::SpawnPerConnection));
	assert_matches!(
		"pool:4".parse::<DispatchMode>(),
		Ok(DispatchMode::FixedPool { workers })
		if workers.get() == 4
	);

	assert_matches!("pool".parse::<DispatchMode>(), Err(InvalidDispatchModeError::Unrecognized));
	assert_matches!("threads".parse::<DispatchMode>(), Err(InvalidDispatchModeError::Unrecognized));
	assert_matches!("pool:0".parse::<DispatchMode>(), Err(InvalidDispatchModeError::InvalidWorkerCount { .. }));
	assert_matches!("pool:x".parse::<DispatchMode>(), Err(InvalidDispatchModeError::InvalidWorkerCount { .. }));

	for mode in ["sync", "thread", "pool:16"] {
		assert_eq!(mode.parse::<DispatchMode>().unwrap().to_string(), mode);
	}
}

#[test]
fn test_zero_workers() {
	assert_matches!(Dispatch::fixed_pool(0), Err(DispatchError::ZeroWorkers));
}

#[test]
fn test_synchronous_runs_inline() {
	let caller = thread::current().id();
	let (sender, receiver) = mpsc::channel();

	Dispatch::Synchronous.run(Box::new(move || {
		sender.send(thread::current().id()).unwrap();
	})).unwrap();

	assert_eq!(receiver.try_recv().unwrap(), caller);
}

#[test]
fn test_spawn_per_connection_runs_elsewhere() {
	let caller = thread::current().id();
	let (sender, receiver) = mpsc::channel();

	for _ in 0..2 {
		let sender = sender.clone();
		Dispatch::SpawnPerConnection.run(Box::new(move || {
			sender.send(thread::current().id()).unwrap();
		})).unwrap();
	}

	let first = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
	let second = receiver.recv_timeout(Duration::from_secs(5)).unwrap();

	assert_ne!(first, caller);
	assert_ne!(second, caller);
	assert_ne!(first, second);
}

#[test]
fn test_fixed_pool_runs_concurrently() {
	let dispatch = Dispatch::fixed_pool(3).unwrap();
	assert_matches!(&dispatch, Dispatch::FixedPool(pool) if pool.workers() == 3);

	// All three jobs must be running at once to get past the barrier.
	let barrier = Arc::new(Barrier::new(3));
	let (sender, receiver) = mpsc::channel();

	for _ in 0..3 {
		let barrier = barrier.clone();
		let sender = sender.clone();

		dispatch.run(Box::new(move || {
			barrier.wait();
			sender.send(thread::current().id()).unwrap();
		})).unwrap();
	}

	let threads: HashSet<_> =
		(0..3)
		.map(|_| receiver.recv_timeout(Duration::from_secs(5)).unwrap())
		.collect();

	assert_eq!(threads.len(), 3);
}

#[test]
fn test_fixed_pool_survives_panic() {
	let dispatch = Dispatch::fixed_pool(1).unwrap();
	let (sender, receiver) = mpsc::channel();

	dispatch.run(Box::new(|| panic!("test panic"))).unwrap();

	dispatch.run(Box::new(move || {
		sender.send(()).unwrap();
	})).unwrap();

	receiver.recv_timeout(Duration::from_secs(5)).unwrap();
}

#[test]
fn test_closed_pool_rejects_jobs() {
	let dispatch = Dispatch::FixedPool(WorkerPool::closed());

	let error = dispatch.run(Box::new(|| unreachable!())).unwrap_err();
	assert_eq!(error.kind(), io::ErrorKind::BrokenPipe);
}

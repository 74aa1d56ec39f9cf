use crate::{
	dispatch::{Dispatch, Job},
	errors::{
		AcceptError,
		LifecycleError,
		OpenListenerError,
	},
	open_listener,
	Completion,
	Listener,
	TimedListener,
	DEFAULT_ACCEPT_TIMEOUT,
};
use parking_lot::{
	MappedRwLockReadGuard,
	Mutex,
	RwLock,
	RwLockReadGuard,
};
use std::{
	fmt::{self, Debug, Formatter},
	io,
	net::SocketAddr,
	panic::{self, AssertUnwindSafe},
	sync::Arc,
	thread,
	time::Duration,
};

/// Callback invoked once per accepted connection.
pub type AcceptCallback<L> = dyn Fn(&Acceptor<L>, <L as Listener>::Connection) + Send + Sync;

/// Callback invoked once per failed accept, other than a timeout.
pub type AcceptErrorCallback<L> = dyn Fn(&Acceptor<L>, io::Error) + Send + Sync;

/// Callback invoked each time an accept times out without a connection.
pub type AcceptTimeoutCallback<L> = dyn Fn(&Acceptor<L>) + Send + Sync;

/// The lifecycle state of an [`Acceptor`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum AcceptorState {
	/// Never started, or fully stopped. The acceptor can be configured and started.
	Idle,

	/// The accept loop is running.
	Running,

	/// A stop has been requested, but the accept loop has not exited yet. It exits the next time an accept returns, which is at most one accept timeout from now (plus however long a [synchronous][Dispatch::Synchronous] callback takes).
	Stopping,

	/// The acceptor has been [closed][Acceptor::close], and can no longer be used.
	Closed,
}

/// Accepts connections from a [`Listener`] on a dedicated thread, and hands each one to a callback.
///
/// An `Acceptor` is configured while idle, with a [dispatch strategy][Dispatch] and up to three callbacks:
///
/// * [on-accept][Self::set_on_accept], invoked with each accepted connection, according to the dispatch strategy.
/// * [on-accept-error][Self::set_on_accept_error], invoked on the accept loop thread whenever accepting fails. If unset, the error is logged and the loop continues.
/// * [on-accept-timeout][Self::set_on_accept_timeout], invoked on the accept loop thread whenever an accept times out without a connection.
///
/// An unset callback does nothing. Setting a callback again replaces the previous one.
///
/// Then it is [started][Self::start] and [stopped][Self::stop], as many times as needed. Each start and stop returns a [`Completion`] that signals when the accept loop has actually started or exited.
///
/// Nothing but [`stop`][Self::stop] (or [`close`][Self::close]) ends the accept loop. A failed accept, a failed dispatch, or a panicking callback on the loop thread is reported and the loop carries on.
///
/// `Acceptor` is a handle: clones refer to the same acceptor, and each callback receives one so it can, for example, stop the acceptor. A running accept loop keeps the acceptor alive, even if every other handle has been dropped.
///
///
/// # Example
///
/// ```no_run
/// use socket_acceptor::{Acceptor, Dispatch};
/// use std::io::Write;
///
/// # fn example_fn() -> Result<(), Box<dyn std::error::Error>> {
/// let acceptor = Acceptor::bind_default(&"127.0.0.1:8080".parse()?)?;
///
/// acceptor.set_dispatch(Dispatch::fixed_pool(4)?)?;
/// acceptor.set_on_accept(|_acceptor, mut connection| {
/// 	let _ = connection.write_all(b"Hello, world!\n");
/// })?;
///
/// acceptor.start()?.wait();
/// // ...
/// acceptor.stop()?.wait();
/// #
/// # Ok(())
/// # }
/// ```
pub struct Acceptor<L: Listener = TimedListener> {
	inner: Arc<Inner<L>>,
}

struct Inner<L: Listener> {
	listener: RwLock<Option<L>>,
	control: Mutex<Control<L>>,
}

struct Control<L: Listener> {
	state: AcceptorState,
	stop_signal: Completion,
	config: Config<L>,
}

struct Config<L: Listener> {
	dispatch: Dispatch,
	on_accept: Option<Arc<AcceptCallback<L>>>,
	on_accept_error: Option<Arc<AcceptErrorCallback<L>>>,
	on_accept_timeout: Option<Arc<AcceptTimeoutCallback<L>>>,
}

impl<L: Listener> Clone for Config<L> {
	fn clone(&self) -> Self {
		Self {
			dispatch: self.dispatch.clone(),
			on_accept: self.on_accept.clone(),
			on_accept_error: self.on_accept_error.clone(),
			on_accept_timeout: self.on_accept_timeout.clone(),
		}
	}
}

impl<L: Listener> Default for Config<L> {
	fn default() -> Self {
		Self {
			dispatch: Dispatch::default(),
			on_accept: None,
			on_accept_error: None,
			on_accept_timeout: None,
		}
	}
}

impl<L: Listener> Clone for Acceptor<L> {
	fn clone(&self) -> Self {
		Self { inner: self.inner.clone() }
	}
}

impl<L: Listener> Debug for Acceptor<L> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		let control = self.inner.control.lock();

		f.debug_struct("Acceptor")
		.field("state", &control.state)
		.field("dispatch", &control.config.dispatch)
		.finish_non_exhaustive()
	}
}

impl Acceptor<TimedListener> {
	/// Opens a TCP listening socket with [`open_listener`], and creates an idle acceptor around it.
	pub fn bind(
		address: &SocketAddr,
		accept_timeout: Duration,
	) -> Result<Self, OpenListenerError> {
		open_listener(address, accept_timeout).map(Self::new)
	}

	/// Same as [`bind`][Self::bind], with the [default accept timeout][DEFAULT_ACCEPT_TIMEOUT].
	pub fn bind_default(address: &SocketAddr) -> Result<Self, OpenListenerError> {
		Self::bind(address, DEFAULT_ACCEPT_TIMEOUT)
	}

	/// The address that the listening socket is bound to.
	///
	/// # Errors
	///
	/// Fails with [`io::ErrorKind::NotConnected`] if the acceptor has been closed.
	pub fn local_addr(&self) -> io::Result<SocketAddr> {
		self.listener()
		.ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "acceptor is closed"))?
		.local_addr()
	}
}

impl<L: Listener> Acceptor<L> {
	/// Creates an idle acceptor around the given listener, with [synchronous dispatch][Dispatch::Synchronous] and no callbacks.
	pub fn new(listener: L) -> Self {
		Self::with_dispatch(listener, Dispatch::default())
	}

	pub(crate) fn with_dispatch(listener: L, dispatch: Dispatch) -> Self {
		Self {
			inner: Arc::new(Inner {
				listener: RwLock::new(Some(listener)),
				control: Mutex::new(Control {
					state: AcceptorState::Idle,
					stop_signal: Completion::new(),
					config: Config {
						dispatch,
						..Config::default()
					},
				}),
			}),
		}
	}

	/// The listener, or `None` if the acceptor has been closed.
	///
	/// The listener stays locked against [`close`][Self::close] for as long as the returned guard is held.
	pub fn listener(&self) -> Option<MappedRwLockReadGuard<'_, L>> {
		RwLockReadGuard::try_map(
			self.inner.listener.read_recursive(),
			Option::as_ref,
		).ok()
	}

	/// The current lifecycle state.
	pub fn state(&self) -> AcceptorState {
		self.inner.control.lock().state
	}

	/// Whether the accept loop is running. This is true from [`start`][Self::start] until the loop has fully exited after a [`stop`][Self::stop].
	pub fn is_running(&self) -> bool {
		matches!(self.state(), AcceptorState::Running | AcceptorState::Stopping)
	}

	fn configure(&self, change: impl FnOnce(&mut Config<L>)) -> Result<(), LifecycleError> {
		let mut control = self.inner.control.lock();

		match control.state {
			AcceptorState::Idle => {
				change(&mut control.config);
				Ok(())
			},
			AcceptorState::Running | AcceptorState::Stopping => Err(LifecycleError::AlreadyRunning),
			AcceptorState::Closed => Err(LifecycleError::Closed),
		}
	}

	/// Sets the dispatch strategy.
	///
	/// # Errors
	///
	/// [`LifecycleError::AlreadyRunning`] if the acceptor is running, or [`LifecycleError::Closed`] if it has been closed.
	pub fn set_dispatch(&self, dispatch: Dispatch) -> Result<(), LifecycleError> {
		self.configure(|config| config.dispatch = dispatch)
	}

	/// Sets the callback invoked with each accepted connection.
	///
	/// It runs wherever the [dispatch strategy][Dispatch] puts it. If it is unset, accepted connections are simply closed.
	///
	/// # Errors
	///
	/// Same as [`set_dispatch`][Self::set_dispatch].
	pub fn set_on_accept<F>(&self, callback: F) -> Result<(), LifecycleError>
	where F: Fn(&Acceptor<L>, L::Connection) + Send + Sync + 'static {
		self.configure(|config| config.on_accept = Some(Arc::new(callback)))
	}

	/// Sets the callback invoked on the accept loop thread when accepting a connection fails.
	///
	/// If it is unset, the error is logged at error level and the loop continues.
	///
	/// # Errors
	///
	/// Same as [`set_dispatch`][Self::set_dispatch].
	pub fn set_on_accept_error<F>(&self, callback: F) -> Result<(), LifecycleError>
	where F: Fn(&Acceptor<L>, io::Error) + Send + Sync + 'static {
		self.configure(|config| config.on_accept_error = Some(Arc::new(callback)))
	}

	/// Sets the callback invoked on the accept loop thread each time an accept times out without a connection.
	///
	/// # Errors
	///
	/// Same as [`set_dispatch`][Self::set_dispatch].
	pub fn set_on_accept_timeout<F>(&self, callback: F) -> Result<(), LifecycleError>
	where F: Fn(&Acceptor<L>) + Send + Sync + 'static {
		self.configure(|config| config.on_accept_timeout = Some(Arc::new(callback)))
	}

	/// Unsets all three callbacks.
	///
	/// # Errors
	///
	/// Same as [`set_dispatch`][Self::set_dispatch].
	pub fn clear_callbacks(&self) -> Result<(), LifecycleError> {
		self.configure(|config| {
			config.on_accept = None;
			config.on_accept_error = None;
			config.on_accept_timeout = None;
		})
	}

	/// Starts the accept loop on a new thread.
	///
	/// The dispatch strategy and callbacks in effect now are the ones the loop uses until it is stopped.
	///
	/// The returned `Completion` is fulfilled as soon as the loop begins. That means it is trying to accept connections, not that any connection has been accepted yet.
	///
	/// # Errors
	///
	/// * [`LifecycleError::AlreadyRunning`] if the acceptor is running or still stopping. The running loop is not affected.
	/// * [`LifecycleError::Closed`] if the acceptor has been closed.
	/// * [`LifecycleError::SpawnLoop`] if the thread could not be spawned. The acceptor stays idle.
	pub fn start(&self) -> Result<Completion, LifecycleError> {
		let mut control = self.inner.control.lock();

		match control.state {
			AcceptorState::Idle => {},
			AcceptorState::Running | AcceptorState::Stopping => return Err(LifecycleError::AlreadyRunning),
			AcceptorState::Closed => return Err(LifecycleError::Closed),
		}

		let started = Completion::new();
		let stopped = Completion::new();
		let config = control.config.clone();

		// The loop's first state check waits for `control` to be unlocked, by which time the state is `Running`.
		thread::Builder::new()
		.name("acceptor".into())
		.spawn({
			let acceptor = self.clone();
			let started = started.clone();
			let stopped = stopped.clone();
			move || acceptor.run(config, started, stopped)
		})
		.map_err(|error| LifecycleError::SpawnLoop { error })?;

		control.state = AcceptorState::Running;
		control.stop_signal = stopped;

		tracing::debug!("acceptor started");

		Ok(started)
	}

	/// Asks the accept loop to exit.
	///
	/// This does not wait. The loop notices the request the next time an accept returns, which happens at least once per accept timeout. The returned `Completion` is fulfilled once the loop has exited; after that, no more callbacks are invoked from the loop thread and [`is_running`][Self::is_running] is false.
	///
	/// Work already handed off to another thread by the dispatch strategy is neither cancelled nor waited for.
	///
	/// Calling this again while the acceptor is still stopping returns the same `Completion`.
	///
	/// Don't [wait][Completion::wait] for the returned `Completion` from a callback running on the loop thread; the loop cannot exit until that callback returns.
	///
	/// # Errors
	///
	/// [`LifecycleError::NotRunning`] if the acceptor is idle, or [`LifecycleError::Closed`] if it has been closed.
	pub fn stop(&self) -> Result<Completion, LifecycleError> {
		let mut control = self.inner.control.lock();

		match control.state {
			AcceptorState::Running => {
				control.state = AcceptorState::Stopping;
				tracing::debug!("acceptor stopping");
			},
			AcceptorState::Stopping => {},
			AcceptorState::Idle => return Err(LifecycleError::NotRunning),
			AcceptorState::Closed => return Err(LifecycleError::Closed),
		}

		Ok(control.stop_signal.clone())
	}

	/// Stops the acceptor (if it is running), waits for the accept loop to exit, and then drops the listener.
	///
	/// Afterward, the acceptor is in the [`Closed`][AcceptorState::Closed] state and cannot be started again. Closing an already closed acceptor does nothing.
	///
	/// This cannot fail. A running loop is stopped the same way [`stop`][Self::stop] stops it.
	///
	/// Don't call this from a callback running on the loop thread; it would wait forever for the loop to exit.
	pub fn close(&self) {
		loop {
			let stopped = {
				let mut control = self.inner.control.lock();

				match control.state {
					AcceptorState::Closed => return,

					AcceptorState::Idle => {
						control.state = AcceptorState::Closed;
						break;
					},

					AcceptorState::Running | AcceptorState::Stopping => {
						control.state = AcceptorState::Stopping;
						control.stop_signal.clone()
					},
				}
			};

			stopped.wait();
		}

		// The loop has exited and released its read lock by now.
		drop(self.inner.listener.write().take());

		tracing::debug!("acceptor closed");
	}

	fn run(&self, config: Config<L>, started: Completion, stopped: Completion) {
		started.complete();

		{
			let listener = self.inner.listener.read();

			while self.inner.control.lock().state == AcceptorState::Running {
				let Some(listener) = listener.as_ref() else { break };

				let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
					self.accept_one(listener, &config)
				}));

				if outcome.is_err() {
					tracing::error!("panic in accept loop; continuing");
				}
			}
		}

		self.inner.control.lock().state = AcceptorState::Idle;

		tracing::debug!("acceptor stopped");

		stopped.complete();
	}

	fn accept_one(&self, listener: &L, config: &Config<L>) {
		match listener.accept() {
			Ok(connection) => {
				let acceptor = self.clone();
				let on_accept = config.on_accept.clone();

				let job: Job = Box::new(move || {
					if let Some(on_accept) = on_accept {
						on_accept(&acceptor, connection);
					}
				});

				if let Err(error) = config.dispatch.run(job) {
					tracing::error!(%error, "couldn't dispatch accepted connection");
				}
			},

			Err(AcceptError::TimedOut) => {
				tracing::trace!("accept timed out");

				if let Some(on_accept_timeout) = &config.on_accept_timeout {
					on_accept_timeout(self);
				}
			},

			Err(AcceptError::Io { error }) => match &config.on_accept_error {
				Some(on_accept_error) => on_accept_error(self, error),
				None => tracing::error!(%error, "error on accept"),
			},
		}
	}
}

#[cfg(test)]
use {
	crate::WorkerPool,
	assert_matches::assert_matches,
	std::{
		sync::atomic::{AtomicUsize, Ordering},
		time::Instant,
	},
};

/// A listener that never has a connection.
#[cfg(test)]
struct EmptyListener;

#[cfg(test)]
impl Listener for EmptyListener {
	type Connection = ();

	fn accept(&self) -> Result<(), AcceptError> {
		thread::sleep(Duration::from_millis(5));
		Err(AcceptError::TimedOut)
	}
}

/// A listener with a fixed number of connections waiting, after which it only times out.
#[cfg(test)]
struct BacklogListener {
	pending: AtomicUsize,
}

#[cfg(test)]
impl Listener for BacklogListener {
	type Connection = ();

	fn accept(&self) -> Result<(), AcceptError> {
		match self.pending.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
			Ok(_) => Ok(()),
			Err(_) => {
				thread::sleep(Duration::from_millis(5));
				Err(AcceptError::TimedOut)
			},
		}
	}
}

#[test]
fn test_lifecycle_states() {
	let acceptor = Acceptor::new(EmptyListener);
	assert_eq!(acceptor.state(), AcceptorState::Idle);
	assert!(!acceptor.is_running());

	let started = acceptor.start().unwrap();
	assert!(acceptor.is_running());
	assert!(started.wait_timeout(Duration::from_secs(5)));

	assert_matches!(acceptor.start(), Err(LifecycleError::AlreadyRunning));
	assert_matches!(acceptor.set_dispatch(Dispatch::SpawnPerConnection), Err(LifecycleError::AlreadyRunning));

	let stopped = acceptor.stop().unwrap();
	assert!(stopped.wait_timeout(Duration::from_secs(5)));
	assert_eq!(acceptor.state(), AcceptorState::Idle);

	assert_matches!(acceptor.stop(), Err(LifecycleError::NotRunning));

	acceptor.close();
	assert_eq!(acceptor.state(), AcceptorState::Closed);
	assert!(acceptor.listener().is_none());
	assert_matches!(acceptor.start(), Err(LifecycleError::Closed));
	assert_matches!(acceptor.set_on_accept(|_, ()| {}), Err(LifecycleError::Closed));
	acceptor.close();
}

#[test]
fn test_fresh_signals_per_cycle() {
	let acceptor = Acceptor::new(EmptyListener);

	let first_stop = {
		acceptor.start().unwrap().wait();
		let stopped = acceptor.stop().unwrap();
		stopped.wait();
		stopped
	};

	acceptor.start().unwrap().wait();
	let second_stop = acceptor.stop().unwrap();

	// Stopping twice yields the same signal.
	let second_stop_again = acceptor.stop().unwrap();

	assert!(first_stop.is_complete());
	assert!(second_stop.wait_timeout(Duration::from_secs(5)));
	assert!(second_stop_again.is_complete());
}

#[test]
fn test_timeout_callback_can_stop() {
	let acceptor = Acceptor::new(EmptyListener);
	let timeouts = Arc::new(AtomicUsize::new(0));

	acceptor.set_on_accept_timeout({
		let timeouts = timeouts.clone();
		move |acceptor| {
			if timeouts.fetch_add(1, Ordering::SeqCst) == 2 {
				acceptor.stop().unwrap();
			}
		}
	}).unwrap();

	acceptor.start().unwrap();

	// Wait for the loop to stop itself, without holding our own stop signal.
	let deadline = Instant::now() + Duration::from_secs(5);
	while acceptor.is_running() && Instant::now() < deadline {
		thread::sleep(Duration::from_millis(5));
	}

	assert!(!acceptor.is_running());
	assert_eq!(timeouts.load(Ordering::SeqCst), 3);
}

#[test]
fn test_close_while_running() {
	let acceptor = Acceptor::new(EmptyListener);
	acceptor.start().unwrap().wait();

	acceptor.close();

	assert_eq!(acceptor.state(), AcceptorState::Closed);
	assert!(acceptor.listener().is_none());
}

#[test]
fn test_dispatch_failure_does_not_end_loop() {
	let acceptor = Acceptor::with_dispatch(
		BacklogListener { pending: AtomicUsize::new(2) },
		Dispatch::FixedPool(WorkerPool::closed()),
	);

	let accepted = Arc::new(AtomicUsize::new(0));
	let timeouts = Arc::new(AtomicUsize::new(0));

	acceptor.set_on_accept({
		let accepted = accepted.clone();
		move |_, ()| {
			accepted.fetch_add(1, Ordering::SeqCst);
		}
	}).unwrap();

	acceptor.set_on_accept_timeout({
		let timeouts = timeouts.clone();
		move |_| {
			timeouts.fetch_add(1, Ordering::SeqCst);
		}
	}).unwrap();

	acceptor.start().unwrap().wait();

	// Timeouts only happen once both waiting connections have been accepted and failed to dispatch.
	let deadline = Instant::now() + Duration::from_secs(5);
	while timeouts.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
		thread::sleep(Duration::from_millis(5));
	}

	assert!(timeouts.load(Ordering::SeqCst) >= 2);
	assert!(acceptor.is_running());
	assert_eq!(acceptor.listener().unwrap().pending.load(Ordering::SeqCst), 0);
	assert_eq!(accepted.load(Ordering::SeqCst), 0);

	assert!(acceptor.stop().unwrap().wait_timeout(Duration::from_secs(5)));
}

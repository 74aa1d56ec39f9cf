use parking_lot::{Condvar, Mutex};
use std::{
	future::Future,
	pin::Pin,
	sync::Arc,
	task::{Context, Poll, Waker},
	time::{Duration, Instant},
};

#[cfg(doc)]
use crate::Acceptor;

/// A one-shot signal that a lifecycle transition of an [`Acceptor`] has happened.
///
/// [`Acceptor::start`] and [`Acceptor::stop`] each return one of these. It can be waited on from a blocking thread with [`wait`][Self::wait] or [`wait_timeout`][Self::wait_timeout], or `.await`ed from async code.
///
/// Clones share the same signal. Once completed, a `Completion` stays completed.
#[derive(Clone, Debug, Default)]
pub struct Completion {
	shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
	state: Mutex<State>,
	condvar: Condvar,
}

#[derive(Debug, Default)]
struct State {
	complete: bool,
	wakers: Vec<Waker>,
}

impl Completion {
	pub(crate) fn new() -> Self {
		Self::default()
	}

	/// Fulfills the signal, waking everything waiting on it. Does nothing if it is already complete.
	pub(crate) fn complete(&self) {
		let wakers = {
			let mut state = self.shared.state.lock();

			if state.complete {
				return;
			}

			state.complete = true;
			std::mem::take(&mut state.wakers)
		};

		self.shared.condvar.notify_all();

		for waker in wakers {
			waker.wake();
		}
	}

	/// Whether the transition has happened yet.
	pub fn is_complete(&self) -> bool {
		self.shared.state.lock().complete
	}

	/// Blocks the current thread until the transition has happened.
	pub fn wait(&self) {
		let mut state = self.shared.state.lock();

		while !state.complete {
			self.shared.condvar.wait(&mut state);
		}
	}

	/// Blocks the current thread until the transition has happened, or until `timeout` elapses.
	///
	/// Returns true if the transition happened, or false if the timeout elapsed first.
	pub fn wait_timeout(&self, timeout: Duration) -> bool {
		let Some(deadline) = Instant::now().checked_add(timeout) else {
			self.wait();
			return true;
		};

		let mut state = self.shared.state.lock();

		while !state.complete {
			if self.shared.condvar.wait_until(&mut state, deadline).timed_out() {
				return state.complete;
			}
		}

		true
	}
}

impl Future for Completion {
	type Output = ();

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
		let mut state = self.shared.state.lock();

		if state.complete {
			return Poll::Ready(());
		}

		if !state.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
			state.wakers.push(cx.waker().clone());
		}

		Poll::Pending
	}
}

#[cfg(test)]
use std::{
	sync::atomic::{AtomicUsize, Ordering},
	task::Wake,
	thread,
};

#[test]
fn test_wait_for_other_thread() {
	let completion = Completion::new();
	assert!(!completion.is_complete());

	let thread = thread::spawn({
		let completion = completion.clone();
		move || {
			thread::sleep(Duration::from_millis(20));
			completion.complete();
		}
	});

	completion.wait();
	assert!(completion.is_complete());

	thread.join().unwrap();
}

#[test]
fn test_wait_timeout() {
	let completion = Completion::new();

	assert!(!completion.wait_timeout(Duration::from_millis(20)));

	completion.complete();
	completion.complete();

	assert!(completion.wait_timeout(Duration::from_millis(20)));
	assert!(completion.wait_timeout(Duration::ZERO));
}

#[test]
fn test_poll_wakes_once_complete() {
	struct CountingWaker(AtomicUsize);

	impl Wake for CountingWaker {
		fn wake(self: Arc<Self>) {
			self.0.fetch_add(1, Ordering::SeqCst);
		}
	}

	let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
	let waker = Waker::from(counter.clone());
	let mut cx = Context::from_waker(&waker);

	let mut completion = Completion::new();

	assert!(Pin::new(&mut completion).poll(&mut cx).is_pending());
	assert!(Pin::new(&mut completion).poll(&mut cx).is_pending());
	assert_eq!(counter.0.load(Ordering::SeqCst), 0);

	completion.complete();

	// Registered only once, despite being polled twice.
	assert_eq!(counter.0.load(Ordering::SeqCst), 1);
	assert!(Pin::new(&mut completion).poll(&mut cx).is_ready());
}

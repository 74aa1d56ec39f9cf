use assert_matches::assert_matches;
use parking_lot::Mutex;
use socket_acceptor::{
	errors::{AcceptError, LifecycleError},
	Acceptor,
	AcceptorState,
	Dispatch,
	Listener,
};
use std::{
	collections::VecDeque,
	io::{self, Read, Write},
	net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream},
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc,
		Barrier,
	},
	thread,
	time::{Duration, Instant},
};

const TIMEOUT: Duration = Duration::from_millis(50);
const PATIENCE: Duration = Duration::from_secs(5);

fn localhost() -> SocketAddr {
	(Ipv4Addr::LOCALHOST, 0).into()
}

/// Polls `condition` until it is true or [`PATIENCE`] runs out.
fn eventually(condition: impl Fn() -> bool) -> bool {
	let deadline = Instant::now() + PATIENCE;

	while Instant::now() < deadline {
		if condition() {
			return true;
		}

		thread::sleep(Duration::from_millis(5));
	}

	condition()
}

#[test]
fn round_trip() {
	let acceptor = Acceptor::bind(&localhost(), TIMEOUT).unwrap();
	let address = acceptor.local_addr().unwrap();

	let accepted = Arc::new(Mutex::new(Vec::<SocketAddr>::new()));

	acceptor.set_on_accept({
		let accepted = accepted.clone();
		move |_, connection| {
			accepted.lock().push(connection.peer_addr().unwrap());
		}
	}).unwrap();

	assert!(acceptor.start().unwrap().wait_timeout(PATIENCE));

	let client = TcpStream::connect(address).unwrap();

	let deadline = Instant::now() + Duration::from_millis(200);
	while accepted.lock().is_empty() && Instant::now() < deadline {
		thread::sleep(Duration::from_millis(5));
	}

	assert_eq!(*accepted.lock(), [client.local_addr().unwrap()]);

	assert!(acceptor.stop().unwrap().wait_timeout(PATIENCE));
	assert!(!acceptor.is_running());
}

#[test]
fn echo_over_pool() {
	let acceptor = Acceptor::bind(&localhost(), TIMEOUT).unwrap();
	let address = acceptor.local_addr().unwrap();

	acceptor.set_dispatch(Dispatch::fixed_pool(2).unwrap()).unwrap();
	acceptor.set_on_accept(|_, mut connection| {
		let mut buf = Vec::new();
		connection.read_to_end(&mut buf).unwrap();

		for byte in &mut buf {
			*byte = byte.wrapping_add(1);
		}

		connection.write_all(&buf).unwrap();
	}).unwrap();

	acceptor.start().unwrap().wait();

	let clients: Vec<_> = (0..4).map(|_| thread::spawn(move || {
		let mut socket = TcpStream::connect(address).unwrap();
		socket.write_all(b"Hello, world!").unwrap();
		socket.shutdown(Shutdown::Write).unwrap();

		let mut reply = Vec::new();
		socket.read_to_end(&mut reply).unwrap();
		reply
	})).collect();

	for client in clients {
		assert_eq!(client.join().unwrap(), b"Ifmmp-!xpsme\"");
	}

	acceptor.close();
}

#[test]
fn start_while_running() {
	let acceptor = Acceptor::bind(&localhost(), TIMEOUT).unwrap();
	let address = acceptor.local_addr().unwrap();
	let accepted = Arc::new(AtomicUsize::new(0));

	acceptor.set_on_accept({
		let accepted = accepted.clone();
		move |_, _| {
			accepted.fetch_add(1, Ordering::SeqCst);
		}
	}).unwrap();

	acceptor.start().unwrap().wait();

	assert_matches!(acceptor.start(), Err(LifecycleError::AlreadyRunning));
	assert_eq!(acceptor.state(), AcceptorState::Running);

	// The original loop is still accepting.
	let _client = TcpStream::connect(address).unwrap();
	assert!(eventually(|| accepted.load(Ordering::SeqCst) == 1));

	acceptor.stop().unwrap().wait();
}

#[test]
fn stop_while_idle() {
	let acceptor = Acceptor::bind(&localhost(), TIMEOUT).unwrap();

	assert_matches!(acceptor.stop(), Err(LifecycleError::NotRunning));
	assert_eq!(acceptor.state(), AcceptorState::Idle);
}

#[test]
fn reconfigure_while_running() {
	let acceptor = Acceptor::bind(&localhost(), TIMEOUT).unwrap();
	acceptor.start().unwrap().wait();

	assert_matches!(acceptor.set_dispatch(Dispatch::SpawnPerConnection), Err(LifecycleError::AlreadyRunning));
	assert_matches!(acceptor.set_on_accept_timeout(|_| {}), Err(LifecycleError::AlreadyRunning));
	assert_matches!(acceptor.clear_callbacks(), Err(LifecycleError::AlreadyRunning));

	acceptor.stop().unwrap().wait();

	acceptor.set_dispatch(Dispatch::SpawnPerConnection).unwrap();
	acceptor.clear_callbacks().unwrap();
}

#[test]
fn restart_many_times() {
	let acceptor = Acceptor::bind(&localhost(), TIMEOUT).unwrap();
	let address = acceptor.local_addr().unwrap();
	let accepted = Arc::new(AtomicUsize::new(0));

	acceptor.set_on_accept({
		let accepted = accepted.clone();
		move |_, _| {
			accepted.fetch_add(1, Ordering::SeqCst);
		}
	}).unwrap();

	for round in 1..=3 {
		assert!(acceptor.start().unwrap().wait_timeout(PATIENCE));

		let _client = TcpStream::connect(address).unwrap();
		assert!(eventually(|| accepted.load(Ordering::SeqCst) == round));

		assert!(acceptor.stop().unwrap().wait_timeout(PATIENCE));
		assert!(!acceptor.is_running());
	}
}

#[test]
fn no_callbacks_after_stop() {
	let acceptor = Acceptor::bind(&localhost(), TIMEOUT).unwrap();
	let timeouts = Arc::new(AtomicUsize::new(0));

	acceptor.set_on_accept_timeout({
		let timeouts = timeouts.clone();
		move |_| {
			timeouts.fetch_add(1, Ordering::SeqCst);
		}
	}).unwrap();

	acceptor.start().unwrap().wait();
	assert!(eventually(|| timeouts.load(Ordering::SeqCst) >= 1));

	acceptor.stop().unwrap().wait();
	assert!(!acceptor.is_running());

	let after_stop = timeouts.load(Ordering::SeqCst);
	thread::sleep(TIMEOUT * 3);
	assert_eq!(timeouts.load(Ordering::SeqCst), after_stop);
}

#[test]
fn timeout_rate() {
	let acceptor = Acceptor::bind(&localhost(), TIMEOUT).unwrap();
	let timeouts = Arc::new(AtomicUsize::new(0));

	acceptor.set_on_accept_timeout({
		let timeouts = timeouts.clone();
		move |_| {
			timeouts.fetch_add(1, Ordering::SeqCst);
		}
	}).unwrap();

	acceptor.start().unwrap().wait();
	thread::sleep(TIMEOUT * 6);

	let stop_requested = Instant::now();
	let stopped = acceptor.stop().unwrap();
	let count = timeouts.load(Ordering::SeqCst);

	// Roughly one timeout per period, with generous slack for a busy test machine.
	assert!((2..=7).contains(&count), "{count} timeouts in 6 periods");

	// The loop exits within one more timeout period.
	assert!(stopped.wait_timeout(TIMEOUT * 10));
	assert!(stop_requested.elapsed() < TIMEOUT * 10);
}

#[test]
fn close_running() {
	let acceptor = Acceptor::bind(&localhost(), TIMEOUT).unwrap();
	let address = acceptor.local_addr().unwrap();

	acceptor.start().unwrap().wait();
	acceptor.close();

	assert!(!acceptor.is_running());
	assert_eq!(acceptor.state(), AcceptorState::Closed);
	assert!(acceptor.listener().is_none());
	assert_matches!(acceptor.local_addr(), Err(error) if error.kind() == io::ErrorKind::NotConnected);
	assert_matches!(acceptor.start(), Err(LifecycleError::Closed));
	assert_matches!(acceptor.stop(), Err(LifecycleError::Closed));

	// Nothing is listening there anymore.
	assert_matches!(
		TcpStream::connect(address),
		Err(error) if error.kind() == io::ErrorKind::ConnectionRefused
	);

	// Closing again is harmless.
	acceptor.close();
}

#[test]
fn stop_from_callback() {
	let acceptor = Acceptor::bind(&localhost(), TIMEOUT).unwrap();
	let address = acceptor.local_addr().unwrap();

	acceptor.set_on_accept(|acceptor, _| {
		acceptor.stop().unwrap();
	}).unwrap();

	acceptor.start().unwrap().wait();

	let _client = TcpStream::connect(address).unwrap();
	assert!(eventually(|| !acceptor.is_running()));
}

#[test]
fn synchronous_callback_panic_does_not_kill_loop() {
	let acceptor = Acceptor::bind(&localhost(), TIMEOUT).unwrap();
	let address = acceptor.local_addr().unwrap();
	let accepted = Arc::new(AtomicUsize::new(0));

	acceptor.set_on_accept({
		let accepted = accepted.clone();
		move |_, _| {
			if accepted.fetch_add(1, Ordering::SeqCst) == 0 {
				panic!("first connection panics");
			}
		}
	}).unwrap();

	acceptor.start().unwrap().wait();

	let _first = TcpStream::connect(address).unwrap();
	assert!(eventually(|| accepted.load(Ordering::SeqCst) == 1));

	let _second = TcpStream::connect(address).unwrap();
	assert!(eventually(|| accepted.load(Ordering::SeqCst) == 2));

	assert!(acceptor.stop().unwrap().wait_timeout(PATIENCE));
}

#[test]
fn spawn_per_connection_runs_concurrently() {
	let acceptor = Acceptor::bind(&localhost(), TIMEOUT).unwrap();
	let address = acceptor.local_addr().unwrap();

	// Both callbacks must be running at once to get past the barrier.
	let barrier = Arc::new(Barrier::new(2));
	let done = Arc::new(AtomicUsize::new(0));

	acceptor.set_dispatch(Dispatch::SpawnPerConnection).unwrap();
	acceptor.set_on_accept({
		let barrier = barrier.clone();
		let done = done.clone();
		move |_, _| {
			barrier.wait();
			done.fetch_add(1, Ordering::SeqCst);
		}
	}).unwrap();

	acceptor.start().unwrap().wait();

	let _first = TcpStream::connect(address).unwrap();
	let _second = TcpStream::connect(address).unwrap();
	assert!(eventually(|| done.load(Ordering::SeqCst) == 2));

	acceptor.stop().unwrap().wait();
}

/// A listener that plays back a script of accept outcomes, then times out forever.
struct ScriptedListener {
	script: Mutex<VecDeque<Result<usize, AcceptError>>>,
}

impl ScriptedListener {
	fn new(script: impl IntoIterator<Item = Result<usize, AcceptError>>) -> Self {
		Self {
			script: Mutex::new(script.into_iter().collect()),
		}
	}
}

impl Listener for ScriptedListener {
	type Connection = usize;

	fn accept(&self) -> Result<usize, AcceptError> {
		let next = self.script.lock().pop_front();

		next.unwrap_or_else(|| {
			thread::sleep(Duration::from_millis(5));
			Err(AcceptError::TimedOut)
		})
	}
}

fn injected_error() -> AcceptError {
	io::Error::new(io::ErrorKind::Other, "injected failure").into()
}

#[test]
fn synchronous_order() {
	const N: usize = 20;

	let acceptor = Acceptor::new(ScriptedListener::new((0..N).map(Ok)));
	let order = Arc::new(Mutex::new(Vec::new()));
	let in_callback = Arc::new(AtomicBool::new(false));

	acceptor.set_on_accept({
		let order = order.clone();
		let in_callback = in_callback.clone();
		move |_, connection| {
			assert!(!in_callback.swap(true, Ordering::SeqCst), "callbacks overlapped");
			thread::sleep(Duration::from_millis(1));
			order.lock().push(connection);
			in_callback.store(false, Ordering::SeqCst);
		}
	}).unwrap();

	acceptor.start().unwrap().wait();
	assert!(eventually(|| order.lock().len() == N));
	acceptor.stop().unwrap().wait();

	assert_eq!(*order.lock(), (0..N).collect::<Vec<_>>());
}

#[test]
fn unhandled_accept_error_does_not_kill_loop() {
	let acceptor = Acceptor::new(ScriptedListener::new([
		Err(injected_error()),
		Err(injected_error()),
		Ok(7),
	]));

	let accepted = Arc::new(Mutex::new(Vec::new()));

	acceptor.set_on_accept({
		let accepted = accepted.clone();
		move |_, connection| accepted.lock().push(connection)
	}).unwrap();

	acceptor.start().unwrap().wait();
	assert!(eventually(|| *accepted.lock() == [7]));
	assert!(acceptor.is_running());

	acceptor.stop().unwrap().wait();
}

#[test]
fn accept_error_callback() {
	let acceptor = Acceptor::new(ScriptedListener::new([
		Err(injected_error()),
		Err(AcceptError::TimedOut),
		Err(injected_error()),
	]));

	let errors = Arc::new(Mutex::new(Vec::new()));

	acceptor.set_on_accept_error({
		let errors = errors.clone();
		move |_, error| errors.lock().push(error.to_string())
	}).unwrap();

	acceptor.start().unwrap().wait();
	assert!(eventually(|| errors.lock().len() == 2));
	acceptor.stop().unwrap().wait();

	assert_eq!(*errors.lock(), ["injected failure", "injected failure"]);
}

#[test]
fn loop_thread_callback_panics_do_not_kill_loop() {
	let acceptor = Acceptor::new(ScriptedListener::new([
		Err(injected_error()),
		Err(AcceptError::TimedOut),
		Ok(3),
	]));

	let errors = Arc::new(AtomicUsize::new(0));
	let timeouts = Arc::new(AtomicUsize::new(0));
	let accepted = Arc::new(Mutex::new(Vec::new()));

	acceptor.set_on_accept_error({
		let errors = errors.clone();
		move |_, _| {
			errors.fetch_add(1, Ordering::SeqCst);
			panic!("error callback panics");
		}
	}).unwrap();

	acceptor.set_on_accept_timeout({
		let timeouts = timeouts.clone();
		move |_| {
			if timeouts.fetch_add(1, Ordering::SeqCst) == 0 {
				panic!("timeout callback panics");
			}
		}
	}).unwrap();

	acceptor.set_on_accept({
		let accepted = accepted.clone();
		move |_, connection| accepted.lock().push(connection)
	}).unwrap();

	acceptor.start().unwrap().wait();
	assert!(eventually(|| !accepted.lock().is_empty()));
	assert!(acceptor.is_running());

	assert!(acceptor.stop().unwrap().wait_timeout(PATIENCE));

	assert_eq!(*accepted.lock(), [3]);
	assert_eq!(errors.load(Ordering::SeqCst), 1);
	assert!(timeouts.load(Ordering::SeqCst) >= 1);
}

#[test]
fn unset_callbacks_are_harmless() {
	let acceptor = Acceptor::new(ScriptedListener::new([
		Ok(1),
		Err(injected_error()),
		Err(AcceptError::TimedOut),
		Ok(2),
	]));

	acceptor.start().unwrap().wait();
	assert!(eventually(|| acceptor.listener().unwrap().script.lock().is_empty()));
	assert!(acceptor.is_running());

	assert!(acceptor.stop().unwrap().wait_timeout(PATIENCE));
}

use crate::{
	errors::{
		AcceptError,
		OpenListenerError,
	},
	sys,
};
use socket2::Socket;
use std::{
	io,
	net::{TcpListener, TcpStream},
	time::Duration,
};

#[cfg(doc)]
use crate::Acceptor;

/// The accept timeout used when none is specified: 5 seconds.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_millis(5000);

/// A listening socket that an [`Acceptor`] accepts connections from.
///
/// Implementations must return from [`accept`][Self::accept] within a bounded amount of time, with [`AcceptError::TimedOut`] if no connection arrived. That timeout is what lets the accept loop notice a stop request, so an implementation that blocks indefinitely makes its acceptor impossible to stop.
///
/// This crate implements it for [`TimedListener`]. Other implementations are mostly useful for tests.
pub trait Listener: Send + Sync + 'static {
	/// The type of an accepted connection. This is passed unmodified to the acceptor's on-accept callback.
	type Connection: Send + 'static;

	/// Waits a bounded amount of time for a connection, and accepts it.
	fn accept(&self) -> Result<Self::Connection, AcceptError>;
}

/// A TCP listening socket with an accept timeout.
///
/// This dereferences to the underlying [`socket2::Socket`], which can be used to inspect or adjust the socket. The socket is in non-blocking mode; don't change that, or [`accept`][Listener::accept] may block past its timeout.
#[derive(Debug, derive_more::Deref)]
pub struct TimedListener {
	#[deref]
	socket: Socket,
	accept_timeout: Duration,
}

impl TimedListener {
	/// Wraps an already bound and listening socket.
	///
	/// The socket is put into non-blocking mode, so that a connection that disappears between the readiness wait and the `accept` call cannot block the accept loop.
	///
	///
	/// # Errors
	///
	/// [`OpenListenerError::ZeroAcceptTimeout`] if `accept_timeout` is zero, or [`OpenListenerError::SetNonBlocking`] if the socket couldn't be put into non-blocking mode.
	pub fn new(
		socket: impl Into<Socket>,
		accept_timeout: Duration,
	) -> Result<Self, OpenListenerError> {
		if accept_timeout.is_zero() {
			return Err(OpenListenerError::ZeroAcceptTimeout);
		}

		let socket: Socket = socket.into();

		socket.set_nonblocking(true)
		.map_err(|error| OpenListenerError::SetNonBlocking { error })?;

		Ok(Self { socket, accept_timeout })
	}

	/// The amount of time each [`accept`][Listener::accept] call waits for a connection.
	pub fn accept_timeout(&self) -> Duration {
		self.accept_timeout
	}

	/// The address that this listener is bound to.
	///
	/// This is useful when the listener was bound to port 0, to find out which port the operating system picked.
	pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
		self.socket.local_addr()?
		.as_socket()
		.ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "listening socket is not an IP socket"))
	}

	/// Unwraps the underlying socket.
	pub fn into_inner(self) -> Socket {
		self.socket
	}
}

impl TryFrom<TcpListener> for TimedListener {
	type Error = OpenListenerError;

	/// Wraps a standard library listener, with the [default accept timeout][DEFAULT_ACCEPT_TIMEOUT].
	fn try_from(listener: TcpListener) -> Result<Self, Self::Error> {
		Self::new(listener, DEFAULT_ACCEPT_TIMEOUT)
	}
}

impl Listener for TimedListener {
	type Connection = TcpStream;

	fn accept(&self) -> Result<TcpStream, AcceptError> {
		if !sys::wait_readable(&self.socket, self.accept_timeout)? {
			return Err(AcceptError::TimedOut);
		}

		let (connection, _) = match self.socket.accept() {
			Ok(accepted) => accepted,

			// The pending connection went away (for example, it was reset by the peer) between the readiness wait and now.
			Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Err(AcceptError::TimedOut),

			Err(error) => return Err(error.into()),
		};

		// On some platforms, accepted sockets inherit non-blocking mode from the listener.
		connection.set_nonblocking(false)?;

		Ok(connection.into())
	}
}

#[cfg(test)]
use {
	assert_matches::assert_matches,
	std::{
		net::Ipv4Addr,
		time::Instant,
	},
};

#[test]
fn test_zero_timeout_rejected() {
	let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();

	assert_matches!(
		TimedListener::new(listener, Duration::ZERO),
		Err(OpenListenerError::ZeroAcceptTimeout)
	);
}

#[test]
fn test_accept_times_out() {
	let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
	let listener = TimedListener::new(listener, Duration::from_millis(50)).unwrap();

	let started = Instant::now();

	assert_matches!(listener.accept(), Err(AcceptError::TimedOut));
	assert!(started.elapsed() >= Duration::from_millis(40));
}

#[test]
fn test_accept_connection() {
	let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
	let listener = TimedListener::try_from(listener).unwrap();
	assert_eq!(listener.accept_timeout(), DEFAULT_ACCEPT_TIMEOUT);

	let address = listener.local_addr().unwrap();
	let client = TcpStream::connect(address).unwrap();

	let connection = listener.accept().unwrap();
	assert_eq!(connection.peer_addr().unwrap(), client.local_addr().unwrap());

	// The accepted connection must be in blocking mode: a read with nothing to read waits out its timeout instead of failing immediately.
	connection.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
	let started = Instant::now();
	let mut buf = [0u8; 1];
	assert!(io::Read::read(&mut &connection, &mut buf).is_err());
	assert!(started.elapsed() >= Duration::from_millis(40));
}

use crate::{
	errors::OpenListenerError,
	TimedListener,
};
use socket2::Socket;
use std::{
	ffi::c_int,
	net::SocketAddr,
	time::Duration,
};

/// The backlog of pending connections for sockets opened by [`open_listener`].
pub const DEFAULT_LISTEN_BACKLOG: c_int = 128;

/// Opens a TCP listening socket bound to the given address, with the given accept timeout.
///
///
/// # Example
///
/// ```no_run
/// use socket_acceptor::Listener;
/// use std::time::Duration;
///
/// # fn example_fn() -> Result<(), Box<dyn std::error::Error>> {
/// let listener = socket_acceptor::open_listener(
/// 	&"127.0.0.1:0".parse()?,
/// 	Duration::from_millis(500),
/// )?;
///
/// println!("listening on {}", listener.local_addr()?);
///
/// // Wait up to half a second for a connection.
/// match listener.accept() {
/// 	Ok(connection) => println!("accepted {}", connection.peer_addr()?),
/// 	Err(error) => println!("{error}"),
/// }
/// #
/// # Ok(())
/// # }
/// ```
///
///
/// # Socket options
///
/// On Unix-like platforms, `SO_REUSEADDR` is set before binding, so that a server can be restarted while connections from its previous run are still in the `TIME_WAIT` state. It is not set on Windows, where it has a different and much less safe meaning.
pub fn open_listener(
	address: &SocketAddr,
	accept_timeout: Duration,
) -> Result<TimedListener, OpenListenerError> {
	if accept_timeout.is_zero() {
		return Err(OpenListenerError::ZeroAcceptTimeout);
	}

	let address = socket2::SockAddr::from(*address);

	let socket: Socket =
		Socket::new(address.domain(), socket2::Type::STREAM, Some(socket2::Protocol::TCP))
		.map_err(|error| OpenListenerError::CreateSocket { error })?;

	#[cfg(unix)]
	socket.set_reuse_address(true)
	.map_err(|error| OpenListenerError::SetSockOpt {
		option: "SO_REUSEADDR",
		error,
	})?;

	socket.bind(&address)
	.map_err(|error| OpenListenerError::Bind { error })?;

	socket.listen(DEFAULT_LISTEN_BACKLOG)
	.map_err(|error| OpenListenerError::Listen { error })?;

	TimedListener::new(socket, accept_timeout)
}

#[cfg(test)]
use {
	assert_matches::assert_matches,
	std::net::{Ipv4Addr, TcpListener},
};

#[test]
fn test_open_ephemeral_port() {
	let listener = open_listener(
		&(Ipv4Addr::LOCALHOST, 0).into(),
		Duration::from_millis(50),
	).unwrap();

	let address = listener.local_addr().unwrap();
	assert_eq!(address.ip(), Ipv4Addr::LOCALHOST);
	assert_ne!(address.port(), 0);
	assert_eq!(listener.accept_timeout(), Duration::from_millis(50));
}

#[test]
fn test_open_address_in_use() {
	let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();

	assert_matches!(
		open_listener(&taken.local_addr().unwrap(), Duration::from_millis(50)),
		Err(OpenListenerError::Bind { .. })
	);
}

#[test]
fn test_open_zero_timeout() {
	assert_matches!(
		open_listener(&(Ipv4Addr::LOCALHOST, 0).into(), Duration::ZERO),
		Err(OpenListenerError::ZeroAcceptTimeout)
	);
}

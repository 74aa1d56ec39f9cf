//! Various errors that can be raised by this library.

use std::{
	io,
	num::ParseIntError,
};

#[cfg(doc)]
use {
	crate::{
		open_listener,
		Acceptor,
		AcceptorOptions,
		Dispatch,
		DispatchMode,
		Listener,
		TimedListener,
	},
	std::str::FromStr,
};

/// The outcome of a failed [`Listener::accept`].
///
/// A timeout is not really an error. It only gives control back to the accept loop every so often, so that it can notice a stop request.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AcceptError {
	/// No connection arrived within the listener's accept timeout.
	#[error("timed out waiting for a connection")]
	TimedOut,

	/// Accepting a connection failed.
	#[error("couldn't accept a connection: {error}")]
	#[non_exhaustive]
	Io {
		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},
}

impl From<io::Error> for AcceptError {
	fn from(error: io::Error) -> Self {
		Self::Io { error }
	}
}

/// An error that occurred in [opening][open_listener()] a [`TimedListener`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum OpenListenerError {
	/// [`socket2::Socket::new`] failed.
	#[error("couldn't create socket: {error}")]
	#[non_exhaustive]
	CreateSocket {
		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},

	/// There was an error setting a socket option.
	#[error("couldn't set socket option `{option}`: {error}")]
	#[non_exhaustive]
	SetSockOpt {
		/// The name of the socket option, such as `SO_REUSEADDR`.
		option: &'static str,

		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},

	/// There was an error binding the socket to its address.
	#[error("couldn't bind the socket to its address: {error}")]
	#[non_exhaustive]
	Bind {
		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},

	/// There was an error setting the socket to listen for connections.
	#[error("couldn't listen on the socket: {error}")]
	#[non_exhaustive]
	Listen {
		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},

	/// There was an error putting the listening socket into non-blocking mode.
	#[error("couldn't put the socket into non-blocking mode: {error}")]
	#[non_exhaustive]
	SetNonBlocking {
		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},

	/// The accept timeout is zero.
	///
	/// An accept loop with no timeout never regains control while waiting for a connection, and so could never be stopped.
	#[error("the accept timeout must not be zero")]
	ZeroAcceptTimeout,
}

/// An error that occurred in creating a [`Dispatch`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DispatchError {
	/// A fixed worker pool was requested with zero workers.
	#[error("a worker pool must have at least one worker")]
	ZeroWorkers,

	/// There was an error spawning a worker thread.
	#[error("couldn't spawn worker thread: {error}")]
	#[non_exhaustive]
	SpawnWorker {
		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},
}

/// An error parsing a [`DispatchMode`] [from a string][FromStr].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum InvalidDispatchModeError {
	/// The dispatch mode did not fit one of the acceptable patterns.
	#[error("invalid dispatch mode: must be `sync`, `thread`, or `pool:n`")]
	Unrecognized,

	/// The dispatch mode is of the form <code>pool:<var>n</var></code>, but <code><var>n</var></code> could not be parsed as a worker count.
	#[error("invalid dispatch mode: it is of the form `pool:n`, but `n` is not a valid integer: {error}")]
	#[non_exhaustive]
	InvalidWorkerCount {
		#[source]
		error: ParseIntError,
	},
}

/// An error in controlling the lifecycle of an [`Acceptor`].
///
/// These are raised synchronously, to the caller of the method that caused them. They never affect an accept loop that is already running.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LifecycleError {
	/// The acceptor is already running (or is still stopping), so it cannot be started or reconfigured.
	#[error("the acceptor is already running")]
	AlreadyRunning,

	/// The acceptor is not running, so it cannot be stopped.
	#[error("the acceptor is not running")]
	NotRunning,

	/// The acceptor has been [closed][Acceptor::close], and its listener released.
	#[error("the acceptor is closed")]
	Closed,

	/// There was an error spawning the accept loop thread.
	#[error("couldn't spawn accept loop thread: {error}")]
	#[non_exhaustive]
	SpawnLoop {
		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},
}

/// An error that occurred in [opening][AcceptorOptions::open] an [`Acceptor`] from options.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum OpenAcceptorError {
	/// The listening socket could not be opened.
	#[error(transparent)]
	Listener(#[from] OpenListenerError),

	/// The configured dispatch strategy could not be set up.
	#[error(transparent)]
	Dispatch(#[from] DispatchError),
}

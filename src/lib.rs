//! This library accepts TCP connections on a dedicated thread and hands each one to a callback, run according to a configurable execution strategy.
//!
//! The accept loop is meant to be started, stopped, and restarted by the application as it sees fit. What happens to each connection is entirely up to the application's callback; this library never reads from or writes to a connection.
//!
//!
//! # Usage
//!
//! The entry point of this library is the [`Acceptor`] type. Create one from an address with [`Acceptor::bind`] (or from [`AcceptorOptions`], which can come from the command line or a configuration file), set its callbacks, and [start][Acceptor::start] it:
//!
//! ```no_run
//! use socket_acceptor::{Acceptor, Dispatch};
//! use std::{io::Write, time::Duration};
//!
//! # fn example_fn() -> Result<(), Box<dyn std::error::Error>> {
//! let acceptor = Acceptor::bind(&"127.0.0.1:8080".parse()?, Duration::from_millis(500))?;
//!
//! acceptor.set_dispatch(Dispatch::SpawnPerConnection)?;
//! acceptor.set_on_accept(|_acceptor, mut connection| {
//! 	let _ = connection.write_all(b"Hello, world!\n");
//! })?;
//!
//! // Wait until the accept loop is running.
//! acceptor.start()?.wait();
//!
//! // Later: stop accepting, and release the socket.
//! acceptor.close();
//! #
//! # Ok(())
//! # }
//! ```
//!
//!
//! # Execution strategies
//!
//! Each accepted connection is handed to the on-accept callback by a [`Dispatch`] strategy: [on the accept loop thread][Dispatch::Synchronous], [on a new thread][Dispatch::SpawnPerConnection], or [on a fixed pool of worker threads][Dispatch::FixedPool].
//!
//!
//! # Stopping
//!
//! Stopping is cooperative. Each accept waits at most for the listener's accept timeout, after which the loop checks whether it has been asked to stop. A [stop][Acceptor::stop] therefore takes effect within one accept timeout, and returns a [`Completion`] rather than blocking the caller for that long.
//!
//!
//! # Logging
//!
//! This library emits [`tracing`] events: lifecycle transitions at debug level, accept timeouts at trace level, and accept errors (when no on-accept-error callback is set), dispatch failures, and caught panics at error level.
//!
//!
//! # Feature flags and platform support
//!
//! This library is based on [`socket2`], and should work on any platform that `socket2` works on, which as of this writing is Unix-like platforms and Windows.
#![cfg_attr(all(
	feature = "clap",
	feature = "serde",
), doc = r#"

## Available feature flags

This library has the following feature flags:

* `clap`: Support parsing acceptor options from the command line using [`clap`]. Specifically, this adds an implementation of [`clap::Args`] for [`AcceptorOptions`].
* `serde`: Support parsing acceptor options from configuration files or environment variables using [`serde`]. Specifically, this adds an implementation of [`serde::Deserialize`] to [`AcceptorOptions`] and [`DispatchMode`].
"#)]

#![allow(clippy::tabs_in_doc_comments)] // This project uses tabs for indentation throughout, including in documentation examples.

mod acceptor;
mod completion;
mod dispatch;
pub mod errors;
mod listener;
mod open;
mod options;
mod util;

pub use self::{
	acceptor::*,
	completion::*,
	dispatch::*,
	listener::*,
	open::*,
	options::*,
};

cfg_if::cfg_if! {
	if #[cfg(windows)] {
		#[path = "sys/windows.rs"] mod sys;
	}
	else {
		#[path = "sys/other.rs"] mod sys;
	}
}

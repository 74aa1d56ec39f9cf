use crate::{
	errors::OpenAcceptorError,
	open_listener,
	Acceptor,
	DispatchMode,
	TimedListener,
	DEFAULT_ACCEPT_TIMEOUT,
};
use std::{
	net::SocketAddr,
	time::Duration,
};

#[cfg(doc)]
use crate::Dispatch;

/// Options for opening an [`Acceptor`], supplied by the user of your application.
#[cfg_attr(feature = "serde", doc = r#"

This structure is suitable for deserializing with [`serde`], with one caveat: it is marked with the attribute `#[serde(deny_unknown_fields)]`, and therefore must not be referenced in a field marked `#[serde(flatten)]`.
"#)]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(default, deny_unknown_fields))]
#[non_exhaustive]
pub struct AcceptorOptions {
	/// How long each accept waits for a connection, in milliseconds. Default is 5000.
	///
	/// This also bounds how long it takes the acceptor to notice that it has been asked to stop. Zero is an error.
	#[cfg_attr(feature = "clap", arg(long))]
	pub accept_timeout_ms: Option<u64>,

	/// How accepted connections are handled: `sync` (one at a time, on the accepting thread), `thread` (a new thread for each), or <code>pool:<var>n</var></code> (a pool of <code><var>n</var></code> worker threads). Default is `sync`.
	#[cfg_attr(feature = "clap", arg(long))]
	pub dispatch: Option<DispatchMode>,
}

impl AcceptorOptions {
	/// The accept timeout, taking the default into account.
	pub fn accept_timeout(&self) -> Duration {
		self.accept_timeout_ms
		.map(Duration::from_millis)
		.unwrap_or(DEFAULT_ACCEPT_TIMEOUT)
	}

	/// The dispatch mode, taking the default into account.
	pub fn dispatch_mode(&self) -> DispatchMode {
		self.dispatch.unwrap_or_default()
	}

	/// Opens a TCP listening socket at the given address, and creates an idle [`Acceptor`] around it with the configured [`Dispatch`] strategy.
	///
	/// Callbacks still need to be set before the acceptor is started.
	pub fn open(&self, address: &SocketAddr) -> Result<Acceptor<TimedListener>, OpenAcceptorError> {
		let dispatch = self.dispatch_mode().build()?;
		let listener = open_listener(address, self.accept_timeout())?;

		Ok(Acceptor::with_dispatch(listener, dispatch))
	}
}

#[cfg(test)]
use {
	crate::{
		errors::OpenListenerError,
		Dispatch,
	},
	assert_matches::assert_matches,
	std::net::Ipv4Addr,
};

#[test]
fn test_defaults() {
	let options = AcceptorOptions::default();

	assert_eq!(options.accept_timeout(), Duration::from_millis(5000));
	assert_eq!(options.dispatch_mode(), DispatchMode::Synchronous);
}

#[test]
fn test_open() {
	let options = AcceptorOptions {
		accept_timeout_ms: Some(50),
		dispatch: Some("pool:2".parse().unwrap()),
	};

	let acceptor = options.open(&(Ipv4Addr::LOCALHOST, 0).into()).unwrap();

	let listener = acceptor.listener().unwrap();
	assert_eq!(listener.accept_timeout(), Duration::from_millis(50));
	drop(listener);

	let debug = format!("{acceptor:?}");
	assert!(debug.contains("FixedPool"), "{debug}");
	assert!(debug.contains("workers: 2"), "{debug}");
	assert_eq!(acceptor.state(), crate::AcceptorState::Idle);
	assert!(matches!(options.dispatch_mode().build(), Ok(Dispatch::FixedPool(_))));
}

#[test]
fn test_open_zero_timeout() {
	let options = AcceptorOptions {
		accept_timeout_ms: Some(0),
		dispatch: None,
	};

	assert_matches!(
		options.open(&(Ipv4Addr::LOCALHOST, 0).into()),
		Err(OpenAcceptorError::Listener(OpenListenerError::ZeroAcceptTimeout))
	);
}

#[cfg(feature = "serde")]
#[test]
fn test_deserialize() {
	let options: AcceptorOptions = serde_json::from_str(r#"{
		"accept_timeout_ms": 250,
		"dispatch": "pool:8"
	}"#).unwrap();

	assert_eq!(options.accept_timeout(), Duration::from_millis(250));
	assert_eq!(options.dispatch_mode().to_string(), "pool:8");

	let options: AcceptorOptions = serde_json::from_str("{}").unwrap();
	assert_eq!(options, AcceptorOptions::default());

	assert!(serde_json::from_str::<AcceptorOptions>(r#"{ "backlog": 5 }"#).is_err());
	assert!(serde_json::from_str::<AcceptorOptions>(r#"{ "dispatch": "pool:0" }"#).is_err());
}

#[cfg(feature = "clap")]
#[test]
fn test_command_line() {
	#[derive(clap::Parser)]
	struct CommandLine {
		#[command(flatten)]
		options: AcceptorOptions,
	}

	let command_line = <CommandLine as clap::Parser>::try_parse_from([
		"test",
		"--accept-timeout-ms", "100",
		"--dispatch", "thread",
	]).unwrap();

	assert_eq!(command_line.options.accept_timeout(), Duration::from_millis(100));
	assert_eq!(command_line.options.dispatch_mode(), DispatchMode::SpawnPerConnection);
}

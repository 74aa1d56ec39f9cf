use anyhow::Context as _;
use socket_acceptor::AcceptorOptions;
use std::{
	io::{self, Read, Write},
	net::{SocketAddr, TcpStream},
};

/// A simple echo server that accepts TCP connections and echoes back all bytes to clients, incremented by one. Press Enter to stop it.
#[derive(clap::Parser)]
struct CommandLine {
	#[command(flatten)]
	options: AcceptorOptions,

	/// The address to listen on, such as `127.0.0.1:27910`.
	address: SocketAddr,
}

fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
	.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
	.init();

	// Parse the command line options.
	let command_line = <CommandLine as clap::Parser>::parse();

	// Open the listening socket and set up the dispatch strategy.
	let acceptor =
		command_line.options.open(&command_line.address)
		.context("couldn't open acceptor")?;

	acceptor.set_on_accept(|_, connection| echo(connection))?;
	acceptor.set_on_accept_error(|_, error| {
		tracing::warn!(%error, "couldn't accept a connection");
	})?;

	// Start accepting connections.
	acceptor.start()?.wait();

	tracing::info!(
		address = %acceptor.local_addr()?,
		dispatch = %command_line.options.dispatch_mode(),
		"listening",
	);

	// Run until Enter (or end of input).
	let mut line = String::new();
	io::stdin().read_line(&mut line).context("couldn't read standard input")?;

	acceptor.close();

	Ok(())
}

fn echo(mut connection: TcpStream) {
	let mut buf = [0u8; 1024];

	loop {
		// Read some bytes from the client.
		let bytes_read = match connection.read(&mut buf) {
			Ok(0) => break,
			Ok(n) => n,
			Err(error) => {
				tracing::warn!(%error, "error reading from client");
				break
			}
		};

		// Take a slice of the buffer, containing just the bytes that were read.
		let buf = &mut buf[..bytes_read];

		// Increment each byte by one.
		for byte in &mut *buf {
			*byte = byte.wrapping_add(1);
		}

		// Echo the bytes back.
		if let Err(error) = connection.write_all(buf) {
			tracing::warn!(%error, "error writing to client");
			break;
		}
	}
}

use socket2::Socket;
use std::{
	ffi::c_int,
	io,
	os::fd::AsRawFd,
	time::Duration,
};

/// Waits until `socket` has a pending connection, or until `timeout` elapses.
///
/// Returns `Ok(true)` if the socket is readable and `Ok(false)` on timeout. An interrupted wait is reported as a timeout, so that the caller regains control and can try again.
pub fn wait_readable(socket: &Socket, timeout: Duration) -> io::Result<bool> {
	let mut pollfd = libc::pollfd {
		fd: socket.as_raw_fd(),
		events: libc::POLLIN,
		revents: 0,
	};

	let ready = unsafe {
		// Safety: `pollfd` is a valid, exclusively borrowed array of one `pollfd` structure, and the file descriptor in it stays open for the duration of the call.
		libc::poll(&mut pollfd, 1, poll_timeout_ms(timeout))
	};

	match ready {
		-1 => {
			let error = io::Error::last_os_error();

			if error.kind() == io::ErrorKind::Interrupted {
				Ok(false)
			}
			else {
				Err(error)
			}
		},
		0 => Ok(false),
		_ => Ok(true),
	}
}

fn poll_timeout_ms(timeout: Duration) -> c_int {
	crate::util::timeout_ms(timeout)
	.try_into()
	.unwrap_or(c_int::MAX)
}

use socket2::Socket;
use std::{
	io,
	os::windows::io::AsRawSocket,
	time::Duration,
};
use windows_sys::Win32::Networking::WinSock::{
	POLLRDNORM,
	SOCKET_ERROR,
	WSAPOLLFD,
	WSAPoll,
};

/// Waits until `socket` has a pending connection, or until `timeout` elapses.
///
/// Returns `Ok(true)` if the socket is readable and `Ok(false)` on timeout.
pub fn wait_readable(socket: &Socket, timeout: Duration) -> io::Result<bool> {
	let mut pollfd = WSAPOLLFD {
		fd: socket.as_raw_socket() as _,
		events: POLLRDNORM as _,
		revents: 0,
	};

	let timeout: i32 =
		crate::util::timeout_ms(timeout)
		.try_into()
		.unwrap_or(i32::MAX);

	let ready = unsafe {
		// Safety: `pollfd` is a valid, exclusively borrowed array of one `WSAPOLLFD` structure, and the socket in it stays open for the duration of the call.
		WSAPoll(&mut pollfd, 1, timeout)
	};

	match ready {
		SOCKET_ERROR => Err(io::Error::last_os_error()),
		0 => Ok(false),
		_ => Ok(true),
	}
}

//! Listening and outbound stream-socket support for the reactor.
//!
//! Established connections (both accepted and outbound) are handed to callers
//! as plain [`crate::Io`]`<TcpStream>` values, so writes, partial-write
//! queueing and framing all reuse the existing stream machinery; this module
//! only adds what `Io` doesn't already cover: listening and nonblocking
//! connect.

use std::net::{SocketAddr, TcpListener, TcpStream};

use collections::bytes::Slice;
use log::error;
use stakker::Fwd;
use utils::error::Result;

use crate::sys::AsRawFd;
use crate::Io;

/// A bound, listening TCP socket. Each accepted connection is delivered raw;
/// the caller is expected to wrap it in [`Io::new`] to start reading from it.
pub struct Listener {
	inner: TcpListener,
}

impl Listener {
	pub fn bind(addr: SocketAddr, fwd: Fwd<TcpStream>) -> Result<Self> {
		let inner = TcpListener::bind(addr).map_err(|err| error!("Failed to bind TCP listener to {addr}: {err}"))?;

		inner.set_nonblocking(true).map_err(|err| error!("Failed to set TCP listener nonblocking: {err}"))?;

		crate::register_listener(&inner, fwd);

		Ok(Self { inner })
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		self.inner.local_addr().map_err(|err| error!("Failed to read local TCP address: {err}"))
	}
}

impl Drop for Listener {
	fn drop(&mut self) {
		crate::unregister(&self.inner);
	}
}

/// Begins a nonblocking outbound TCP connection to `addr`. `fwd` receives
/// incoming bytes once the connection completes; a connection that never
/// completes (refused, timed out, or dropped first) never calls `fwd` at all,
/// so callers relying on a response within a deadline must track that with
/// their own timer rather than waiting on this forwarder.
pub fn connect(addr: SocketAddr, fwd: Fwd<Slice>) -> Result<Io<TcpStream>> {
	let stream = new_nonblocking_stream(addr)?;

	crate::register_connecting(&stream, fwd);

	// Safety valve: `Io` normally registers on construction, but this socket
	// is already registered (in `Connecting` mode, promoted to `Stream` in
	// place once the handshake completes). `Io::from_registered` just holds
	// the fd without touching the reactor tables again.
	Ok(Io::from_registered(stream))
}

#[cfg(unix)]
fn new_nonblocking_stream(addr: SocketAddr) -> Result<TcpStream> {
	use std::os::fd::FromRawFd;

	let domain = if addr.is_ipv6() { libc::AF_INET6 } else { libc::AF_INET };

	let raw = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0) };
	if raw < 0 {
		error!("socket() failed: {}", std::io::Error::last_os_error());
		return Err(());
	}

	let stream = unsafe { TcpStream::from_raw_fd(raw) };

	let ret = match addr {
		SocketAddr::V4(a) => {
			let sa = to_sockaddr_in(a);
			unsafe { libc::connect(raw, &sa as *const _ as *const libc::sockaddr, std::mem::size_of_val(&sa) as u32) }
		}
		SocketAddr::V6(a) => {
			let sa = to_sockaddr_in6(a);
			unsafe { libc::connect(raw, &sa as *const _ as *const libc::sockaddr, std::mem::size_of_val(&sa) as u32) }
		}
	};

	if ret != 0 {
		let err = std::io::Error::last_os_error();
		if err.kind() != std::io::ErrorKind::WouldBlock && err.raw_os_error() != Some(libc::EINPROGRESS) {
			error!("connect() to {addr} failed: {err}");
			return Err(());
		}
	}

	Ok(stream)
}

#[cfg(windows)]
fn new_nonblocking_stream(addr: SocketAddr) -> Result<TcpStream> {
	error!("Outbound nonblocking TCP connect is not yet implemented on Windows (target {addr})");
	Err(())
}

#[cfg(unix)]
fn to_sockaddr_in(addr: std::net::SocketAddrV4) -> libc::sockaddr_in {
	libc::sockaddr_in {
		sin_family: libc::AF_INET as _,
		sin_port: addr.port().to_be(),
		sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(addr.ip().octets()) },
		sin_zero: [0; 8],
		#[cfg(target_os = "macos")]
		sin_len: 0,
	}
}

#[cfg(unix)]
fn to_sockaddr_in6(addr: std::net::SocketAddrV6) -> libc::sockaddr_in6 {
	libc::sockaddr_in6 {
		sin6_family: libc::AF_INET6 as _,
		sin6_port: addr.port().to_be(),
		sin6_flowinfo: addr.flowinfo(),
		sin6_addr: libc::in6_addr { s6_addr: addr.ip().octets() },
		sin6_scope_id: addr.scope_id(),
		#[cfg(target_os = "macos")]
		sin6_len: 0,
	}
}


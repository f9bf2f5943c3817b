//! Datagram socket support for the reactor.
//!
//! The existing [`crate::Io`] type only speaks connected-socket `recv`/`send`,
//! which is fine for a byte-stream tunnel interface but not for a UDP server
//! that needs the peer address of every datagram. This module registers a
//! bound, unconnected UDP socket with the same poll loop and delivers
//! `(SocketAddr, Slice)` pairs instead of bare bytes.

use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};

use collections::bytes::Slice;
use log::error;
use stakker::Fwd;
use utils::error::Result;

use crate::sys::{self, AsRawFd};

fn ret_to_err(val: isize) -> Result<Option<usize>> {
	match TryInto::<usize>::try_into(val) {
		Ok(n) => Ok(Some(n)),
		Err(_) => {
			let err = io::Error::last_os_error();

			if matches!(err.kind(), ErrorKind::WouldBlock) {
				return Ok(None);
			}

			error!("UDP socket operation failed: {err}");
			Err(())
		}
	}
}

/// A UDP socket registered with the reactor. Reads are delivered through the
/// `Fwd` supplied at construction; writes are fire-and-forget, appropriate for
/// DNS datagrams which are always small enough to not need queuing.
pub struct Socket {
	inner: UdpSocket,
}

impl Socket {
	/// Binds a nonblocking UDP socket to `addr` and registers it with the
	/// reactor. Every received datagram is delivered as `(peer, bytes)`.
	pub fn bind(addr: SocketAddr, fwd: Fwd<(SocketAddr, Slice)>) -> Result<Self> {
		let inner = UdpSocket::bind(addr).map_err(|err| error!("Failed to bind UDP socket to {addr}: {err}"))?;

		inner.set_nonblocking(true).map_err(|err| error!("Failed to set UDP socket nonblocking: {err}"))?;

		crate::register_dgram(&inner, fwd);

		Ok(Self { inner })
	}

	/// Binds to an ephemeral local port, for use as a client-only outbound
	/// socket (e.g. talking to upstream resolvers).
	pub fn bind_ephemeral(v6: bool, fwd: Fwd<(SocketAddr, Slice)>) -> Result<Self> {
		let addr = if v6 { "[::]:0".parse().unwrap() } else { "0.0.0.0:0".parse().unwrap() };
		Self::bind(addr, fwd)
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		self.inner.local_addr().map_err(|err| error!("Failed to read local UDP address: {err}"))
	}

	/// Sends `buf` to `peer`. A short write is treated as a failure (UDP has no
	/// partial-write semantics worth recovering from).
	#[cfg(unix)]
	pub fn send_to(&self, peer: SocketAddr, buf: &[u8]) -> Result<bool> {
		let raw = sys::as_raw(&self.inner);

		let ret = unsafe {
			match peer {
				SocketAddr::V4(a) => {
					let sa = to_sockaddr_in(a);
					sys::sendto(raw, buf.as_ptr() as *const _, buf.len(), 0, &sa as *const _ as *const sys::sockaddr, std::mem::size_of_val(&sa) as sys::socklen_t)
				}
				SocketAddr::V6(a) => {
					let sa = to_sockaddr_in6(a);
					sys::sendto(raw, buf.as_ptr() as *const _, buf.len(), 0, &sa as *const _ as *const sys::sockaddr, std::mem::size_of_val(&sa) as sys::socklen_t)
				}
			}
		};

		if let Some(n) = ret_to_err(ret as isize)? {
			if n != buf.len() {
				error!("Only sent {n}/{} bytes in UDP datagram to {peer}", buf.len());
				return Err(());
			}
			Ok(true)
		} else {
			Ok(false)
		}
	}

	// TODO: build WinSock SOCKADDR_IN/SOCKADDR_IN6 values and route through
	// sys::sendto the same way the unix path does above.
	#[cfg(windows)]
	pub fn send_to(&self, peer: SocketAddr, _buf: &[u8]) -> Result<bool> {
		error!("UDP datagram transmission is not yet implemented on Windows (peer {peer})");
		Err(())
	}
}

#[cfg(unix)]
fn to_sockaddr_in(addr: std::net::SocketAddrV4) -> sys::sockaddr_in {
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
fn to_sockaddr_in6(addr: std::net::SocketAddrV6) -> sys::sockaddr_in6 {
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

impl Drop for Socket {
	fn drop(&mut self) {
		crate::unregister(&self.inner);
	}
}

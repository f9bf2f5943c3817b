//! Thin glue between the real OS socket layer (`runtime::udp`, `runtime::tcp`)
//! and this crate's dual-stack binding needs. The reactor-level mechanics
//! (nonblocking I/O, `Fwd`-based delivery, partial-write queueing) all live in
//! `runtime`; this module only knows about "bind both families" and "frame a
//! TCP stream with a 2-byte length prefix", which are specific to this
//! server's needs rather than general reactor plumbing.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use collections::bytes::Slice;
use log::warn;
use stakker::Fwd;
use utils::error::Result;

pub mod tls;

/// Binds UDP port 53 on both families, tolerating a v6 bind failure (some
/// hosts have IPv6 disabled entirely), matching the original server's
/// startup tolerance.
pub fn bind_dual_stack_udp(port: u16, fwd: Fwd<(SocketAddr, Slice)>) -> Result<(runtime::udp::Socket, Option<runtime::udp::Socket>)> {
	let v4 = runtime::udp::Socket::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port), fwd.clone())?;

	let v6 = match runtime::udp::Socket::bind(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port), fwd) {
		Ok(sock) => Some(sock),
		Err(()) => {
			warn!("Failed to bind IPv6 UDP socket on port {port}; continuing with IPv4 only");
			None
		}
	};

	Ok((v4, v6))
}

/// Binds a TCP listener on both families, with the same v6-failure tolerance.
pub fn bind_dual_stack_tcp(port: u16, fwd: Fwd<std::net::TcpStream>) -> Result<(runtime::tcp::Listener, Option<runtime::tcp::Listener>)> {
	let v4 = runtime::tcp::Listener::bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port), fwd.clone())?;

	let v6 = match runtime::tcp::Listener::bind(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port), fwd) {
		Ok(listener) => Some(listener),
		Err(()) => {
			warn!("Failed to bind IPv6 TCP listener on port {port}; continuing with IPv4 only");
			None
		}
	};

	Ok((v4, v6))
}

/// Prefixes `msg` with its 2-byte big-endian length, per RFC 1035 §4.2.2. If
/// the message exceeds 65535 bytes, the caller is expected to have already
/// truncated it and set the Truncated bit, per `write_tcp`.
pub fn frame(msg: &[u8]) -> Vec<u8> {
	debug_assert!(msg.len() <= u16::MAX as usize);

	let mut framed = Vec::with_capacity(msg.len() + 2);
	framed.extend_from_slice(&(msg.len() as u16).to_be_bytes());
	framed.extend_from_slice(msg);
	framed
}

/// Splits complete length-prefixed frames out of `buf`, returning the
/// leftover unconsumed tail (to be prepended to the next read), mirroring the
/// original server's `bufferedBytes` reassembly loop.
pub fn split_frames(buf: &[u8]) -> (Vec<&[u8]>, &[u8]) {
	let mut frames = Vec::new();
	let mut rest = buf;

	loop {
		if rest.len() < 2 {
			break;
		}

		let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;

		if rest.len() < 2 + len {
			break;
		}

		frames.push(&rest[2..2 + len]);
		rest = &rest[2 + len..];
	}

	(frames, rest)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn split_frames_leaves_partial_tail() {
		let a = frame(b"hello");
		let mut buf = a.clone();
		buf.extend_from_slice(&[0, 5, b'w', b'o']);

		let (frames, rest) = split_frames(&buf);
		assert_eq!(frames, vec![b"hello".as_slice()]);
		assert_eq!(rest, &[0, 5, b'w', b'o']);
	}
}

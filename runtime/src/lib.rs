extern crate alloc;

use alloc::collections::VecDeque;
use core::cell::RefCell;
use core::net::SocketAddr;
use core::time::Duration;
use std::io::{self, ErrorKind};

use collections::bytes::{Cursor, Slice};
use log::error;
use stakker::Fwd;

mod rt;
pub mod tcp;
pub mod time;
pub mod udp;

pub use rt::*;

#[cfg(target_family = "unix")]
pub(crate) mod sys {
	pub use std::os::fd::{AsRawFd, RawFd};

	pub use libc::{
		accept4, bind, c_void as BufType, connect, getsockopt, listen, poll, pollfd as Poll, recv, recvfrom, sendto, socklen_t, AF_INET, AF_INET6,
		SOCK_NONBLOCK, SOL_SOCKET, SO_ERROR, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT,
	};
	pub use libc::{send, sockaddr, sockaddr_in, sockaddr_in6};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_fd()
	}
}

#[cfg(target_family = "windows")]
pub(crate) mod sys {
	pub use std::os::windows::io::AsRawSocket as AsRawFd;

	pub use u8 as BufType;
	pub use windows_sys::Win32::Networking::WinSock::{
		accept, bind, connect, getsockopt, listen, recv, recvfrom, send, sendto, sockaddr as sockaddr_unused, WSAPoll as poll, AF_INET, AF_INET6,
		POLLERR, POLLHUP, POLLNVAL, POLLRDNORM as POLLIN, POLLWRNORM as POLLOUT, SOCKADDR as sockaddr, SOCKADDR_IN as sockaddr_in,
		SOCKADDR_IN6 as sockaddr_in6, SOCKET as RawFd, SOL_SOCKET, SO_ERROR, WSAPOLLFD as Poll,
	};

	pub type socklen_t = i32;

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_socket() as _
	}
}

pub use sys::AsRawFd;
use sys::*;
use utils::error::*;

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

fn ret_to_err(val: isize) -> Result<Option<usize>> {
	match TryInto::<usize>::try_into(val) {
		Ok(n) => Ok(Some(n)),
		Err(_) => {
			let err = io::Error::last_os_error();

			if matches!(err.kind(), ErrorKind::WouldBlock) {
				return Ok(None);
			}

			error!("I/O operation failed: {err}");
			Err(())
		}
	}
}

fn send(fd: RawFd, buf: &[u8]) -> Result<bool> {
	let r = unsafe { sys::send(fd, buf.as_ptr() as *mut BufType, buf.len() as _, 0) };

	if let Some(n) = ret_to_err(r as _)? {
		if n != buf.len() {
			error!("Only sent {}/{} bytes to socket", n, buf.len());
			return Err(());
		}

		Ok(true)
	} else {
		Ok(false)
	}
}

fn recv(fd: RawFd, buf: &mut Slice) -> Result<bool> {
	let r = unsafe { sys::recv(fd, buf.as_mut_ptr() as *mut BufType, buf.len() as _, 0) };

	if let Some(n) = ret_to_err(r as _)? {
		buf.truncate(n);
		Ok(true)
	} else {
		Ok(false)
	}
}

#[cfg(unix)]
fn decode_sockaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
	use core::net::{Ipv4Addr, Ipv6Addr};

	unsafe {
		match storage.ss_family as i32 {
			libc::AF_INET => {
				let sa = &*(storage as *const _ as *const sys::sockaddr_in);
				let ip = Ipv4Addr::from(u32::from_ne_bytes(sa.sin_addr.s_addr.to_ne_bytes()));
				Some(SocketAddr::new(ip.into(), u16::from_be(sa.sin_port)))
			}
			libc::AF_INET6 => {
				let sa = &*(storage as *const _ as *const sys::sockaddr_in6);
				Some(SocketAddr::new(Ipv6Addr::from(sa.sin6_addr.s6_addr).into(), u16::from_be(sa.sin6_port)))
			}
			_ => None,
		}
	}
}

/// Receives one datagram, returning the peer address alongside the payload.
#[cfg(unix)]
fn recvfrom(fd: RawFd, buf: &mut Slice) -> Result<Option<SocketAddr>> {
	let mut storage: libc::sockaddr_storage = unsafe { core::mem::zeroed() };
	let mut len: sys::socklen_t = core::mem::size_of::<libc::sockaddr_storage>() as _;

	let r = unsafe {
		sys::recvfrom(fd, buf.as_mut_ptr() as *mut BufType, buf.len() as _, 0, &mut storage as *mut _ as *mut sys::sockaddr, &mut len)
	};

	match ret_to_err(r as _)? {
		Some(n) => {
			buf.truncate(n);
			match decode_sockaddr(&storage) {
				Some(addr) => Ok(Some(addr)),
				None => {
					error!("Received datagram from unsupported address family");
					Err(())
				}
			}
		}
		None => Ok(None),
	}
}

// TODO: decode WinSock sockaddr storage the same way the unix path does above.
#[cfg(windows)]
fn recvfrom(_fd: RawFd, _buf: &mut Slice) -> Result<Option<SocketAddr>> {
	error!("UDP datagram reception is not yet implemented on Windows");
	Err(())
}

/// Accepts one pending connection from a listening socket, if any.
#[cfg(unix)]
fn accept_one(fd: RawFd) -> Result<Option<std::net::TcpStream>> {
	use std::os::fd::FromRawFd;

	let raw = unsafe { sys::accept4(fd, core::ptr::null_mut(), core::ptr::null_mut(), SOCK_NONBLOCK) };

	if raw >= 0 {
		Ok(Some(unsafe { std::net::TcpStream::from_raw_fd(raw) }))
	} else {
		let err = io::Error::last_os_error();
		if matches!(err.kind(), ErrorKind::WouldBlock) {
			Ok(None)
		} else {
			error!("accept() failed: {err}");
			Err(())
		}
	}
}

#[cfg(windows)]
fn accept_one(_fd: RawFd) -> Result<Option<std::net::TcpStream>> {
	error!("TCP listener support is not yet implemented on Windows");
	Err(())
}

/// Checks `SO_ERROR` on a socket whose nonblocking `connect()` just became
/// writable, the standard way to learn whether the connection succeeded.
#[cfg(unix)]
fn connect_succeeded(fd: RawFd) -> Result<bool> {
	let mut err: libc::c_int = 0;
	let mut len: sys::socklen_t = core::mem::size_of::<libc::c_int>() as _;

	let r = unsafe { sys::getsockopt(fd, SOL_SOCKET, SO_ERROR, &mut err as *mut _ as *mut BufType, &mut len) };

	if r != 0 {
		error!("getsockopt(SO_ERROR) failed: {}", io::Error::last_os_error());
		return Err(());
	}

	Ok(err == 0)
}

#[cfg(windows)]
fn connect_succeeded(_fd: RawFd) -> Result<bool> {
	error!("Outbound TCP connect completion is not yet implemented on Windows");
	Err(())
}

thread_local! {
	static GLOBAL: RefCell<State> = const {
		RefCell::new(State {
			fds: Vec::new(),
			entries: Vec::new()
		})
	};
}

struct State {
	fds: Vec<Poll>,
	entries: Vec<Entry>,
}

impl State {
	fn with<X, F: FnOnce(&mut Self) -> X>(f: F) -> X {
		GLOBAL.with(|x| f(&mut x.borrow_mut()))
	}

	fn idx_of<T: AsRawFd>(&mut self, socket: &T) -> usize {
		let raw = as_raw(socket);
		self.fds.iter().position(|f| f.fd == raw).expect("Socket is present")
	}

	/// Returns whether any more I/O is waiting.
	fn is_io(&self) -> bool {
		!self.fds.is_empty()
	}

	/// Logs a summary of registered file descriptors at shutdown.
	fn log_stats(&self) {
		log::debug!("reactor shutting down with {} registered fd(s)", self.fds.len());
	}

	/// Poll the fds. Returns whether any file descriptors are ready for I/O.
	fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
		let ret = unsafe {
			poll(
				self.fds.as_mut_ptr(),
				self.fds.len().try_into().expect("Fewer than u32::MAX fds"),
				as_timeout(timeout),
			)
		};

		let mut pending: u32 = ret.try_into().map_err(|_| error!("poll() failed: {}", io::Error::last_os_error()))?;

		if pending == 0 {
			return Ok(false);
		}

		for idx in 0.. {
			let Poll { fd, events, revents } = &mut self.fds[idx];
			let entry = &mut self.entries[idx];

			if *revents == 0 {
				continue;
			}

			if *revents & POLLERR != 0 {
				panic!("Socket error while polling");
			}

			if *revents & POLLHUP != 0 {
				panic!("Socket hangup");
			}

			if *revents & POLLNVAL != 0 {
				panic!("Socket invalid");
			}

			if *revents & POLLIN != 0 {
				entry.flush_read(*fd)?;
			}

			if *revents & POLLOUT != 0 {
				entry.flush_write(*fd)?;
			};

			*events = POLLIN;

			if !entry.queue.is_empty() {
				*events |= POLLOUT;
			}

			*revents = 0;

			pending -= 1;

			if pending == 0 {
				break;
			}
		}

		Ok(true)
	}
}

/// The delivery mode of a registered file descriptor.
enum Kind {
	/// A connected byte stream (the original tunnel-interface mode).
	Stream(Fwd<Slice>),
	/// An unconnected datagram socket; deliveries carry the sender's address.
	Dgram(Fwd<(SocketAddr, Slice)>),
	/// A listening socket; each readiness delivers one accepted connection.
	Listener(Fwd<std::net::TcpStream>),
	/// An outbound stream socket whose nonblocking `connect()` hasn't resolved
	/// yet. Becomes `Stream` in place once the fd turns writable.
	Connecting(Fwd<Slice>),
}

struct Entry {
	kind: Kind,
	queue: VecDeque<Box<[u8]>>,
}

impl Entry {
	fn flush_read(&mut self, fd: RawFd) -> Result {
		match &mut self.kind {
			Kind::Stream(fwd) => {
				let mut buf = Slice::new(1500);

				while recv(fd, &mut buf)? {
					fwd.fwd(buf);
					buf = Slice::new(1500);
				}
			}
			Kind::Dgram(fwd) => loop {
				let mut buf = Slice::new(1500);

				match recvfrom(fd, &mut buf)? {
					Some(peer) => fwd.fwd((peer, buf)),
					None => break,
				}
			},
			Kind::Listener(fwd) => {
				while let Some(stream) = accept_one(fd)? {
					fwd.fwd(stream);
				}
			}
			Kind::Connecting(_) => {}
		}

		Ok(())
	}

	fn flush_write(&mut self, fd: RawFd) -> Result {
		if let Kind::Connecting(fwd) = &self.kind {
			let fwd = fwd.clone();

			return if connect_succeeded(fd)? {
				self.kind = Kind::Stream(fwd);
				Ok(())
			} else {
				error!("Outbound TCP connection failed");
				Err(())
			};
		}

		assert!(!self.queue.is_empty());

		loop {
			let Some(buf) = self.queue.back_mut() else { return Ok(()) };

			if !send(fd, buf)? {
				return Ok(());
			}

			self.queue.pop_back();
		}
	}
}

/// Registers `socket` with the reactor in datagram mode. Used by [`crate::udp::Socket`].
pub(crate) fn register_dgram<T: AsRawFd>(socket: &T, fwd: Fwd<(SocketAddr, Slice)>) {
	State::with(|i| {
		i.fds.push(Poll { fd: as_raw(socket), events: POLLIN, revents: 0 });
		i.entries.push(Entry { kind: Kind::Dgram(fwd), queue: VecDeque::new() });
	})
}

/// Registers a listening socket; each readiness delivers one accepted stream.
pub(crate) fn register_listener<T: AsRawFd>(socket: &T, fwd: Fwd<std::net::TcpStream>) {
	State::with(|i| {
		i.fds.push(Poll { fd: as_raw(socket), events: POLLIN, revents: 0 });
		i.entries.push(Entry { kind: Kind::Listener(fwd), queue: VecDeque::new() });
	})
}

/// Registers a nonblocking socket whose `connect()` is in progress. `fwd` is
/// handed off unchanged to the resulting [`Kind::Stream`] once connected, so
/// it should be the same data-delivery forwarder an [`Io::new`] caller would
/// have passed had the connection been synchronous.
pub(crate) fn register_connecting<T: AsRawFd>(socket: &T, fwd: Fwd<Slice>) {
	State::with(|i| {
		i.fds.push(Poll { fd: as_raw(socket), events: POLLOUT, revents: 0 });
		i.entries.push(Entry { kind: Kind::Connecting(fwd), queue: VecDeque::new() });
	})
}

/// Deregisters a socket previously registered with [`register_dgram`] or via [`Io::new`].
pub(crate) fn unregister<T: AsRawFd>(socket: &T) {
	State::with(|i| {
		let idx = i.idx_of(socket);
		i.entries.swap_remove(idx);
		i.fds.swap_remove(idx);
	})
}

pub struct Io<T: AsRawFd> {
	inner: T,
}

impl<T: AsRawFd> Io<T> {
	pub fn new(inner: T, fwd: Fwd<Slice>) -> Self {
		State::with(|i| {
			i.fds.push(Poll { fd: as_raw(&inner), events: POLLIN, revents: 0 });

			i.entries.push(Entry { kind: Kind::Stream(fwd), queue: VecDeque::new() });

			Self { inner }
		})
	}

	/// Wraps a socket that the reactor already has an entry for (e.g. one
	/// registered via [`register_connecting`], now promoted to `Stream` in
	/// place once its connect completed). Does not touch the reactor tables.
	pub(crate) fn from_registered(inner: T) -> Self {
		Self { inner }
	}

	pub fn write<X>(&self, f: impl FnOnce(Cursor) -> X) -> Result<X> {
		let mut vec = vec![0; 1500];
		let res = Cursor::vec(&mut vec, f);

		if !send(as_raw(&self.inner), &mut vec)? {
			State::with(|i| {
				let idx = i.idx_of(&self.inner);
				i.entries[idx].queue.push_front(vec.into_boxed_slice());
				i.fds[idx].events |= POLLOUT;
			});
		}

		Ok(res)
	}
}

impl<T: AsRawFd> Drop for Io<T> {
	fn drop(&mut self) {
		unregister(&self.inner);
	}
}

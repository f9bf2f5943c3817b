//! The forward engine: coalesces identical in-flight client queries into a
//! single upstream request, fails over between configured upstreams on
//! timeout or truncation-then-close, and escalates truncated UDP responses to
//! TCP before advancing to the next upstream.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use collections::bytes::Slice;
use log::{debug, info, warn};
use rand::Rng;
use rustls::ClientConfig;
use stakker::{fwd_to, Fwd, Ret, CX};
use utils::error::Result;

use crate::reqmap::{Cancel, ResponseMap};
use crate::socket::{self, tls};
use crate::wire::{self, Message};

const UDP_TIMEOUT: Duration = Duration::from_millis(250);
const TCP_TIMEOUT: Duration = Duration::from_millis(1000);
const RCODE_SERVER_FAILURE: u8 = 2;

/// A configured recursive resolver.
#[derive(Clone)]
pub struct Upstream {
	pub addr: SocketAddr,
	pub protocol: Protocol,
	/// SNI / certificate hostname, for `Protocol::Tls`.
	pub hostname: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
	/// Plain DNS: UDP first, escalating to TCP on truncation.
	Dns,
	/// DNS-over-TLS: TCP-only from the first attempt.
	Tls,
}

/// One client's pending reply, with the id it should be delivered under.
struct ReplyTarget {
	original_id: u16,
	deliver: Ret<Message>,
}

/// A single coalesced outstanding request, shared by every client that asked
/// an identical question while it was in flight.
struct ClientState {
	/// The original request with its id field zeroed for coalescing, rewritten
	/// with a fresh random id on every upstream attempt.
	request: Message,
	idx: usize,
	udp_exhausted: bool,
	/// Invalidates timers and in-flight replies armed for a prior attempt.
	generation: u64,
	replies: Vec<ReplyTarget>,
	dedupe_cancel: Option<Cancel<()>>,
	/// The token for this state's own entry in `Forward::inflight`, so the
	/// coalescing-key entry can be dropped the moment this state completes
	/// instead of lingering for the next unrelated query to collide with.
	inflight_cancel: Option<Cancel<Shared>>,
}

type Shared = Rc<RefCell<ClientState>>;

struct PendingUdp {
	state: Shared,
	generation: u64,
}

struct TcpConn {
	io: runtime::Io<TcpStream>,
	tls: Option<tls::Session>,
	buffered: Vec<u8>,
	/// Maps the freshly-generated id of an in-flight attempt back to its
	/// coalesced client state, scoped to this one upstream connection.
	pending: HashMap<u16, PendingUdp>,
}

/// Owns the client-facing upstream sockets and all in-flight forwarding state.
/// A sibling of the server dispatcher; the dispatcher hands it queries it
/// cannot answer itself and never touches its sockets directly.
pub struct Forward {
	upstreams: Vec<Upstream>,
	udp4: Option<runtime::udp::Socket>,
	udp6: Option<runtime::udp::Socket>,
	tcp: HashMap<usize, TcpConn>,
	tls_config: Arc<ClientConfig>,

	pending_udp: HashMap<u16, PendingUdp>,

	/// Coalescing map: (id=0, qtype, qname) -> shared client state.
	inflight: ResponseMap<Shared>,
	/// UDP dedupe guard: (id=0, peer-bytes, qtype, qname) -> ().
	dedupe: ResponseMap<()>,
}

impl Forward {
	pub fn init(cx: CX![], upstreams: Vec<Upstream>) -> Option<Self> {
		let actor = cx.access_actor().clone();
		let udp_fwd: Fwd<(SocketAddr, Slice)> = fwd_to!([actor], on_udp_response() as (SocketAddr, Slice));

		let udp4 = runtime::udp::Socket::bind_ephemeral(false, udp_fwd.clone()).ok();
		let udp6 = runtime::udp::Socket::bind_ephemeral(true, udp_fwd).ok();

		if udp4.is_none() && udp6.is_none() {
			warn!("Forward engine failed to bind any outbound UDP socket");
		}

		Some(Self {
			upstreams,
			udp4,
			udp6,
			tcp: HashMap::new(),
			tls_config: tls::client_config(),
			pending_udp: HashMap::new(),
			inflight: ResponseMap::new(),
			dedupe: ResponseMap::new(),
		})
	}

	/// Entry point from the dispatcher. `peer` is `None` for TCP/TLS clients
	/// (UDP dedup only applies to UDP retransmits).
	pub fn forward(&mut self, cx: CX![], peer: Option<&[u8]>, msg: Message, reply: Ret<Message>) -> Result {
		if msg.questions.is_empty() || !msg.header.rd {
			warn!("forward: no question, or recursion not desired");
			return Err(());
		}

		let mut key_msg = msg.clone();
		key_msg.header.id = 0;

		if let Some(peer) = peer {
			if self.dedupe.lookup(Some(peer), &key_msg).is_some() {
				debug!("forward: dropping retransmit from active peer");
				return Ok(());
			}
		}

		let original_id = msg.header.id;
		let deliver = Ret::new(move |mut reply_msg: Message| {
			reply_msg.header.id = original_id;
			reply.ret(reply_msg);
		});

		if let Some(shared) = self.inflight.lookup(None, &key_msg) {
			shared.borrow_mut().replies.push(ReplyTarget { original_id, deliver });

			if let Some(peer) = peer {
				shared.borrow_mut().dedupe_cancel = self.dedupe.insert(Some(peer), &key_msg, ()).ok();
			}

			return Ok(());
		}

		let dedupe_cancel = peer.and_then(|peer| self.dedupe.insert(Some(peer), &key_msg, ()).ok());

		let state = Rc::new(RefCell::new(ClientState {
			request: key_msg.clone(),
			idx: 0,
			udp_exhausted: false,
			generation: 0,
			replies: vec![ReplyTarget { original_id, deliver }],
			dedupe_cancel,
			inflight_cancel: None,
		}));

		let inflight_cancel = self.inflight.insert(None, &key_msg, state.clone()).ok();
		state.borrow_mut().inflight_cancel = inflight_cancel;

		self.try_forward(cx, state);

		Ok(())
	}

	/// Drives one attempt of the (idx, udp_exhausted) state machine.
	fn try_forward(&mut self, cx: CX![], state: Shared) {
		let idx = state.borrow().idx;

		if idx >= self.upstreams.len() {
			self.exhaust(state);
			return;
		}

		let upstream = self.upstreams[idx].clone();

		if upstream.protocol == Protocol::Tls {
			state.borrow_mut().udp_exhausted = true;
		}

		let generation = {
			let mut s = state.borrow_mut();
			s.generation += 1;
			s.generation
		};

		let mut request = state.borrow().request.clone();
		request.header.id = rand::thread_rng().gen();

		let Ok(buf) = wire::write(&request) else {
			warn!("forward: failed to serialize request for upstream {}", upstream.addr);
			self.advance(cx, state, generation);
			return;
		};

		let udp_exhausted = state.borrow().udp_exhausted;

		if !udp_exhausted {
			self.send_udp(&upstream, request.header.id, &buf, state.clone(), generation);
		} else {
			self.send_tcp(cx, idx, &upstream, request.header.id, &buf, state.clone(), generation);
		}

		self.arm_timeout(cx, state, generation, if udp_exhausted { TCP_TIMEOUT } else { UDP_TIMEOUT });
	}

	fn send_udp(&mut self, upstream: &Upstream, id: u16, buf: &[u8], state: Shared, generation: u64) {
		let socket = match upstream.addr {
			SocketAddr::V4(_) => self.udp4.as_ref(),
			SocketAddr::V6(_) => self.udp6.as_ref(),
		};

		let Some(socket) = socket else {
			warn!("forward: no outbound UDP socket for address family of {}", upstream.addr);
			return;
		};

		if socket.send_to(upstream.addr, buf).is_err() {
			warn!("forward: UDP send to {} failed", upstream.addr);
			return;
		}

		self.pending_udp.insert(id, PendingUdp { state, generation });
	}

	fn send_tcp(&mut self, cx: CX![], idx: usize, upstream: &Upstream, id: u16, buf: &[u8], state: Shared, generation: u64) {
		if !self.tcp.contains_key(&idx) && self.open_tcp(cx, idx, upstream).is_err() {
			return;
		}

		let framed = socket::frame(buf);

		let Some(conn) = self.tcp.get_mut(&idx) else { return };

		let outbound = match &mut conn.tls {
			Some(session) => match session.wrap_plaintext(&framed) {
				Ok(bytes) => bytes,
				Err(()) => {
					self.close_tcp(cx, idx);
					return;
				}
			},
			None => framed,
		};

		let _ = conn.io.write(|cur| cur.push(outbound.as_slice()));

		let Some(conn) = self.tcp.get_mut(&idx) else { return };
		conn.pending.insert(id, PendingUdp { state, generation });
	}

	fn open_tcp(&mut self, cx: CX![], idx: usize, upstream: &Upstream) -> Result {
		let actor = cx.access_actor().clone();
		let fwd: Fwd<Slice> = fwd_to!([actor], on_tcp_bytes(idx) as Slice);

		let io = runtime::tcp::connect(upstream.addr, fwd).map_err(|()| warn!("forward: TCP connect to {} failed", upstream.addr))?;

		let tls = if upstream.protocol == Protocol::Tls {
			let hostname = upstream.hostname.clone().unwrap_or_else(|| upstream.addr.ip().to_string());
			Some(tls::Session::new(self.tls_config.clone(), &hostname)?)
		} else {
			None
		};

		self.tcp.insert(idx, TcpConn { io, tls, buffered: Vec::new(), pending: HashMap::new() });

		Ok(())
	}

	fn arm_timeout(&mut self, cx: CX![], state: Shared, generation: u64, timeout: Duration) {
		let actor = cx.access_actor().clone();

		cx.after(timeout, move |s| {
			actor.apply(s, move |this, cx| this.on_timeout(cx, state, generation));
		});
	}

	fn on_timeout(&mut self, cx: CX![], state: Shared, generation: u64) {
		if state.borrow().generation != generation {
			return;
		}

		info!("forward: attempt timed out, advancing upstream");
		self.advance(cx, state, generation);
	}

	fn advance(&mut self, cx: CX![], state: Shared, generation: u64) {
		if state.borrow().generation != generation {
			return;
		}

		{
			let mut s = state.borrow_mut();
			s.idx += 1;
			s.udp_exhausted = false;
		}

		self.try_forward(cx, state);
	}

	fn escalate_to_tcp(&mut self, cx: CX![], state: Shared, generation: u64) {
		if state.borrow().generation != generation {
			return;
		}

		info!("forward: UDP response truncated, escalating to TCP");
		state.borrow_mut().udp_exhausted = true;
		self.try_forward(cx, state);
	}

	fn on_udp_response(&mut self, cx: CX![], _peer: SocketAddr, buf: Slice) {
		let Ok(msg) = wire::parse(&buf) else { return };
		let Some(PendingUdp { state, generation }) = self.pending_udp.remove(&msg.header.id) else { return };

		if state.borrow().generation != generation {
			return;
		}

		if msg.header.tc {
			self.escalate_to_tcp(cx, state, generation);
			return;
		}

		self.deliver(state, msg);
	}

	fn on_tcp_bytes(&mut self, cx: CX![], idx: usize, buf: Slice) {
		let Some(conn) = self.tcp.get_mut(&idx) else { return };
		conn.buffered.extend_from_slice(&buf);

		let plaintext = match &mut conn.tls {
			Some(session) => {
				let ciphertext = std::mem::take(&mut conn.buffered);
				match session.feed_ciphertext(&ciphertext) {
					Ok(p) => p,
					Err(()) => {
						self.close_tcp(cx, idx);
						return;
					}
				}
			}
			None => std::mem::take(&mut conn.buffered),
		};

		let Some(conn) = self.tcp.get_mut(&idx) else { return };
		conn.buffered.extend_from_slice(&plaintext);

		let (frame_bounds, tail_len) = {
			let (frames, rest) = socket::split_frames(&conn.buffered);
			let bounds: Vec<(usize, usize)> = frames.iter().map(|f| (offset_of(&conn.buffered, f), f.len())).collect();
			(bounds, rest.len())
		};

		let total = conn.buffered.len();
		let consumed = total - tail_len;
		let buffered = std::mem::take(&mut conn.buffered);

		for (start, len) in frame_bounds {
			let Ok(msg) = wire::parse(&buffered[start..start + len]) else { continue };
			let Some(conn) = self.tcp.get_mut(&idx) else { break };
			let Some(PendingUdp { state, generation }) = conn.pending.remove(&msg.header.id) else { continue };

			if msg.header.tc {
				self.advance(cx, state, generation);
				continue;
			}

			self.deliver(state, msg);
		}

		if let Some(conn) = self.tcp.get_mut(&idx) {
			conn.buffered = buffered[consumed..].to_vec();
		}
	}

	fn close_tcp(&mut self, cx: CX![], idx: usize) {
		let Some(conn) = self.tcp.remove(&idx) else { return };

		for PendingUdp { state, generation } in conn.pending.into_values() {
			self.advance(cx, state, generation);
		}
	}

	fn deliver(&mut self, state: Shared, msg: Message) {
		let (replies, dedupe_cancel, inflight_cancel) = {
			let mut s = state.borrow_mut();
			(std::mem::take(&mut s.replies), s.dedupe_cancel.take(), s.inflight_cancel.take())
		};

		for target in replies {
			target.deliver.ret(msg.clone());
		}

		if let Some(cancel) = dedupe_cancel {
			cancel.cancel();
		}

		if let Some(cancel) = inflight_cancel {
			cancel.cancel();
		}
	}

	fn exhaust(&mut self, state: Shared) {
		let (failure, replies, dedupe_cancel, inflight_cancel) = {
			let mut s = state.borrow_mut();
			let failure = s.request.error_reply(RCODE_SERVER_FAILURE);
			(failure, std::mem::take(&mut s.replies), s.dedupe_cancel.take(), s.inflight_cancel.take())
		};

		warn!("forward: all upstreams exhausted for {:?}", failure.questions.first().map(|q| &q.name));

		for target in replies {
			target.deliver.ret(failure.clone());
		}

		if let Some(cancel) = dedupe_cancel {
			cancel.cancel();
		}

		if let Some(cancel) = inflight_cancel {
			cancel.cancel();
		}
	}
}

fn offset_of(whole: &[u8], part: &[u8]) -> usize {
	part.as_ptr() as usize - whole.as_ptr() as usize
}

//! The server dispatcher: the single entry point for every inbound message,
//! whether a client query over UDP or TCP.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};

use collections::bytes::Slice;
use log::{debug, warn};
use stakker::{actor, fwd_to, ret_nop, ActorOwn, Fwd, Ret, CX};

use crate::cache::Cache;
use crate::forward::{Forward, Upstream};
use crate::hosts::Hosts;
use crate::socket;
use crate::wire::{self, Header, Message};

const RCODE_FORMAT_ERROR: u8 = 1;

struct TcpClient {
	io: runtime::Io<TcpStream>,
	buffered: Vec<u8>,
}

/// Owns the server-facing sockets, the cache, and the static hosts table; owns
/// the forward engine as a child actor and hands it anything it can't answer
/// itself.
pub struct Server {
	cache: Cache,
	hosts: Hosts,
	forward: ActorOwn<Forward>,

	udp4: Option<runtime::udp::Socket>,
	udp6: Option<runtime::udp::Socket>,
	tcp_clients: HashMap<usize, TcpClient>,
	next_tcp_id: usize,
}

impl Server {
	pub fn init(cx: CX![], upstreams: Vec<Upstream>, hosts: Hosts, negative_ttl: u32, udp_port: u16) -> Option<Self> {
		let forward = actor!(cx, Forward::init(upstreams), ret_nop!());

		let actor = cx.access_actor().clone();
		let udp_fwd: Fwd<(SocketAddr, Slice)> = fwd_to!([actor], on_client_udp() as (SocketAddr, Slice));

		let (udp4, udp6) = match socket::bind_dual_stack_udp(udp_port, udp_fwd) {
			Ok(socks) => socks,
			Err(()) => {
				warn!("Server failed to bind any client-facing UDP socket");
				(None, None)
			}
		};

		Some(Self { cache: Cache::new(negative_ttl), hosts, forward, udp4, udp6, tcp_clients: HashMap::new(), next_tcp_id: 0 })
	}

	/// Registers a freshly accepted TCP client connection, handed off by the
	/// process entry point's `runtime::tcp::Listener`.
	pub fn accept_tcp(&mut self, cx: CX![], stream: TcpStream) {
		let actor = cx.access_actor().clone();
		let id = self.next_tcp_id;
		self.next_tcp_id += 1;

		let fwd: Fwd<Slice> = fwd_to!([actor], on_client_tcp(id) as Slice);
		let io = runtime::Io::new(stream, fwd);

		self.tcp_clients.insert(id, TcpClient { io, buffered: Vec::new() });
	}

	fn on_client_udp(&mut self, cx: CX![], peer: SocketAddr, buf: Slice) {
		let actor = cx.access_actor().clone();
		let reply = Ret::new(move |msg: Message| {
			actor.defer(move |s| actor.apply(s, move |this, _cx| this.deliver_udp(peer, msg)));
		});

		let peer_key = peer_bytes(peer);
		self.handle_message(cx, &buf, Some(&peer_key), reply);
	}

	fn on_client_tcp(&mut self, cx: CX![], id: usize, buf: Slice) {
		let Some(client) = self.tcp_clients.get_mut(&id) else { return };
		client.buffered.extend_from_slice(&buf);

		let (frame_bounds, tail_len) = {
			let (frames, rest) = socket::split_frames(&client.buffered);
			let bounds: Vec<(usize, usize)> = frames.iter().map(|f| (offset_of(&client.buffered, f), f.len())).collect();
			(bounds, rest.len())
		};

		let consumed = client.buffered.len() - tail_len;
		let buffered = std::mem::take(&mut client.buffered);

		for (start, len) in frame_bounds {
			let frame = buffered[start..start + len].to_vec();
			let actor = cx.access_actor().clone();

			let reply = Ret::new(move |msg: Message| {
				actor.defer(move |s| actor.apply(s, move |this, _cx| this.deliver_tcp(id, msg)));
			});

			self.handle_message(cx, &frame, None, reply);
		}

		if let Some(client) = self.tcp_clients.get_mut(&id) {
			client.buffered = buffered[consumed..].to_vec();
		}
	}

	fn on_tcp_closed(&mut self, _cx: CX![], id: usize) {
		self.tcp_clients.remove(&id);
	}

	fn deliver_udp(&mut self, peer: SocketAddr, msg: Message) {
		let Ok(mut buf) = wire::write(&msg) else { return };

		// Outgoing UDP replies larger than 512 bytes must set TC and truncate,
		// per the classic (pre-EDNS0) UDP size limit this forwarder targets.
		if buf.len() > 512 {
			let mut truncated = msg;
			truncated.header.tc = true;
			truncated.answers.clear();
			truncated.authorities.clear();
			truncated.additionals.clear();
			buf = wire::write(&truncated).unwrap_or(buf);
			buf.truncate(512.min(buf.len()));
		}

		let socket = match peer {
			SocketAddr::V4(_) => self.udp4.as_ref(),
			SocketAddr::V6(_) => self.udp6.as_ref(),
		};

		if let Some(socket) = socket {
			let _ = socket.send_to(peer, &buf);
		}
	}

	fn deliver_tcp(&mut self, id: usize, msg: Message) {
		let Some(client) = self.tcp_clients.get_mut(&id) else { return };

		let mut buf = wire::write(&msg).unwrap_or_default();

		if buf.len() > 65535 {
			let mut truncated = msg;
			truncated.header.tc = true;
			truncated.answers.clear();
			buf = wire::write(&truncated).unwrap_or(buf);
			buf.truncate(65535);
		}

		let framed = socket::frame(&buf);
		let _ = client.io.write(|cur| cur.push(framed.as_slice()));
	}

	/// `HandleMessage`: parse, branch on the response bit, check question
	/// count, try the cache, try local hosts, else forward. `peer` is `Some`
	/// only for UDP clients (it drives dedup in the forward engine).
	fn handle_message(&mut self, cx: CX![], buf: &[u8], peer: Option<&[u8]>, reply: Ret<Message>) {
		let msg = match wire::parse(buf) {
			Ok(msg) => msg,
			Err(()) => {
				if buf.len() >= 3 && buf[2] & 0x80 == 0 {
					// Response bit (top bit of byte 2) is clear: plausibly a query.
					let header = Header { id: header_id(buf), ..Default::default() };
					reply.ret(Message { header: header.response_to(RCODE_FORMAT_ERROR), ..Default::default() });
				}
				return;
			}
		};

		if msg.header.qr {
			// Unreachable in practice: upstream responses land on the forward
			// engine's own sockets, never on these client-facing ones.
			debug!("server: dropping unexpected response-flagged message on client-facing socket");
			return;
		}

		if msg.questions.len() != 1 {
			reply.ret(msg.error_reply(RCODE_FORMAT_ERROR));
			return;
		}

		let now = runtime::time::unix(cx);

		if let Some(cached) = self.cache.lookup(&msg, now) {
			reply.ret(cached);
			return;
		}

		if let Some(answer) = self.hosts.lookup(&msg) {
			reply.ret(answer);
			return;
		}

		let peer = peer.map(<[u8]>::to_vec);

		let actor = cx.access_actor().clone();
		let caching_reply = Ret::new(move |answer: Message| {
			actor.defer(move |s| {
				actor.apply(s, move |this, cx| {
					let now = runtime::time::unix(cx);
					this.cache.store(&answer, now);
					reply.ret(answer);
				});
			});
		});

		self.forward.apply(cx, move |fwd, cx| {
			let _ = fwd.forward(cx, peer.as_deref(), msg, caching_reply);
		});
	}
}

fn offset_of(whole: &[u8], part: &[u8]) -> usize {
	part.as_ptr() as usize - whole.as_ptr() as usize
}

fn header_id(buf: &[u8]) -> u16 {
	if buf.len() >= 2 {
		u16::from_be_bytes([buf[0], buf[1]])
	} else {
		0
	}
}

fn peer_bytes(addr: SocketAddr) -> Vec<u8> {
	match addr.ip() {
		std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
		std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
	}
}

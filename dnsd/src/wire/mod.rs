//! RFC 1035 message parsing and serialization.

use bilge::prelude::*;
use utils::bytes::Cast;
use utils::endian::{u16be, u32be, BigEndian};

mod describe;
mod parse;
mod write;

pub use parse::parse;
pub use write::write;

/// Labels longer than this are malformed.
pub const MAX_LABEL: usize = 63;
/// Decoded names longer than this are malformed.
pub const MAX_NAME: usize = 255;
/// Compressed-name pointers only have 14 bits of offset.
pub const MAX_POINTER: u16 = 0x3fff;

pub const TYPE_A: u16 = 1;
pub const TYPE_NS: u16 = 2;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_AAAA: u16 = 28;
pub const QTYPE_ALL: u16 = 255;

pub const CLASS_IN: u16 = 1;
pub const CLASS_ANY: u16 = 255;

#[bitsize(4)]
#[derive(FromBits, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
	/// A standard query.
	Query = 0,
	/// An inverse query.
	IQuery = 1,
	/// A server status request.
	Status = 2,
	#[fallback]
	Reserved,
}

#[bitsize(4)]
#[derive(FromBits, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rcode {
	NoError = 0,
	FormatError = 1,
	ServerFailure = 2,
	NameError = 3,
	NotImplemented = 4,
	Refused = 5,
	#[fallback]
	Reserved,
}

#[bitsize(16)]
#[derive(FromBits, Clone, Copy)]
pub struct Flags {
	rcode: Rcode,
	z: u3,
	ra: bool,
	rd: bool,
	tc: bool,
	aa: bool,
	opcode: Opcode,
	qr: bool,
}

/// The fixed 12-byte header, laid out exactly as it appears on the wire.
#[derive(Cast)]
#[repr(C)]
pub(crate) struct WireHeader {
	pub id: u16,
	pub flags: BigEndian<Flags>,
	pub qdcount: u16be,
	pub ancount: u16be,
	pub nscount: u16be,
	pub arcount: u16be,
}

/// The fixed portion of a question, following its name.
#[derive(Cast)]
#[repr(C)]
pub(crate) struct WireQuestion {
	pub qtype: u16be,
	pub qclass: u16be,
}

/// The fixed portion of a resource record, following its name.
#[derive(Cast)]
#[repr(C)]
pub(crate) struct WireRecord {
	pub rtype: u16be,
	pub rclass: u16be,
	pub ttl: u32be,
	pub rdlength: u16be,
}

/// A fully decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
	pub id: u16,
	pub qr: bool,
	pub opcode: u8,
	pub aa: bool,
	pub tc: bool,
	pub rd: bool,
	pub ra: bool,
	pub rcode: u8,
}

impl Header {
	pub fn query(id: u16, rd: bool) -> Self {
		Self { id, qr: false, opcode: 0, aa: false, tc: false, rd, ra: false, rcode: 0 }
	}

	pub fn response_to(&self, rcode: u8) -> Self {
		Self { id: self.id, qr: true, opcode: self.opcode, aa: false, tc: false, rd: self.rd, ra: true, rcode }
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
	pub name: String,
	pub qtype: u16,
	pub qclass: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
	pub name: String,
	pub rtype: u16,
	pub rclass: u16,
	pub ttl: u32,
	pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
	pub header: Header,
	pub questions: Vec<Question>,
	pub answers: Vec<Record>,
	pub authorities: Vec<Record>,
	pub additionals: Vec<Record>,
}

impl Default for Header {
	fn default() -> Self {
		Self { id: 0, qr: false, opcode: 0, aa: false, tc: false, rd: false, ra: false, rcode: 0 }
	}
}

impl Message {
	/// Builds an error response echoing the first question of `self`, if any.
	pub fn error_reply(&self, rcode: u8) -> Message {
		Message {
			header: self.header.response_to(rcode),
			questions: self.questions.first().cloned().into_iter().collect(),
			answers: Vec::new(),
			authorities: Vec::new(),
			additionals: Vec::new(),
		}
	}
}

pub(crate) fn name_to_lowercase(name: &str) -> String {
	name.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_reply_echoes_question() {
		let q = Question { name: "example.com".into(), qtype: TYPE_A, qclass: CLASS_IN };
		let msg = Message { header: Header::query(0x1234, true), questions: vec![q.clone()], ..Default::default() };

		let reply = msg.error_reply(Rcode::FormatError as u8);

		assert_eq!(reply.header.id, 0x1234);
		assert!(reply.header.qr);
		assert_eq!(reply.questions, vec![q]);
	}
}

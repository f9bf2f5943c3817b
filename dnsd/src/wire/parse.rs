use log::warn;
use utils::bytes::cast;

use super::{Header, Message, Question, Record, WireHeader, WireQuestion, WireRecord, MAX_LABEL, MAX_NAME};

/// Decodes a (possibly pointer-compressed) name starting at `pos`, returning the
/// decoded string and the offset immediately following the name *in the original,
/// uncompressed sense* (i.e. how far the cursor that called us should advance).
fn parse_name(buf: &[u8], mut pos: usize) -> utils::error::Result<(String, usize)> {
	let start = pos;
	let mut name = String::new();
	let mut jumped = false;
	let mut advance = 0usize;
	// Every jump must strictly decrease the offset we are reading from, bounded
	// by where the pointer itself sits rather than the buffer length — a jump
	// to anywhere at or past the current position is a forward reference into
	// not-yet-decoded bytes, which is just as invalid as a cycle.
	let mut min_pos = start;

	loop {
		let Some(&len) = buf.get(pos) else {
			warn!("DNS parse error: label length out of bounds");
			return Err(());
		};

		if len & 0xc0 == 0xc0 {
			let hi = buf.get(pos).copied().ok_or(())?;
			let lo = buf.get(pos + 1).copied().ok_or(())?;
			let target = (((hi as u16) << 8 | lo as u16) & 0x3fff) as usize;

			if !jumped {
				advance = pos + 2 - start;
			}

			if target >= min_pos {
				warn!("DNS parse error: label pointer does not strictly decrease (cycle or forward jump)");
				return Err(());
			}

			min_pos = target;
			pos = target;
			jumped = true;
			continue;
		}

		if len & 0xc0 != 0 {
			warn!("DNS parse error: reserved label length bits");
			return Err(());
		}

		if len == 0 {
			if !jumped {
				advance = pos + 1 - start;
			}
			break;
		}

		let len = len as usize;

		if pos + 1 + len > buf.len() {
			warn!("DNS parse error: label out of bounds");
			return Err(());
		}

		if len > MAX_LABEL {
			warn!("DNS parse error: label exceeds 63 bytes");
			return Err(());
		}

		if !name.is_empty() {
			name.push('.');
		}

		name.push_str(std::str::from_utf8(&buf[pos + 1..pos + 1 + len]).unwrap_or_default());

		pos += 1 + len;

		if !jumped {
			advance = pos - start;
		}
	}

	if name.len() > MAX_NAME {
		warn!("DNS parse error: name exceeds 255 bytes");
		return Err(());
	}

	Ok((name, advance))
}

fn parse_question(buf: &[u8], pos: usize) -> utils::error::Result<(Question, usize)> {
	let (name, advance) = parse_name(buf, pos)?;
	let rest = pos + advance;

	let end = rest + std::mem::size_of::<WireQuestion>();

	if end > buf.len() {
		warn!("DNS parse error: question out of bounds");
		return Err(());
	}

	let attrs: &WireQuestion = cast(&buf[rest..end]);

	Ok((Question { name, qtype: attrs.qtype.get(), qclass: attrs.qclass.get() }, end))
}

fn parse_record(buf: &[u8], pos: usize) -> utils::error::Result<(Record, usize)> {
	let (name, advance) = parse_name(buf, pos)?;
	let rest = pos + advance;

	let hdr_end = rest + std::mem::size_of::<WireRecord>();

	if hdr_end > buf.len() {
		warn!("DNS parse error: record header out of bounds");
		return Err(());
	}

	let attrs: &WireRecord = cast(&buf[rest..hdr_end]);
	let rdlength = attrs.rdlength.get() as usize;
	let data_end = hdr_end + rdlength;

	if data_end > buf.len() {
		warn!("DNS parse error: record data out of bounds");
		return Err(());
	}

	Ok((
		Record {
			name,
			rtype: attrs.rtype.get(),
			rclass: attrs.rclass.get(),
			ttl: attrs.ttl.get(),
			data: buf[hdr_end..data_end].to_vec(),
		},
		data_end,
	))
}

/// Parses a complete DNS message from `buf`.
pub fn parse(buf: &[u8]) -> utils::error::Result<Message> {
	if buf.len() < std::mem::size_of::<WireHeader>() {
		warn!("DNS parse error: message shorter than header");
		return Err(());
	}

	let wire: &WireHeader = cast(&buf[..std::mem::size_of::<WireHeader>()]);
	let flags = wire.flags.get();

	let header = Header {
		id: wire.id,
		qr: flags.qr(),
		opcode: flags.opcode() as u8,
		aa: flags.aa(),
		tc: flags.tc(),
		rd: flags.rd(),
		ra: flags.ra(),
		rcode: flags.rcode() as u8,
	};

	let mut pos = std::mem::size_of::<WireHeader>();
	let mut questions = Vec::with_capacity(wire.qdcount.get() as usize);

	for _ in 0..wire.qdcount.get() {
		let (q, next) = parse_question(buf, pos)?;
		pos = next;
		questions.push(q);
	}

	let mut answers = Vec::with_capacity(wire.ancount.get() as usize);
	for _ in 0..wire.ancount.get() {
		let (r, next) = parse_record(buf, pos)?;
		pos = next;
		answers.push(r);
	}

	let mut authorities = Vec::with_capacity(wire.nscount.get() as usize);
	for _ in 0..wire.nscount.get() {
		let (r, next) = parse_record(buf, pos)?;
		pos = next;
		authorities.push(r);
	}

	let mut additionals = Vec::with_capacity(wire.arcount.get() as usize);
	for _ in 0..wire.arcount.get() {
		let (r, next) = parse_record(buf, pos)?;
		pos = next;
		additionals.push(r);
	}

	Ok(Message { header, questions, answers, authorities, additionals })
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wire::write::write;
	use crate::wire::{CLASS_IN, TYPE_A};

	#[test]
	fn rejects_pointer_cycle() {
		// Label at offset 12 points to offset 14, which points back to offset 12.
		let mut buf = vec![0u8; 14];
		buf.extend_from_slice(&[0xc0, 12]);
		buf[12] = 0xc0;
		buf[13] = 14;

		// Minimal valid-looking header (all counts zero) so only the name path is exercised.
		let msg_buf = {
			let mut v = vec![0u8; 12];
			v[4] = 0;
			v[5] = 1; // qdcount = 1
			v.extend_from_slice(&buf[12..]);
			v.extend_from_slice(&[0, 1, 0, 1]); // qtype/qclass
			v
		};

		assert!(parse(&msg_buf).is_err());
	}

	#[test]
	fn rejects_forward_pointer() {
		// The question's name (at offset 12) points to offset 20, which is
		// further into the buffer than the pointer itself — not yet decoded.
		let mut v = vec![0u8; 12];
		v[5] = 1; // qdcount = 1
		v.extend_from_slice(&[0xc0, 20]); // pointer at offset 12, targets 20
		v.extend_from_slice(&[0, 1, 0, 1]); // qtype/qclass
		v.extend_from_slice(&[3, b'f', b'o', b'o', 0]); // bytes living at offset 20

		assert!(parse(&v).is_err());
	}

	#[test]
	fn round_trips_simple_query() {
		let msg = Message {
			header: Header::query(0xabcd, true),
			questions: vec![Question { name: "example.com".into(), qtype: TYPE_A, qclass: CLASS_IN }],
			answers: Vec::new(),
			authorities: Vec::new(),
			additionals: Vec::new(),
		};

		let bytes = write(&msg).unwrap();
		let back = parse(&bytes).unwrap();

		assert_eq!(back, msg);
	}
}

use std::collections::HashMap;

use bilge::prelude::*;
use log::warn;
use utils::bytes::as_slice;
use utils::endian::BigEndian;

use super::{Flags, Message, Opcode, Rcode, Record, WireHeader, WireQuestion, WireRecord, MAX_LABEL, MAX_NAME, MAX_POINTER};

/// Tracks, for each name suffix already written, the offset at which it begins —
/// used to emit a compression pointer instead of repeating labels.
#[derive(Default)]
struct NameTable(HashMap<String, u16>);

impl NameTable {
	/// Writes `name` into `out`, compressing against any suffix already recorded.
	fn write(&mut self, out: &mut Vec<u8>, name: &str) -> utils::error::Result {
		if name.len() > MAX_NAME {
			warn!("DNS write error: name exceeds 255 bytes");
			return Err(());
		}

		let labels: Vec<&str> = if name.is_empty() { Vec::new() } else { name.split('.').collect() };

		for i in 0..labels.len() {
			let suffix = labels[i..].join(".");

			if let Some(&offset) = self.0.get(&suffix) {
				let ptr = 0xc000u16 | offset;
				out.extend_from_slice(&ptr.to_be_bytes());
				return Ok(());
			}

			if out.len() <= MAX_POINTER as usize {
				self.0.insert(suffix, out.len() as u16);
			}

			let label = labels[i].as_bytes();

			if label.len() > MAX_LABEL {
				warn!("DNS write error: label exceeds 63 bytes");
				return Err(());
			}

			out.push(label.len() as u8);
			out.extend_from_slice(label);
		}

		out.push(0);

		Ok(())
	}
}

fn write_record(out: &mut Vec<u8>, names: &mut NameTable, rec: &Record) -> utils::error::Result {
	names.write(out, &rec.name)?;

	let hdr = WireRecord {
		rtype: rec.rtype.into(),
		rclass: rec.rclass.into(),
		ttl: rec.ttl.into(),
		rdlength: (rec.data.len() as u16).into(),
	};

	out.extend_from_slice(as_slice::<u8, WireRecord>(&hdr));
	out.extend_from_slice(&rec.data);

	Ok(())
}

/// Serializes `msg` into a wire-format byte vector, compressing names as it goes.
pub fn write(msg: &Message) -> utils::error::Result<Vec<u8>> {
	if msg.questions.len() > 0xffff || msg.answers.len() > 0xffff || msg.authorities.len() > 0xffff || msg.additionals.len() > 0xffff {
		warn!("DNS write error: section has too many records");
		return Err(());
	}

	let mut out = Vec::with_capacity(512);

	let hdr = WireHeader {
		id: msg.header.id,
		flags: BigEndian::from(Flags::new(
			Rcode::from(u4::new(msg.header.rcode)),
			u3::new(0),
			msg.header.ra,
			msg.header.rd,
			msg.header.tc,
			msg.header.aa,
			Opcode::from(u4::new(msg.header.opcode)),
			msg.header.qr,
		)),
		qdcount: (msg.questions.len() as u16).into(),
		ancount: (msg.answers.len() as u16).into(),
		nscount: (msg.authorities.len() as u16).into(),
		arcount: (msg.additionals.len() as u16).into(),
	};

	out.extend_from_slice(as_slice::<u8, WireHeader>(&hdr));

	let mut names = NameTable::default();

	for q in &msg.questions {
		names.write(&mut out, &q.name)?;

		let attrs = WireQuestion { qtype: q.qtype.into(), qclass: q.qclass.into() };
		out.extend_from_slice(as_slice::<u8, WireQuestion>(&attrs));
	}

	for rec in msg.answers.iter().chain(&msg.authorities).chain(&msg.additionals) {
		write_record(&mut out, &mut names, rec)?;
	}

	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wire::{Header, Question, CLASS_IN, TYPE_A};

	#[test]
	fn compresses_repeated_suffix() {
		let msg = Message {
			header: Header::query(1, true),
			questions: vec![Question { name: "www.example.com".into(), qtype: TYPE_A, qclass: CLASS_IN }],
			answers: vec![Record { name: "www.example.com".into(), rtype: TYPE_A, rclass: CLASS_IN, ttl: 60, data: vec![1, 2, 3, 4] }],
			authorities: Vec::new(),
			additionals: Vec::new(),
		};

		let bytes = write(&msg).unwrap();

		// The answer's name should be encoded as a 2-byte pointer back into the question.
		let question_name_len = "www.example.com".len() + 2; // labels + root
		let answer_name_start = 12 + question_name_len + 4;
		assert_eq!(bytes[answer_name_start] & 0xc0, 0xc0);
	}
}

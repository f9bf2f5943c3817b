use std::fmt::Write;

use super::{Message, Record, CLASS_IN, QTYPE_ALL, TYPE_A, TYPE_AAAA, TYPE_CNAME, TYPE_NS};

fn type_name(ty: u16) -> String {
	match ty {
		TYPE_A => "A".into(),
		TYPE_NS => "NS".into(),
		TYPE_CNAME => "CNAME".into(),
		TYPE_AAAA => "AAAA".into(),
		QTYPE_ALL => "ALL".into(),
		other => format!("{other:#06x}"),
	}
}

fn class_name(cl: u16) -> String {
	match cl {
		CLASS_IN => "IN".into(),
		255 => "ANY".into(),
		other => format!("{other:#06x}"),
	}
}

impl Message {
	/// Produces a human-readable dump for logging. Has no wire meaning.
	pub fn describe(&self) -> String {
		let mut out = String::new();

		let _ = writeln!(out, "id: {:#06x}", self.header.id);
		let _ = writeln!(out, "response: {}", self.header.qr);
		let _ = writeln!(out, "opcode: {}", self.header.opcode);
		let _ = writeln!(out, "authoritative: {}", self.header.aa);
		let _ = writeln!(out, "truncated: {}", self.header.tc);
		let _ = writeln!(out, "recursion desired: {}", self.header.rd);
		let _ = writeln!(out, "recursion available: {}", self.header.ra);
		let _ = writeln!(out, "response code: {}", self.header.rcode);

		for q in &self.questions {
			let _ = writeln!(out, "question: [{}], type {}, class {}", q.name, type_name(q.qtype), class_name(q.qclass));
		}

		fn describe_records(out: &mut String, label: &str, records: &[Record]) {
			for r in records {
				let _ = writeln!(
					out,
					"{label}: [{}], type {}, class {}, ttl {}, {} bytes",
					r.name,
					type_name(r.rtype),
					class_name(r.rclass),
					r.ttl,
					r.data.len()
				);
			}
		}

		describe_records(&mut out, "answer", &self.answers);
		describe_records(&mut out, "authority name", &self.authorities);
		describe_records(&mut out, "additional record", &self.additionals);

		out
	}
}

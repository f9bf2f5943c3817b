//! The local static hosts table, populated from the `[hosts]` config section.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::wire::{Header, Message, Question, Record, CLASS_ANY, CLASS_IN, QTYPE_ALL, TYPE_A, TYPE_AAAA};

const HOSTS_TTL: u32 = 300;

#[derive(Default)]
pub struct Hosts {
	entries: HashMap<String, Vec<IpAddr>>,
	search_domain: Option<String>,
}

impl Hosts {
	pub fn set_search_domain(&mut self, domain: impl Into<String>) {
		self.search_domain = Some(domain.into());
	}

	pub fn add(&mut self, name: impl Into<String>, addr: IpAddr) {
		self.entries.entry(crate::wire::name_to_lowercase(&name.into())).or_default().push(addr);
	}

	fn canonical_name(&self, name: &str) -> String {
		let trimmed = name.trim_end_matches('.');
		let lower = crate::wire::name_to_lowercase(trimmed);

		if !lower.contains('.') {
			if let Some(domain) = &self.search_domain {
				return format!("{lower}.{domain}");
			}
		}

		lower
	}

	/// Attempts to answer `msg`'s single question from the static table. Returns
	/// `None` if this table has no opinion on the name at all (defer to the
	/// forwarder); returns `Some` with an empty answer set and NameError if the
	/// name is known under a different type or class only in the trivial sense
	/// that the question's class isn't one we serve.
	pub fn lookup(&self, msg: &Message) -> Option<Message> {
		let q = msg.questions.first()?;

		if q.qclass != CLASS_IN && q.qclass != CLASS_ANY {
			return None;
		}

		let name = self.canonical_name(&q.name);
		let addrs = self.entries.get(&name)?;

		let answers: Vec<Record> = addrs
			.iter()
			.filter(|addr| match q.qtype {
				QTYPE_ALL => true,
				TYPE_A => addr.is_ipv4(),
				TYPE_AAAA => addr.is_ipv6(),
				_ => false,
			})
			.map(|addr| {
				let (rtype, data) = match addr {
					IpAddr::V4(v4) => (TYPE_A, v4.octets().to_vec()),
					IpAddr::V6(v6) => (TYPE_AAAA, v6.octets().to_vec()),
				};
				Record { name: q.name.clone(), rtype, rclass: CLASS_IN, ttl: HOSTS_TTL, data }
			})
			.collect();

		let rcode = if answers.is_empty() { 3 /* NameError */ } else { 0 };

		Some(Message {
			header: msg.header.response_to(rcode),
			questions: vec![q.clone()],
			answers,
			authorities: Vec::new(),
			additionals: Vec::new(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn query(name: &str, qtype: u16) -> Message {
		Message {
			header: Header::query(1, true),
			questions: vec![Question { name: name.into(), qtype, qclass: CLASS_IN }],
			..Default::default()
		}
	}

	#[test]
	fn resolves_unqualified_name_via_search_domain() {
		let mut hosts = Hosts::default();
		hosts.set_search_domain("lan");
		hosts.add("myhost.lan", "10.0.0.1".parse().unwrap());

		let reply = hosts.lookup(&query("myhost", TYPE_A)).unwrap();

		assert_eq!(reply.answers.len(), 1);
		assert_eq!(reply.answers[0].data, vec![10, 0, 0, 1]);
		assert_eq!(reply.answers[0].ttl, HOSTS_TTL);
	}

	#[test]
	fn unknown_name_defers_to_forwarder() {
		let hosts = Hosts::default();
		assert!(hosts.lookup(&query("example.com", TYPE_A)).is_none());
	}
}

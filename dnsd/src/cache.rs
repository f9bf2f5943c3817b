//! TTL-bounded answer cache, keyed by (qname, qtype, qclass).
//!
//! The original upstream project left this as a stub (`TryCache` always
//! returned `false`); the behavior here — staleness discarding the whole group,
//! and a bounded negative-cache TTL — is specified rather than inherited.

use std::collections::HashMap;

use log::debug;

use crate::wire::{Header, Message, Question, Record};

const DEFAULT_NEGATIVE_TTL: u32 = 300;

#[derive(Clone)]
struct Stored {
	rcode: u8,
	records: Vec<(Record, u32 /* insert timestamp */)>,
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct Key {
	qname: String,
	qtype: u16,
	qclass: u16,
}

fn key_for(q: &Question) -> Key {
	Key { qname: crate::wire::name_to_lowercase(&q.name), qtype: q.qtype, qclass: q.qclass }
}

pub struct Cache {
	entries: HashMap<Key, Stored>,
	negative_ttl: u32,
}

impl Default for Cache {
	fn default() -> Self {
		Self::new(DEFAULT_NEGATIVE_TTL)
	}
}

impl Cache {
	pub fn new(negative_ttl: u32) -> Self {
		Self { entries: HashMap::new(), negative_ttl }
	}

	/// Looks up `msg`'s single question and, on a valid (non-stale) hit,
	/// returns a synthesized response. A group with any stale record is
	/// discarded entirely rather than partially served.
	pub fn lookup(&mut self, msg: &Message, now: u32) -> Option<Message> {
		let q = msg.questions.first()?;
		let key = key_for(q);
		let stored = self.entries.get(&key)?;

		for (rec, ts) in &stored.records {
			let expiry = ts.saturating_add(rec.ttl);
			if expiry < now || *ts > now {
				debug!("cache: stale record for {}, discarding group", q.name);
				self.entries.remove(&key);
				return None;
			}
		}

		let stored = self.entries.get(&key)?;

		let answers = stored
			.records
			.iter()
			.map(|(rec, ts)| {
				let mut rec = rec.clone();
				rec.ttl = ts.saturating_add(rec.ttl).saturating_sub(now);
				rec
			})
			.collect();

		Some(Message {
			header: Header { ra: true, ..msg.header.response_to(stored.rcode) },
			questions: vec![q.clone()],
			answers,
			authorities: Vec::new(),
			additionals: Vec::new(),
		})
	}

	/// Parses and stores `buf` as a response. Does nothing if it does not carry
	/// exactly one question. A response with no answers is stored as a negative
	/// cache entry bounded by `negative_ttl`.
	pub fn store(&mut self, msg: &Message, now: u32) {
		let Some(q) = msg.questions.first() else { return };
		let key = key_for(q);

		if msg.answers.is_empty() {
			self.entries.insert(key, Stored { rcode: msg.header.rcode, records: vec![] });
			// A negative entry is modeled as an empty record list with a
			// synthetic record carrying the negative TTL, so lookup's
			// per-record staleness check still applies uniformly.
			let synthetic = Record { name: q.name.clone(), rtype: q.qtype, rclass: q.qclass, ttl: self.negative_ttl, data: Vec::new() };
			self.entries.get_mut(&key_for(q)).unwrap().records.push((synthetic, now));
			return;
		}

		let records = msg.answers.iter().cloned().map(|r| (r, now)).collect();
		self.entries.insert(key, Stored { rcode: msg.header.rcode, records });
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wire::{CLASS_IN, TYPE_A};

	fn query(name: &str) -> Message {
		Message {
			header: Header::query(1, true),
			questions: vec![Question { name: name.into(), qtype: TYPE_A, qclass: CLASS_IN }],
			..Default::default()
		}
	}

	fn answer(name: &str, ttl: u32) -> Message {
		let mut m = query(name);
		m.header.qr = true;
		m.answers.push(Record { name: name.into(), rtype: TYPE_A, rclass: CLASS_IN, ttl, data: vec![93, 184, 216, 34] });
		m
	}

	#[test]
	fn hit_decrements_ttl_by_elapsed() {
		let mut cache = Cache::default();
		cache.store(&answer("example.com", 60), 1_000);

		let reply = cache.lookup(&query("example.com"), 1_010).unwrap();
		assert_eq!(reply.answers[0].ttl, 50);
	}

	#[test]
	fn stale_group_is_discarded() {
		let mut cache = Cache::default();
		cache.store(&answer("example.com", 60), 1_000);

		assert!(cache.lookup(&query("example.com"), 2_000).is_none());
		assert!(cache.lookup(&query("example.com"), 2_001).is_none());
	}

	#[test]
	fn negative_entry_short_circuits_until_expiry() {
		let mut cache = Cache::new(300);
		let mut nxdomain = query("nowhere.invalid");
		nxdomain.header.qr = true;
		nxdomain.header.rcode = 3;

		cache.store(&nxdomain, 1_000);

		let hit = cache.lookup(&query("nowhere.invalid"), 1_100).unwrap();
		assert_eq!(hit.header.rcode, 3);
		assert!(hit.answers.is_empty());

		assert!(cache.lookup(&query("nowhere.invalid"), 1_301).is_none());
	}
}

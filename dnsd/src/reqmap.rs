//! Correlates outstanding upstream/client requests with the DNS id, peer address,
//! and question they were issued for.
//!
//! Every connection-like object (a UDP socket, a TCP/TLS stream) owns one of
//! these. Cancellation tokens hold only a weak reference to the map's backing
//! storage, so a token outliving the map (or its owning connection) is always
//! a safe no-op — this is the "weak pointer" variant of the cyclic-ownership
//! pattern described for this subsystem: the other two are a registry with a
//! generation counter, or id indirection into a slab.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::wire::Message;

struct Entry<V> {
	peer: Option<Vec<u8>>,
	qtype: u16,
	qname: String,
	value: V,
}

type Inner<V> = RefCell<std::collections::HashMap<u16, Vec<Entry<V>>>>;

/// A request-correlation map, keyed by DNS id with a vector per id since ids
/// are only 16 bits and can collide between concurrent clients.
pub struct ResponseMap<V>(Rc<Inner<V>>);

impl<V> Default for ResponseMap<V> {
	fn default() -> Self {
		Self(Rc::new(RefCell::new(std::collections::HashMap::new())))
	}
}

impl<V> Clone for ResponseMap<V> {
	fn clone(&self) -> Self {
		Self(self.0.clone())
	}
}

fn key_of(msg: &Message) -> Option<(u16, u16, String)> {
	let q = msg.questions.first()?;
	Some((msg.header.id, q.qtype, crate::wire::name_to_lowercase(&q.name)))
}

/// A cancellation token that, once invoked, removes the exact entry it was
/// issued for. Invoking it after the map is gone is a no-op.
pub struct Cancel<V> {
	weak: Weak<Inner<V>>,
	id: u16,
	peer: Option<Vec<u8>>,
	qtype: u16,
	qname: String,
}

impl<V> Cancel<V> {
	pub fn cancel(self) -> Option<V> {
		let inner = self.weak.upgrade()?;
		let mut map = inner.borrow_mut();
		let bucket = map.get_mut(&self.id)?;

		let idx = bucket.iter().position(|e| e.peer == self.peer && e.qtype == self.qtype && e.qname == self.qname)?;

		let entry = bucket.swap_remove(idx);

		if bucket.is_empty() {
			map.remove(&self.id);
		}

		Some(entry.value)
	}
}

impl<V> ResponseMap<V> {
	pub fn new() -> Self {
		Self::default()
	}

	/// Inserts a value correlated with `msg`'s (id, qtype, qname) and `peer`'s
	/// address bytes (port is deliberately excluded: replies from the same host
	/// over a different ephemeral port must still match). Fails if `msg` does
	/// not carry exactly one question.
	pub fn insert(&self, peer: Option<&[u8]>, msg: &Message, value: V) -> utils::error::Result<Cancel<V>> {
		if msg.questions.len() != 1 {
			log::warn!("reqmap insert: expected exactly one question, got {}", msg.questions.len());
			return Err(());
		}

		let (id, qtype, qname) = key_of(msg).expect("checked len == 1 above");
		let peer = peer.map(<[u8]>::to_vec);

		self.0.borrow_mut().entry(id).or_default().push(Entry { peer: peer.clone(), qtype, qname: qname.clone(), value });

		Ok(Cancel { weak: Rc::downgrade(&self.0), id, peer, qtype, qname })
	}

	/// Returns a standalone cancellation token for the (peer, msg) key without
	/// inserting anything — used when a value is about to be re-bound under the
	/// same key.
	pub fn create_cancel(&self, peer: Option<&[u8]>, msg: &Message) -> Option<Cancel<V>> {
		let (id, qtype, qname) = key_of(msg)?;

		Some(Cancel { weak: Rc::downgrade(&self.0), id, peer: peer.map(<[u8]>::to_vec), qtype, qname })
	}

	/// Returns a clone of the value in the unique entry matching `msg`'s (id,
	/// qtype, qname) and `peer`'s address bytes, without removing it. A `None`
	/// peer only matches an entry inserted with no peer.
	pub fn lookup(&self, peer: Option<&[u8]>, msg: &Message) -> Option<V>
	where
		V: Clone,
	{
		let (id, qtype, qname) = key_of(msg)?;
		let map = self.0.borrow();
		let bucket = map.get(&id)?;

		let entry = bucket.iter().find(|e| e.peer.as_deref() == peer && e.qtype == qtype && e.qname == qname)?;

		Some(entry.value.clone())
	}

	/// Removes and returns the unique entry matching `msg`'s (id, qtype, qname)
	/// and `peer`'s address bytes. Where a `Cancel` token from the original
	/// `insert` is already held, prefer `Cancel::cancel` — it locates the exact
	/// entry by identity rather than re-matching the tuple.
	pub fn remove(&self, peer: Option<&[u8]>, msg: &Message) -> Option<V> {
		let (id, qtype, qname) = key_of(msg)?;
		let mut map = self.0.borrow_mut();
		let bucket = map.get_mut(&id)?;

		let idx = bucket.iter().position(|e| e.peer.as_deref() == peer && e.qtype == qtype && e.qname == qname)?;
		let entry = bucket.swap_remove(idx);

		if bucket.is_empty() {
			map.remove(&id);
		}

		Some(entry.value)
	}

	pub fn len(&self) -> usize {
		self.0.borrow().values().map(Vec::len).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wire::{Header, Question, CLASS_IN, TYPE_A};

	fn msg(id: u16, name: &str) -> Message {
		Message {
			header: Header::query(id, true),
			questions: vec![Question { name: name.into(), qtype: TYPE_A, qclass: CLASS_IN }],
			..Default::default()
		}
	}

	#[test]
	fn lookup_distinguishes_same_id_different_name() {
		// Two concurrent zero-id coalesced entries (the forward engine's
		// normalized coalescing key) must not collide on id/peer alone.
		let map: ResponseMap<&'static str> = ResponseMap::new();

		map.insert(None, &msg(0, "one.example.com"), "one").unwrap();
		map.insert(None, &msg(0, "two.example.com"), "two").unwrap();

		assert_eq!(map.lookup(None, &msg(0, "two.example.com")), Some("two"));
		assert_eq!(map.lookup(None, &msg(0, "one.example.com")), Some("one"));
	}

	#[test]
	fn lookup_matches_on_peer_bytes_only() {
		let map: ResponseMap<&'static str> = ResponseMap::new();
		let peer = [127, 0, 0, 1];

		map.insert(Some(&peer), &msg(7, "example.com"), "hello").unwrap();

		assert_eq!(map.lookup(Some(&peer), &msg(7, "example.com")), Some("hello"));
		assert_eq!(map.len(), 1);
	}

	#[test]
	fn lookup_does_not_remove_the_entry() {
		// A retransmit probe must be able to find the same in-flight entry
		// twice; a destructive lookup would only let the first probe see it.
		let map: ResponseMap<&'static str> = ResponseMap::new();

		map.insert(None, &msg(1, "a.com"), "x").unwrap();

		assert_eq!(map.lookup(None, &msg(1, "a.com")), Some("x"));
		assert_eq!(map.lookup(None, &msg(1, "a.com")), Some("x"));
		assert_eq!(map.len(), 1);
	}

	#[test]
	fn remove_drops_the_entry() {
		let map: ResponseMap<&'static str> = ResponseMap::new();
		let peer = [127, 0, 0, 1];

		map.insert(Some(&peer), &msg(7, "example.com"), "hello").unwrap();

		assert_eq!(map.remove(Some(&peer), &msg(7, "example.com")), Some("hello"));
		assert!(map.is_empty());
		assert_eq!(map.remove(Some(&peer), &msg(7, "example.com")), None);
	}

	#[test]
	fn stale_cancel_after_drop_is_noop() {
		let cancel = {
			let map: ResponseMap<&'static str> = ResponseMap::new();
			map.insert(None, &msg(1, "a.com"), "x").unwrap()
		};

		assert_eq!(cancel.cancel(), None);
	}

	#[test]
	fn cancel_removes_exact_entry() {
		let map: ResponseMap<&'static str> = ResponseMap::new();
		let cancel = map.insert(None, &msg(1, "a.com"), "x").unwrap();

		assert_eq!(cancel.cancel(), Some("x"));
		assert!(map.is_empty());
	}
}

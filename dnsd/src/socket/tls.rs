//! DNS-over-TLS client connections, built by layering `rustls`'s "bring your
//! own I/O" API over a plain `runtime::tcp` stream.
//!
//! `rustls::ClientConnection` does not touch sockets itself: the caller feeds
//! it raw bytes off the wire (`read_tls`) and lets it tell you what plaintext
//! came out (`process_new_packets` + `reader().read`), and separately asks it
//! for ciphertext to put on the wire (`write_tls`) after giving it plaintext
//! to send (`writer().write`).

use std::io::{Read, Write};
use std::sync::Arc;

use log::error;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use rustls_pki_types::ServerName;
use utils::error::Result;

/// Returns a shared TLS client config trusting the Mozilla root program, via
/// `webpki-roots`, since this server does not otherwise manage a trust store.
pub fn client_config() -> Arc<ClientConfig> {
	let mut roots = RootCertStore::empty();
	roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

	Arc::new(ClientConfig::builder().with_root_certificates(roots).with_no_client_auth())
}

/// One DNS-over-TLS session's protocol state. Owns no socket; the caller
/// drives it with raw bytes read from / destined for a `runtime::tcp` stream.
pub struct Session {
	conn: ClientConnection,
}

impl Session {
	pub fn new(config: Arc<ClientConfig>, hostname: &str) -> Result<Self> {
		let name = ServerName::try_from(hostname.to_owned()).map_err(|err| error!("Invalid DoT server name {hostname:?}: {err}"))?;

		let conn = ClientConnection::new(config, name).map_err(|err| error!("Failed to start TLS session: {err}"))?;

		Ok(Self { conn })
	}

	/// Feeds ciphertext received from the socket into the session, returning
	/// any plaintext that became available.
	pub fn feed_ciphertext(&mut self, bytes: &[u8]) -> Result<Vec<u8>> {
		let mut cursor = bytes;

		while !cursor.is_empty() {
			let n = self.conn.read_tls(&mut cursor).map_err(|err| error!("TLS read_tls failed: {err}"))?;
			if n == 0 {
				break;
			}
		}

		if let Err(err) = self.conn.process_new_packets() {
			error!("TLS process_new_packets failed: {err}");
			return Err(());
		}

		let mut plaintext = Vec::new();
		match self.conn.reader().read_to_end(&mut plaintext) {
			Ok(_) => {}
			Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
			Err(err) => {
				error!("TLS plaintext read failed: {err}");
				return Err(());
			}
		}

		Ok(plaintext)
	}

	/// Queues `plaintext` for transmission and returns the ciphertext that
	/// should be written to the underlying socket.
	pub fn wrap_plaintext(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
		self.conn.writer().write_all(plaintext).map_err(|err| error!("TLS plaintext write failed: {err}"))?;

		self.drain_ciphertext()
	}

	/// Drains any ciphertext rustls wants written, without queueing new
	/// plaintext (used after a handshake step that produced no user data).
	pub fn drain_ciphertext(&mut self) -> Result<Vec<u8>> {
		let mut out = Vec::new();

		while self.conn.wants_write() {
			let mut chunk = [0u8; 4096];
			let mut cursor = &mut chunk[..];
			let n = self.conn.write_tls(&mut cursor).map_err(|err| error!("TLS write_tls failed: {err}"))?;
			if n == 0 {
				break;
			}
			out.extend_from_slice(&chunk[..n]);
		}

		Ok(out)
	}

	pub fn wants_write(&self) -> bool {
		self.conn.wants_write()
	}
}

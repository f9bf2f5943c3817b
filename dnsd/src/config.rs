//! Line-oriented config file parser: `[section]` headers, `#` comments,
//! blank lines ignored. Grounded on the line-reading/section-dispatch shape
//! of the original project's own config tokenizer, re-expressed as a single
//! pass over lines rather than a pluggable per-section handler table, since
//! this system has a fixed, small set of sections.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use log::warn;
use thiserror::Error;

use crate::forward::{Protocol, Upstream};

const DNS_PORT: u16 = 53;
const DOT_PORT: u16 = 853;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file {path}: {source}")]
	Io { path: String, #[source] source: std::io::Error },
	#[error("line {line}: {message}")]
	Syntax { line: usize, message: String },
}

#[derive(Default)]
pub struct Config {
	pub search_domain: Option<String>,
	pub upstreams: Vec<Upstream>,
	pub hosts: Vec<(String, IpAddr)>,
	pub chroot: Option<String>,
	pub setuid: Option<String>,
	pub setgid: Option<String>,
	/// Addition beyond the original grammar: overrides the cache's default
	/// negative-TTL (seconds). Absent falls back to the built-in default.
	pub negative_ttl: Option<u32>,
}

impl Config {
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;

		Self::parse(&text)
	}

	pub fn parse(text: &str) -> Result<Self, ConfigError> {
		let mut config = Config::default();
		let mut section: Option<String> = None;

		for (lineno, raw) in text.lines().enumerate() {
			let line_no = lineno + 1;

			let line = match raw.split_once('#') {
				Some((before, _)) => before,
				None => raw,
			}
			.trim();

			if line.is_empty() {
				continue;
			}

			if line.starts_with('[') {
				let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) else {
					return Err(ConfigError::Syntax { line: line_no, message: format!("malformed section header {line:?}") });
				};
				section = Some(name.trim().to_ascii_lowercase());
				continue;
			}

			let Some(section) = &section else {
				warn!("config: line {line_no}: directive outside any section, skipping");
				continue;
			};

			let words: Vec<&str> = line.split_whitespace().collect();

			match section.as_str() {
				"dns" => config.apply_dns_line(line_no, &words)?,
				"hosts" => config.apply_hosts_line(line_no, &words)?,
				"security" => config.apply_security_line(line_no, &words)?,
				other => {
					warn!("config: line {line_no}: unrecognized section [{other}], skipping");
				}
			}
		}

		Ok(config)
	}

	fn apply_dns_line(&mut self, line_no: usize, words: &[&str]) -> Result<(), ConfigError> {
		match words {
			["search", domain] => {
				self.search_domain = Some((*domain).to_owned());
			}
			["nameserver", proto, host, rest @ ..] if !rest.is_empty() => {
				let protocol = match *proto {
					"dns" => Protocol::Dns,
					"tls" => Protocol::Tls,
					other => {
						warn!("config: line {line_no}: unrecognized nameserver protocol {other:?}, skipping");
						return Ok(());
					}
				};

				let port = if protocol == Protocol::Tls { DOT_PORT } else { DNS_PORT };

				for ip in rest {
					let Ok(ip) = ip.parse::<IpAddr>() else {
						warn!("config: line {line_no}: invalid nameserver address {ip:?}, skipping");
						continue;
					};

					self.upstreams.push(Upstream { addr: SocketAddr::new(ip, port), protocol, hostname: Some((*host).to_owned()) });
				}
			}
			["negative_ttl", seconds] => match seconds.parse::<u32>() {
				Ok(secs) => self.negative_ttl = Some(secs),
				Err(_) => warn!("config: line {line_no}: invalid negative_ttl {seconds:?}, skipping"),
			},
			_ => {
				warn!("config: line {line_no}: unrecognized [dns] directive, skipping");
			}
		}

		Ok(())
	}

	fn apply_hosts_line(&mut self, line_no: usize, words: &[&str]) -> Result<(), ConfigError> {
		let [name, rest @ ..] = words else {
			warn!("config: line {line_no}: empty [hosts] line, skipping");
			return Ok(());
		};

		if rest.is_empty() || rest.len() % 2 != 0 {
			warn!("config: line {line_no}: malformed [hosts] entry for {name:?}, skipping");
			return Ok(());
		}

		for pair in rest.chunks(2) {
			let [kind, addr] = pair else { unreachable!() };

			if *kind != "ip" {
				warn!("config: line {line_no}: unrecognized [hosts] token {kind:?}, skipping");
				continue;
			}

			let Ok(ip) = addr.parse::<IpAddr>() else {
				warn!("config: line {line_no}: invalid address {addr:?} for {name:?}, skipping");
				continue;
			};

			self.hosts.push(((*name).to_owned(), ip));
		}

		Ok(())
	}

	fn apply_security_line(&mut self, line_no: usize, words: &[&str]) -> Result<(), ConfigError> {
		match words {
			["chroot", path] => self.chroot = Some((*path).to_owned()),
			// The original project's handler for this directive swaps its
			// destination with setgid; that's a bug, not intended behavior,
			// so each directive is assigned to its own field here.
			["setuid", name] => self.setuid = Some((*name).to_owned()),
			["setgid", name] => self.setgid = Some((*name).to_owned()),
			_ => {
				warn!("config: line {line_no}: unrecognized [security] directive, skipping");
			}
		}

		Ok(())
	}
}

impl fmt::Debug for Config {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Config")
			.field("search_domain", &self.search_domain)
			.field("upstreams", &self.upstreams.len())
			.field("hosts", &self.hosts.len())
			.field("chroot", &self.chroot)
			.field("setuid", &self.setuid)
			.field("setgid", &self.setgid)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_nameserver_and_hosts_sections() {
		let text = "
			[dns]
			search lan
			nameserver tls dns.google 8.8.8.8 8.8.4.4

			[hosts]
			myhost ip 10.0.0.1 ip fe80::1

			[security]
			chroot /var/empty
			setuid nobody
			setgid nogroup
		";

		let config = Config::parse(text).unwrap();

		assert_eq!(config.search_domain.as_deref(), Some("lan"));
		assert_eq!(config.upstreams.len(), 2);
		assert!(config.upstreams.iter().all(|u| u.protocol == Protocol::Tls));
		assert!(config.upstreams.iter().all(|u| u.addr.port() == 853));
		assert_eq!(config.hosts.len(), 2);
		assert_eq!(config.chroot.as_deref(), Some("/var/empty"));
		assert_eq!(config.setuid.as_deref(), Some("nobody"));
		assert_eq!(config.setgid.as_deref(), Some("nogroup"));
	}

	#[test]
	fn unknown_section_is_skipped_without_aborting() {
		let text = "
			[bogus]
			whatever here

			[dns]
			search example.com
		";

		let config = Config::parse(text).unwrap();
		assert_eq!(config.search_domain.as_deref(), Some("example.com"));
	}

	#[test]
	fn comments_and_blank_lines_are_ignored() {
		let text = "
			# a comment
			[dns]
			search example.com # trailing comment

		";

		let config = Config::parse(text).unwrap();
		assert_eq!(config.search_domain.as_deref(), Some("example.com"));
	}
}

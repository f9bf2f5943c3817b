//! Process entry point: CLI parsing, config loading, socket binding,
//! privilege drop, and the reactor run loop.

use std::net::TcpStream;
use std::path::{Path, PathBuf};

use clap::Parser;
use dnsd::config::Config;
use dnsd::hosts::Hosts;
use dnsd::server::Server;
use log::{error, info, warn, LevelFilter};
use stakker::{actor, fwd_to, ret_nop, Fwd};

const UDP_PORT: u16 = 53;
const TCP_PORT: u16 = 53;
const DEFAULT_NEGATIVE_TTL: u32 = 300;

#[derive(Parser)]
#[command(name = "dnsd", about = "A caching, forwarding DNS server")]
struct Args {
	/// Path to the config file.
	#[arg(short = 'c', long = "config")]
	config: Option<PathBuf>,

	/// Raise log verbosity; may be repeated.
	#[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
	verbose: u8,

	/// Parse the config file and exit without binding any sockets.
	#[arg(long)]
	check: bool,
}

fn main() {
	let args = Args::parse();
	install_logger(args.verbose);

	let config_path = args.config.unwrap_or_else(default_config_path);

	let config = match Config::load(&config_path) {
		Ok(config) => config,
		Err(err) => {
			error!("Failed to load config file {}: {err}", config_path.display());
			std::process::exit(1);
		}
	};

	if args.check {
		info!("config file {} parsed successfully", config_path.display());
		std::process::exit(0);
	}

	let mut upstreams = config.upstreams.clone();
	if upstreams.is_empty() {
		warn!("No [dns] nameserver directives configured; all queries will fail over immediately");
	}
	upstreams.sort_by_key(|u| u.addr);

	let mut hosts = Hosts::default();
	if let Some(domain) = &config.search_domain {
		hosts.set_search_domain(domain.clone());
	}
	for (name, addr) in &config.hosts {
		hosts.add(name.clone(), *addr);
	}

	let negative_ttl = config.negative_ttl.unwrap_or(DEFAULT_NEGATIVE_TTL);

	let mut stakker = runtime::rt::init();
	let core = &mut stakker;

	let server = actor!(core, Server::init(upstreams, hosts, negative_ttl, UDP_PORT), ret_nop!());

	let tcp_fwd: Fwd<TcpStream> = fwd_to!([server], accept_tcp() as TcpStream);
	let (tcp4, tcp6) = match dnsd::socket::bind_dual_stack_tcp(TCP_PORT, tcp_fwd) {
		Ok(listeners) => listeners,
		Err(()) => {
			error!("Failed to bind any client-facing TCP listener");
			std::process::exit(1);
		}
	};

	drop_privileges(&config);

	if let Err(()) = runtime::rt::exec(&mut stakker, || {}) {
		error!("Reactor exited with an error");
		std::process::exit(1);
	}

	drop((server, tcp4, tcp6));
}

fn install_logger(verbose: u8) {
	let level = match verbose {
		0 => LevelFilter::Info,
		1 => LevelFilter::Debug,
		_ => LevelFilter::Trace,
	};

	log::set_max_level(level);
	let _ = log::set_boxed_logger(Box::new(runtime::logger::Logger));
}

fn default_config_path() -> PathBuf {
	let exe_dir = std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf));

	if let Some(dir) = &exe_dir {
		let primary = dir.join("dnsd.conf");
		if primary.exists() {
			return primary;
		}

		let fallback = dir.join("../etc/dnsd.conf");
		if fallback.exists() {
			return fallback;
		}
	}

	PathBuf::from("dnsd.conf")
}

#[cfg(unix)]
fn drop_privileges(config: &Config) {
	use std::ffi::CString;

	let uid = config.setuid.as_ref().and_then(|name| lookup_uid(name));
	let gid = config.setgid.as_ref().and_then(|name| lookup_gid(name));

	if let Some(path) = &config.chroot {
		let Ok(cpath) = CString::new(path.as_str()) else {
			error!("chroot path {path:?} contains a NUL byte");
			std::process::exit(1);
		};

		let root = CString::new("/").unwrap();
		let failed = unsafe { libc::chroot(cpath.as_ptr()) != 0 } || unsafe { libc::chdir(root.as_ptr()) != 0 };
		if failed {
			error!("Failed to chroot into {path}: {}", std::io::Error::last_os_error());
			std::process::exit(1);
		}
	}

	// Order matters: setgid before setuid, since dropping the uid first may
	// remove permission to change the gid.
	if let (Some(name), Some(gid)) = (&config.setgid, gid) {
		if unsafe { libc::setgid(gid) != 0 } {
			error!("Failed to setgid to {name}: {}", std::io::Error::last_os_error());
			std::process::exit(1);
		}
	} else if config.setgid.is_some() {
		error!("Could not look up group {:?}", config.setgid.as_deref().unwrap_or_default());
		std::process::exit(1);
	}

	if let (Some(name), Some(uid)) = (&config.setuid, uid) {
		if unsafe { libc::setuid(uid) != 0 } {
			error!("Failed to setuid to {name}: {}", std::io::Error::last_os_error());
			std::process::exit(1);
		}
	} else if config.setuid.is_some() {
		error!("Could not look up user {:?}", config.setuid.as_deref().unwrap_or_default());
		std::process::exit(1);
	}
}

#[cfg(windows)]
fn drop_privileges(_config: &Config) {
	// chroot/setuid/setgid have no Windows equivalent; the [security] section
	// is simply inert on this platform.
}

#[cfg(unix)]
fn lookup_uid(name: &str) -> Option<libc::uid_t> {
	use std::ffi::CString;

	let cname = CString::new(name).ok()?;
	let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
	if pw.is_null() {
		None
	} else {
		Some(unsafe { (*pw).pw_uid })
	}
}

#[cfg(unix)]
fn lookup_gid(name: &str) -> Option<libc::gid_t> {
	use std::ffi::CString;

	let cname = CString::new(name).ok()?;
	let gr = unsafe { libc::getgrnam(cname.as_ptr()) };
	if gr.is_null() {
		None
	} else {
		Some(unsafe { (*gr).gr_gid })
	}
}

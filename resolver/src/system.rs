use std::net::ToSocketAddrs;
use std::rc::Rc;

use log::{debug, warn};
use stakker::{ret_to, Ret, CX};

use runtime::wake;
use utils::error::Result;

use crate::config::{DnsConfig, IpVersion};
use crate::record::{DnsRecord, DnsRecords};
use crate::registry::ResolveOutcome;

/// The narrow contract `PoolNsBackend` needs from the platform resolver at
/// the final fallback tier. Mirrors `DohTransport` in shape: a test can swap
/// in a scripted fake without touching real sockets or worker threads.
pub trait SystemResolver {
	fn resolve(&self, cx: CX![], host: String, ip_version: IpVersion, ret: Ret<ResolveOutcome>);
}

/// Delegates to the platform resolver (`getaddrinfo` via
/// `std::net::ToSocketAddrs`) on a worker thread, folding the result back
/// into the event loop the same way the DoH transport does.
pub struct DefaultSystemResolver;

impl DefaultSystemResolver {
	pub fn new() -> Self {
		Self
	}
}

impl Default for DefaultSystemResolver {
	fn default() -> Self {
		Self::new()
	}
}

impl SystemResolver for DefaultSystemResolver {
	fn resolve(&self, _: CX![], host: String, ip_version: IpVersion, ret: Ret<ResolveOutcome>) {
		debug!("Resolving {host} via system resolver");

		wake::spawn_blocking(move || lookup(&host, ip_version), ret_to_outcome(ret));
	}
}

fn ret_to_outcome(ret: Ret<ResolveOutcome>) -> Ret<Result<DnsRecords>> {
	Ret::new(move |result: Result<DnsRecords>| {
		let outcome = match result {
			Ok(records) if !records.is_empty() => ResolveOutcome { records, status: 0, error_message: None },
			_ => {
				warn!("System DNS resolution failed");
				ResolveOutcome { records: DnsRecords::default(), status: -1, error_message: Some("DNS resolution failed".to_owned()) }
			}
		};

		ret.ret(outcome);
	})
}

/// The resolver of last resort, and also the only backend ever used for IP
/// literals and for hosts with pool-ns disabled. Reached through the
/// `Registry`, which keeps one of these per sticky hostname so overlapping
/// callers single-flight onto the same in-flight lookup.
pub struct SystemBackend {
	resolver: Rc<dyn SystemResolver>,
	queue: Vec<Ret<ResolveOutcome>>,
	resolving: bool,
}

impl SystemBackend {
	pub fn init(_: CX![], resolver: Rc<dyn SystemResolver>) -> Option<Self> {
		Some(Self { resolver, queue: Vec::new(), resolving: false })
	}

	pub fn resolve(&mut self, cx: CX![], host: String, config: DnsConfig, ret: Ret<ResolveOutcome>) {
		self.queue.push(ret);

		if self.resolving {
			return;
		}

		self.resolving = true;

		let actor = cx.access_actor().clone();
		self.resolver.resolve(cx, host, config.ip_version, ret_to!([actor], on_resolved() as (ResolveOutcome)));
	}

	fn on_resolved(&mut self, _: CX![], outcome: ResolveOutcome) {
		self.resolving = false;

		for ret in self.queue.drain(..) {
			ret.ret(outcome.clone());
		}
	}
}

fn lookup(host: &str, ip_version: IpVersion) -> Result<DnsRecords> {
	let addrs = (host, 0u16).to_socket_addrs().map_err(|err| warn!("getaddrinfo failed for {host}: {err}"))?;

	let records: Vec<DnsRecord> = addrs
		.filter_map(|addr| match (addr.ip(), ip_version) {
			(std::net::IpAddr::V4(v4), IpVersion::Any | IpVersion::V4) => Some(DnsRecord::v4(v4)),
			(std::net::IpAddr::V6(v6), IpVersion::Any | IpVersion::V6) => Some(DnsRecord::v6(v6)),
			_ => None,
		})
		.collect();

	Ok(DnsRecords::new(records))
}

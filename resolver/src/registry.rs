use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use stakker::{Actor, Ret, CX};

use crate::config::DnsConfig;
use crate::doh::DohTransport;
use crate::domain::DomainUtils;
use crate::record::DnsRecords;
use crate::system::{DefaultSystemResolver, SystemResolver};
use crate::{backend::PoolNsBackend, system::SystemBackend};

/// What a resolution ultimately delivers to a caller: the resolved records
/// (empty on failure), a status (`0` on success, negative on failure, mirroring
/// the public `onResolved(records, status, error_message)` contract), and a
/// human-readable error when status is negative.
#[derive(Debug, Clone, Default)]
pub struct ResolveOutcome {
	pub records: DnsRecords,
	pub status: i32,
	pub error_message: Option<String>,
}

#[derive(Clone)]
enum BackendHandle {
	PoolNs(Actor<PoolNsBackend>),
	System(Actor<SystemBackend>),
}

/// Process-wide map from hostname to its sticky backend. A backend is created
/// once per hostname on first use and lives for the rest of the process, so
/// its TTL cache and in-flight queue stay meaningful across repeated lookups.
pub struct Registry {
	doh: Rc<dyn DohTransport>,
	system: Rc<dyn SystemResolver>,
	backends: HashMap<String, BackendHandle>,
}

impl Registry {
	pub fn init(_: CX![], doh: Rc<dyn DohTransport>) -> Option<Self> {
		Some(Self { doh, system: Rc::new(DefaultSystemResolver::new()), backends: HashMap::new() })
	}

	pub fn resolve(&mut self, cx: CX![], host: String, config: DnsConfig, ret: Ret<ResolveOutcome>) {
		if !self.backends.contains_key(&host) {
			let use_pool_ns = config.pool_ns_enabled && !DomainUtils::is_ip(&host) && !config.is_doh_server(&host);

			let handle = if use_pool_ns {
				BackendHandle::PoolNs(stakker::actor!(cx, PoolNsBackend::init(self.doh.clone(), self.system.clone()), stakker::ret_nop!()))
			} else {
				BackendHandle::System(stakker::actor!(cx, SystemBackend::init(self.system.clone()), stakker::ret_nop!()))
			};

			self.backends.insert(host.clone(), handle);
		}

		match self.backends.get(&host).expect("just inserted or already present").clone() {
			BackendHandle::PoolNs(actor) => actor.apply(cx, move |this, cx| this.resolve(cx, host, config, ret)),
			BackendHandle::System(actor) => actor.apply(cx, move |this, cx| this.resolve(cx, host, config, ret)),
		}
	}
}

thread_local! {
	static RECURSION: RefCell<Recursion> = RefCell::new(Recursion::default());
}

#[derive(Default)]
struct Recursion {
	active_base_domains: HashSet<String>,
	depth: u32,
}

/// True once any base domain is mid-resolution, or this one specifically is —
/// resolving a DoH endpoint's or NS hostname's own address must never trigger
/// another authoritative-lookup cycle for its own base domain.
pub(crate) fn is_recursing(base_domain: &str) -> bool {
	RECURSION.with(|r| {
		let r = r.borrow();
		r.depth > 0 || r.active_base_domains.contains(base_domain)
	})
}

pub(crate) fn enter(base_domain: &str) {
	RECURSION.with(|r| {
		let mut r = r.borrow_mut();
		r.active_base_domains.insert(base_domain.to_owned());
		r.depth += 1;
	});
}

pub(crate) fn leave(base_domain: &str) {
	RECURSION.with(|r| {
		let mut r = r.borrow_mut();
		r.active_base_domains.remove(base_domain);
		r.depth = r.depth.saturating_sub(1);
	});
}

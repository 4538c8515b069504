use core::net::{IpAddr, SocketAddr};
use std::rc::Rc;

use log::{debug, info};
use stakker::{ret_to, FixedTimerKey, Ret, CX};

use runtime::wake;
use utils::error::Result;

use crate::config::DnsConfig;
use crate::doh::{DohResult, DohTransport};
use crate::domain::DomainUtils;
use crate::record::DnsRecords;
use crate::registry::{self, ResolveOutcome};
use crate::system::SystemResolver;
use crate::tcp_client;
use crate::wire::{RecordType, WireCodec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendState {
	Idle,
	NsLookup,
	NsResolve,
	PoolQuery,
	SimpleDoh,
	Fallback,
}

/// The authoritative-first resolution strategy for one hostname: look up its
/// base domain's NS records over DoH, query one of those NS hosts directly
/// (over DoH, then TCP/53 if DoH fails), and only once every NS is
/// exhausted fall back to a direct DoH query and finally the system
/// resolver. One instance is sticky per hostname for the life of the
/// process, so the TTL cache and in-flight queue stay coherent.
pub struct PoolNsBackend {
	doh: Rc<dyn DohTransport>,
	system: Rc<dyn SystemResolver>,

	state: BackendState,
	host: String,
	base_domain: String,
	config: DnsConfig,

	records: DnsRecords,
	status: i32,
	/// Monotonic timestamp of the last successful resolution, used for the
	/// TTL cache check.
	ts: Option<std::time::Instant>,

	queue: Vec<Ret<ResolveOutcome>>,

	ns_servers: Vec<String>,
	/// `(ns_hostname, ns_ip)` pairs discovered while resolving NS hosts to IPs.
	ns_entries: Vec<(String, String)>,
	current_ns_index: usize,
	/// 0 = primary DoH server, 1 = fallback.
	doh_server_index: u8,
	pool_query_via_doh: bool,
	added_to_active_set: bool,

	timer: FixedTimerKey,
}

impl PoolNsBackend {
	pub fn init(_: CX![], doh: Rc<dyn DohTransport>, system: Rc<dyn SystemResolver>) -> Option<Self> {
		Some(Self {
			doh,
			system,
			state: BackendState::Idle,
			host: String::new(),
			base_domain: String::new(),
			config: DnsConfig::default(),
			records: DnsRecords::default(),
			status: 0,
			ts: None,
			queue: Vec::new(),
			ns_servers: Vec::new(),
			ns_entries: Vec::new(),
			current_ns_index: 0,
			doh_server_index: 0,
			pool_query_via_doh: true,
			added_to_active_set: false,
			timer: FixedTimerKey::default(),
		})
	}

	pub fn resolve(&mut self, cx: CX![], host: String, config: DnsConfig, ret: Ret<ResolveOutcome>) {
		self.queue.push(ret);
		self.config = config;

		if let Some(ts) = self.ts {
			if cx.now().duration_since(ts) <= self.config.ttl() && !self.records.is_empty() {
				return self.notify(cx);
			}
		}

		if self.state != BackendState::Idle {
			// Already in flight for this host; the completion will notify
			// every queued listener, including the one just pushed.
			return;
		}

		self.host = host;
		self.base_domain = DomainUtils::base_domain(&self.host);
		self.status = 0;
		self.ns_servers.clear();
		self.ns_entries.clear();
		self.current_ns_index = 0;
		self.doh_server_index = 0;
		self.pool_query_via_doh = true;
		self.added_to_active_set = false;

		if !self.config.pool_ns_enabled || DomainUtils::is_ip(&self.host) {
			return self.fallback_to_system(cx);
		}

		// Recursion guard: resolving an NS hostname (or the DoH endpoints
		// themselves) must never itself trigger another NS-lookup cycle.
		if registry::is_recursing(&self.base_domain) {
			return self.start_simple_doh(cx);
		}

		registry::enter(&self.base_domain);
		self.added_to_active_set = true;
		self.start_ns_lookup(cx);
	}

	fn current_doh_server(&self) -> &str {
		if self.doh_server_index == 0 {
			&self.config.doh_primary
		} else {
			&self.config.doh_fallback
		}
	}

	fn arm_timer(&mut self, cx: CX![]) {
		let actor = cx.access_actor().clone();
		self.timer = cx.after(self.config.pool_ns_timeout(), move |s| actor.apply(s, move |this, cx| this.on_timeout(cx)));
	}

	fn stop_timer(&mut self, cx: CX![]) {
		cx.timer_del(self.timer);
		self.timer = FixedTimerKey::default();
	}

	fn submit_doh(&mut self, cx: CX![], dest_host: String, body: Vec<u8>, ret: Ret<DohResult>) {
		let timeout = self.config.pool_ns_timeout();
		self.doh.post(cx, dest_host, body, timeout, ret);
		self.arm_timer(cx);
	}

	fn start_ns_lookup(&mut self, cx: CX![]) {
		self.state = BackendState::NsLookup;

		let doh_host = self.current_doh_server().to_owned();
		let query = WireCodec::build_query(&self.base_domain, RecordType::Ns);

		if self.doh_server_index == 0 {
			debug!("looking up NS for {} via {doh_host}", self.base_domain);
		} else {
			debug!("retrying NS lookup for {} via {doh_host}", self.base_domain);
		}

		if query.is_empty() {
			return self.fallback_to_system(cx);
		}

		let actor = cx.access_actor().clone();
		self.submit_doh(cx, doh_host, query, ret_to!([actor], on_doh_result() as (DohResult)));
	}

	fn on_ns_lookup_complete(&mut self, cx: CX![], ns_servers: Vec<String>) {
		if ns_servers.is_empty() {
			return self.fallback_to_simple_doh(cx);
		}

		for ns in &ns_servers {
			debug!("found NS: {ns}");
		}

		self.ns_servers = ns_servers;
		self.start_pool_query(cx);
	}

	fn start_ns_resolve(&mut self, cx: CX![]) {
		if self.current_ns_index >= self.ns_servers.len() {
			return self.fallback_to_system(cx);
		}

		self.state = BackendState::NsResolve;
		let ns_host = self.ns_servers[self.current_ns_index].clone();

		debug!("resolving NS {ns_host} for TCP fallback");

		let query = WireCodec::build_query(&ns_host, RecordType::A);
		if query.is_empty() {
			return self.try_next_ns(cx);
		}

		// Use whichever DoH server answered NS_LOOKUP; see the module-level
		// Open Question note on this assumption in DESIGN.md.
		let doh_host = self.current_doh_server().to_owned();
		let actor = cx.access_actor().clone();
		self.submit_doh(cx, doh_host, query, ret_to!([actor], on_doh_result() as (DohResult)));
	}

	fn start_pool_query(&mut self, cx: CX![]) {
		if self.current_ns_index >= self.ns_servers.len() {
			return self.fallback_to_system(cx);
		}

		self.state = BackendState::PoolQuery;
		self.pool_query_via_doh = true;

		let ns_host = self.ns_servers[self.current_ns_index].clone();
		self.start_pool_query_doh(cx, ns_host);
	}

	fn start_pool_query_doh(&mut self, cx: CX![], ns_host: String) {
		debug!("querying {} via DoH to {ns_host}", self.host);

		let query = WireCodec::build_query(&self.host, RecordType::A);

		if query.is_empty() {
			return self.start_ns_resolve(cx);
		}

		let actor = cx.access_actor().clone();
		self.submit_doh(cx, ns_host, query, ret_to!([actor], on_pool_doh_result() as (DohResult)));
	}

	fn start_pool_query_tcp(&mut self, cx: CX![]) {
		if self.ns_entries.is_empty() {
			return self.try_next_ns(cx);
		}

		let (_, ns_ip) = self.ns_entries.last().expect("just checked non-empty").clone();

		let Ok(ip) = ns_ip.parse::<IpAddr>() else {
			return self.try_next_ns(cx);
		};

		debug!("querying {} via TCP to {ns_ip}:53", self.host);

		self.state = BackendState::PoolQuery;
		self.pool_query_via_doh = false;
		// The TCP client owns its own deadline; the per-step timer is idle
		// for the duration of the exchange.
		self.stop_timer(cx);

		let addr = SocketAddr::new(ip, 53);
		let host = self.host.clone();
		let ip_version = self.config.ip_version;
		let timeout = self.config.pool_ns_timeout();
		let actor = cx.access_actor().clone();

		wake::spawn_blocking(
			move || tcp_client::query(addr, &host, ip_version, timeout),
			ret_to!([actor], on_tcp_result() as (Result<DnsRecords>)),
		);
	}

	fn on_doh_result(&mut self, cx: CX![], result: DohResult) {
		if matches!(self.state, BackendState::Idle | BackendState::Fallback | BackendState::PoolQuery) {
			return;
		}

		self.stop_timer(cx);

		if result.status != 200 {
			return match self.state {
				BackendState::NsLookup => {
					self.doh_server_index += 1;
					if self.doh_server_index < 2 {
						self.start_ns_lookup(cx)
					} else {
						self.fallback_to_system(cx)
					}
				}
				BackendState::SimpleDoh => {
					self.doh_server_index += 1;
					if self.doh_server_index < 2 {
						self.start_simple_doh(cx)
					} else {
						self.fallback_to_system(cx)
					}
				}
				BackendState::NsResolve => self.start_pool_query_tcp(cx),
				_ => self.fallback_to_system(cx),
			};
		}

		match self.state {
			BackendState::NsLookup => match WireCodec::parse_response(&result.body, RecordType::Ns) {
				Some(ns_servers) => self.on_ns_lookup_complete(cx, ns_servers),
				None => {
					self.doh_server_index += 1;
					if self.doh_server_index < 2 {
						self.start_ns_lookup(cx);
					} else {
						self.fallback_to_system(cx);
					}
				}
			},
			BackendState::NsResolve => match WireCodec::parse_response(&result.body, RecordType::A) {
				Some(ips) if !ips.is_empty() => {
					let ns_host = self.ns_servers[self.current_ns_index].clone();
					self.ns_entries.push((ns_host, ips[0].clone()));
					self.start_pool_query_tcp(cx);
				}
				_ => self.try_next_ns(cx),
			},
			BackendState::SimpleDoh => match WireCodec::parse_address_records(&result.body, self.config.ip_version) {
				Some(records) => {
					self.records = records;
					self.status = 0;
					self.ts = Some(cx.now());

					let doh_host = self.current_doh_server().to_owned();
					if let Some(record) = self.records.get() {
						info!("{} -> {} (via {doh_host})", self.host, record.ip());
					}

					self.state = BackendState::Idle;
					self.notify(cx);
				}
				None => {
					self.doh_server_index += 1;
					if self.doh_server_index < 2 {
						self.start_simple_doh(cx);
					} else {
						self.fallback_to_system(cx);
					}
				}
			},
			BackendState::PoolQuery | BackendState::Idle | BackendState::Fallback => {}
		}
	}

	fn on_pool_doh_result(&mut self, cx: CX![], result: DohResult) {
		self.stop_timer(cx);

		if self.state != BackendState::PoolQuery {
			return;
		}

		if result.status != 200 {
			info!("DoH to {} failed (status {})", self.ns_servers[self.current_ns_index], result.status);

			if !self.try_tcp_with_cached_ip(cx, result.peer_ip) {
				self.start_ns_resolve(cx);
			}
			return;
		}

		match WireCodec::parse_address_records(&result.body, self.config.ip_version) {
			Some(records) => {
				self.records = records;
				self.status = 0;
				self.ts = Some(cx.now());
				self.on_pool_query_complete(cx, true);
			}
			None => {
				if !self.try_tcp_with_cached_ip(cx, result.peer_ip) {
					self.start_ns_resolve(cx);
				}
			}
		}
	}

	fn try_tcp_with_cached_ip(&mut self, cx: CX![], peer_ip: Option<IpAddr>) -> bool {
		let Some(ip) = peer_ip else { return false };

		let ns_host = self.ns_servers[self.current_ns_index].clone();
		info!("trying TCP to {ip}:53");

		self.ns_entries.push((ns_host, ip.to_string()));
		self.start_pool_query_tcp(cx);
		true
	}

	fn on_tcp_result(&mut self, cx: CX![], result: Result<DnsRecords>) {
		if self.state != BackendState::PoolQuery {
			return;
		}

		match result {
			Ok(records) if !records.is_empty() => {
				self.records = records;
				self.status = 0;
				self.ts = Some(cx.now());
				self.on_pool_query_complete(cx, true);
			}
			_ => self.try_next_ns(cx),
		}
	}

	fn on_pool_query_complete(&mut self, cx: CX![], success: bool) {
		if !success {
			return self.fallback_to_system(cx);
		}

		let method = if self.pool_query_via_doh { "DoH" } else { "TCP" };
		let via = self.ns_servers.get(self.current_ns_index).map(String::as_str).unwrap_or("");

		if self.records.size() > 1 {
			let ips: Vec<String> = self.records.records().iter().map(|r| r.ip()).collect();
			info!("{} -> {} ({} records via {method} to {via})", self.host, ips.join(", "), self.records.size());
		} else if let Some(record) = self.records.get() {
			info!("{} -> {} (via {method} to {via})", self.host, record.ip());
		}

		self.state = BackendState::Idle;
		self.notify(cx);
	}

	fn try_next_ns(&mut self, cx: CX![]) {
		self.current_ns_index += 1;
		self.pool_query_via_doh = true;

		if self.current_ns_index < self.ns_servers.len() {
			self.start_pool_query(cx);
		} else {
			self.fallback_to_simple_doh(cx);
		}
	}

	fn fallback_to_simple_doh(&mut self, cx: CX![]) {
		info!("pool-ns failed for {}, trying simple DoH", self.host);

		// Reset to try both DoH servers fresh at the final fallback tier.
		self.doh_server_index = 0;
		self.start_simple_doh(cx);
	}

	fn start_simple_doh(&mut self, cx: CX![]) {
		self.state = BackendState::SimpleDoh;

		let doh_host = self.current_doh_server().to_owned();
		let query = WireCodec::build_query(&self.host, RecordType::A);

		debug!("resolving {} via {doh_host}", self.host);

		if query.is_empty() {
			return self.fallback_to_system(cx);
		}

		let actor = cx.access_actor().clone();
		self.submit_doh(cx, doh_host, query, ret_to!([actor], on_doh_result() as (DohResult)));
	}

	fn fallback_to_system(&mut self, cx: CX![]) {
		debug!("falling back to system DNS for {}", self.host);

		self.state = BackendState::Fallback;
		self.stop_timer(cx);

		let host = self.host.clone();
		let ip_version = self.config.ip_version;
		let actor = cx.access_actor().clone();

		self.system.resolve(cx, host, ip_version, ret_to!([actor], on_system_result() as (ResolveOutcome)));
	}

	fn on_system_result(&mut self, cx: CX![], outcome: ResolveOutcome) {
		self.status = outcome.status;
		self.records = outcome.records;

		if self.status == 0 {
			self.ts = Some(cx.now());
		}

		self.state = BackendState::Idle;
		self.notify(cx);
	}

	fn notify(&mut self, cx: CX![]) {
		if self.added_to_active_set {
			registry::leave(&self.base_domain);
			self.added_to_active_set = false;
		}

		let error_message = (self.status < 0).then(|| "DNS resolution failed".to_owned());

		for ret in self.queue.drain(..) {
			ret.ret(ResolveOutcome { records: self.records.clone(), status: self.status, error_message: error_message.clone() });
		}

		let _ = cx;
	}

	fn on_timeout(&mut self, cx: CX![]) {
		match self.state {
			BackendState::NsLookup => {
				self.doh_server_index += 1;
				if self.doh_server_index < 2 {
					self.start_ns_lookup(cx);
				} else {
					self.fallback_to_system(cx);
				}
			}
			BackendState::NsResolve => self.try_next_ns(cx),
			BackendState::PoolQuery if self.pool_query_via_doh => self.start_ns_resolve(cx),
			BackendState::PoolQuery => self.try_next_ns(cx),
			// A timeout in SIMPLE_DOH (or any other resting state) goes
			// straight to system fallback without rotating DoH servers,
			// matching the original source's `onTimeout`, which has no
			// SIMPLE_DOH branch at all.
			_ => self.fallback_to_system(cx),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::cell::RefCell;
	use std::collections::VecDeque;
	use std::time::{Duration, Instant};

	use stakker::{actor, call, ret_nop, Actor, Stakker};

	fn push_name(out: &mut Vec<u8>, name: &str) {
		for label in name.split('.') {
			out.push(label.len() as u8);
			out.extend_from_slice(label.as_bytes());
		}
		out.push(0);
	}

	fn craft_message(qname: &str, qtype: RecordType, answers: &[(RecordType, Vec<u8>)]) -> Vec<u8> {
		let mut msg = Vec::new();
		msg.extend_from_slice(&0x1234u16.to_be_bytes());
		msg.extend_from_slice(&0x8180u16.to_be_bytes());
		msg.extend_from_slice(&1u16.to_be_bytes());
		msg.extend_from_slice(&(answers.len() as u16).to_be_bytes());
		msg.extend_from_slice(&0u16.to_be_bytes());
		msg.extend_from_slice(&0u16.to_be_bytes());

		push_name(&mut msg, qname);
		msg.extend_from_slice(&(qtype as u16).to_be_bytes());
		msg.extend_from_slice(&1u16.to_be_bytes());

		for (ty, rdata) in answers {
			push_name(&mut msg, qname);
			msg.extend_from_slice(&(*ty as u16).to_be_bytes());
			msg.extend_from_slice(&1u16.to_be_bytes());
			msg.extend_from_slice(&0u32.to_be_bytes());
			msg.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
			msg.extend_from_slice(rdata);
		}

		msg
	}

	fn ns_rdata(name: &str) -> Vec<u8> {
		let mut out = Vec::new();
		push_name(&mut out, name);
		out
	}

	fn ok(body: Vec<u8>) -> DohResult {
		DohResult { status: 200, body, peer_ip: None }
	}

	fn failed() -> DohResult {
		DohResult { status: 500, body: Vec::new(), peer_ip: None }
	}

	/// A DoH transport driven by a fixed script of canned responses, consumed
	/// one per call in order. Panics if the backend makes more calls than the
	/// test scripted, which is itself a useful assertion about call count.
	struct ScriptedDoh {
		responses: RefCell<VecDeque<DohResult>>,
		hosts: RefCell<Vec<String>>,
	}

	impl ScriptedDoh {
		fn new(responses: Vec<DohResult>) -> Self {
			Self { responses: RefCell::new(responses.into()), hosts: RefCell::new(Vec::new()) }
		}
	}

	impl DohTransport for ScriptedDoh {
		fn post(&self, _cx: CX![], host: String, _body: Vec<u8>, _timeout: Duration, ret: Ret<DohResult>) {
			self.hosts.borrow_mut().push(host);
			let response = self.responses.borrow_mut().pop_front().expect("backend made more DoH calls than this test scripted");
			ret.ret(response);
		}
	}

	/// A `SystemResolver` that always answers with one fixed outcome.
	struct ScriptedSystem {
		outcome: ResolveOutcome,
		calls: RefCell<u32>,
	}

	impl ScriptedSystem {
		fn new(outcome: ResolveOutcome) -> Self {
			Self { outcome, calls: RefCell::new(0) }
		}
	}

	impl SystemResolver for ScriptedSystem {
		fn resolve(&self, _cx: CX![], _host: String, _ip_version: crate::config::IpVersion, ret: Ret<ResolveOutcome>) {
			*self.calls.borrow_mut() += 1;
			ret.ret(self.outcome.clone());
		}
	}

	fn success_outcome(ip: &str) -> ResolveOutcome {
		let record = match ip.parse::<std::net::IpAddr>().unwrap() {
			std::net::IpAddr::V4(v4) => crate::record::DnsRecord::v4(v4),
			std::net::IpAddr::V6(v6) => crate::record::DnsRecord::v6(v6),
		};
		ResolveOutcome { records: DnsRecords::new(vec![record]), status: 0, error_message: None }
	}

	fn failure_outcome() -> ResolveOutcome {
		ResolveOutcome { records: DnsRecords::default(), status: -1, error_message: Some("DNS resolution failed".to_owned()) }
	}

	/// Spins up a fresh `PoolNsBackend` actor, ready to take `resolve` calls.
	fn new_backend(doh: Rc<dyn DohTransport>, system: Rc<dyn SystemResolver>) -> (Stakker, Actor<PoolNsBackend>) {
		let mut stakker = Stakker::new(Instant::now());
		let backend = actor!(stakker, PoolNsBackend::init(doh, system), ret_nop!());
		(stakker, backend)
	}

	/// Enqueues one `resolve` call against an existing actor without running
	/// the stakker queue, so callers can stack up overlapping calls before
	/// anything executes.
	fn submit(stakker: &mut Stakker, backend: &Actor<PoolNsBackend>, host: &str, config: DnsConfig) -> Rc<RefCell<Option<ResolveOutcome>>> {
		let outcome: Rc<RefCell<Option<ResolveOutcome>>> = Rc::new(RefCell::new(None));
		let slot = outcome.clone();
		call!([backend], resolve(host.to_owned(), config, Ret::new(move |o: ResolveOutcome| *slot.borrow_mut() = Some(o))));
		outcome
	}

	/// Drains the stakker queue until every slot has a reply or the tick
	/// budget runs out.
	fn drain_until_all_filled(stakker: &mut Stakker, slots: &[&Rc<RefCell<Option<ResolveOutcome>>>]) {
		let mut t = Instant::now();
		for _ in 0..20 {
			stakker.run(t, false);
			if slots.iter().all(|slot| slot.borrow().is_some()) {
				break;
			}
			t += Duration::from_millis(50);
		}
	}

	/// Spins up a fresh `PoolNsBackend`, kicks off one `resolve`, and drains
	/// the stakker queue until the reply fires or the tick budget runs out.
	fn run_resolve(doh: Rc<dyn DohTransport>, system: Rc<dyn SystemResolver>, host: &str, config: DnsConfig) -> ResolveOutcome {
		let (mut stakker, backend) = new_backend(doh, system);
		let outcome = submit(&mut stakker, &backend, host, config);
		drain_until_all_filled(&mut stakker, &[&outcome]);
		outcome.borrow_mut().take().expect("resolution should have completed within the test's tick budget")
	}

	#[test]
	fn s1_happy_path_resolves_via_pool_ns_doh() {
		let doh = Rc::new(ScriptedDoh::new(vec![
			ok(craft_message("example.com", RecordType::Ns, &[(RecordType::Ns, ns_rdata("ns1.pool.example.com"))])),
			ok(craft_message("xmr.pool.example.com", RecordType::A, &[(RecordType::A, vec![203, 0, 113, 5])])),
		]));
		let system = Rc::new(ScriptedSystem::new(failure_outcome()));

		let outcome = run_resolve(doh.clone(), system.clone(), "xmr.pool.example.com", DnsConfig::default());

		assert_eq!(outcome.status, 0);
		assert_eq!(outcome.records.get().unwrap().ip(), "203.0.113.5");
		assert_eq!(*doh.hosts.borrow(), vec!["dns.google".to_owned(), "ns1.pool.example.com".to_owned()]);
		assert_eq!(*system.calls.borrow(), 0);
	}

	#[test]
	fn s3_ns_and_tcp_exhausted_falls_back_to_simple_doh() {
		let doh = Rc::new(ScriptedDoh::new(vec![
			ok(craft_message("example.com", RecordType::Ns, &[(RecordType::Ns, ns_rdata("ns1.pool.example.com"))])),
			failed(),
			failed(),
			ok(craft_message("xmr.pool.example.com", RecordType::A, &[(RecordType::A, vec![198, 51, 100, 9])])),
		]));
		let system = Rc::new(ScriptedSystem::new(failure_outcome()));

		let outcome = run_resolve(doh.clone(), system.clone(), "xmr.pool.example.com", DnsConfig::default());

		assert_eq!(outcome.status, 0);
		assert_eq!(outcome.records.get().unwrap().ip(), "198.51.100.9");
		assert_eq!(doh.hosts.borrow().len(), 4);
		assert_eq!(*system.calls.borrow(), 0);
	}

	#[test]
	fn s4_both_doh_servers_failing_falls_back_to_system() {
		let doh = Rc::new(ScriptedDoh::new(vec![failed(), failed()]));
		let system = Rc::new(ScriptedSystem::new(failure_outcome()));

		let outcome = run_resolve(doh.clone(), system.clone(), "xmr.pool.example.com", DnsConfig::default());

		assert_eq!(outcome.status, -1);
		assert_eq!(*doh.hosts.borrow(), vec!["dns.google".to_owned(), "dns.nextdns.io".to_owned()]);
		assert_eq!(*system.calls.borrow(), 1);
	}

	#[test]
	fn s5_ip_literal_bypasses_pool_ns_entirely() {
		let doh = Rc::new(ScriptedDoh::new(Vec::new()));
		let system = Rc::new(ScriptedSystem::new(success_outcome("203.0.113.9")));

		let outcome = run_resolve(doh.clone(), system.clone(), "203.0.113.9", DnsConfig::default());

		assert_eq!(outcome.status, 0);
		assert!(doh.hosts.borrow().is_empty());
		assert_eq!(*system.calls.borrow(), 1);
	}

	#[test]
	fn s6_recursion_guard_skips_straight_to_simple_doh() {
		registry::enter("example.com");

		let doh = Rc::new(ScriptedDoh::new(vec![ok(craft_message(
			"xmr.pool.example.com",
			RecordType::A,
			&[(RecordType::A, vec![192, 0, 2, 7])],
		))]));
		let system = Rc::new(ScriptedSystem::new(failure_outcome()));

		let outcome = run_resolve(doh.clone(), system.clone(), "xmr.pool.example.com", DnsConfig::default());
		registry::leave("example.com");

		assert_eq!(outcome.status, 0);
		assert_eq!(outcome.records.get().unwrap().ip(), "192.0.2.7");
		assert_eq!(doh.hosts.borrow().len(), 1, "recursion guard should skip the NS lookup round trip entirely");
	}

	#[test]
	fn timeout_with_no_response_eventually_falls_back_to_system() {
		struct HangingDoh {
			calls: RefCell<u32>,
		}

		impl DohTransport for HangingDoh {
			fn post(&self, _cx: CX![], _host: String, _body: Vec<u8>, _timeout: Duration, _ret: Ret<DohResult>) {
				// Never resolves `ret`; only the per-step timer can move the
				// state machine forward from here.
				*self.calls.borrow_mut() += 1;
			}
		}

		let doh = Rc::new(HangingDoh { calls: RefCell::new(0) });
		let system = Rc::new(ScriptedSystem::new(failure_outcome()));
		let config = DnsConfig { pool_ns_timeout_ms: 10, ..DnsConfig::default() };

		let outcome = run_resolve(doh.clone(), system.clone(), "xmr.pool.example.com", config);

		assert_eq!(outcome.status, -1);
		assert_eq!(*doh.calls.borrow(), 2, "both DoH servers should time out before falling back");
		assert_eq!(*system.calls.borrow(), 1);
	}

	#[test]
	fn cache_hit_within_ttl_returns_cached_records_without_a_second_query() {
		/// A `SystemResolver` that blows up if it's ever asked twice, proving
		/// a cache hit doesn't reach the network at all.
		struct PanicsOnSecondCall {
			outcome: ResolveOutcome,
			calls: RefCell<u32>,
		}

		impl SystemResolver for PanicsOnSecondCall {
			fn resolve(&self, _cx: CX![], _host: String, _ip_version: crate::config::IpVersion, ret: Ret<ResolveOutcome>) {
				let mut calls = self.calls.borrow_mut();
				assert_eq!(*calls, 0, "system resolver should not be queried again while the cache is fresh");
				*calls += 1;
				ret.ret(self.outcome.clone());
			}
		}

		let doh = Rc::new(ScriptedDoh::new(Vec::new()));
		let system = Rc::new(PanicsOnSecondCall { outcome: success_outcome("203.0.113.9"), calls: RefCell::new(0) });
		let (mut stakker, backend) = new_backend(doh, system);

		let first = submit(&mut stakker, &backend, "203.0.113.9", DnsConfig::default());
		drain_until_all_filled(&mut stakker, &[&first]);
		let first = first.borrow_mut().take().unwrap();

		let second = submit(&mut stakker, &backend, "203.0.113.9", DnsConfig::default());
		drain_until_all_filled(&mut stakker, &[&second]);
		let second = second.borrow_mut().take().unwrap();

		assert_eq!(first.status, 0);
		assert_eq!(second.status, 0);
		assert_eq!(second.records.get().unwrap().ip(), first.records.get().unwrap().ip());
	}

	#[test]
	fn overlapping_resolves_single_flight_onto_one_completion() {
		let doh = Rc::new(ScriptedDoh::new(vec![
			ok(craft_message("example.com", RecordType::Ns, &[(RecordType::Ns, ns_rdata("ns1.pool.example.com"))])),
			ok(craft_message("xmr.pool.example.com", RecordType::A, &[(RecordType::A, vec![203, 0, 113, 5])])),
		]));
		let system = Rc::new(ScriptedSystem::new(failure_outcome()));
		let (mut stakker, backend) = new_backend(doh.clone(), system);

		// Both calls are enqueued before the stakker queue runs at all, so the
		// second one lands while the first is still mid-flight.
		let first = submit(&mut stakker, &backend, "xmr.pool.example.com", DnsConfig::default());
		let second = submit(&mut stakker, &backend, "xmr.pool.example.com", DnsConfig::default());

		drain_until_all_filled(&mut stakker, &[&first, &second]);

		let first = first.borrow_mut().take().unwrap();
		let second = second.borrow_mut().take().unwrap();

		assert_eq!(first.status, 0);
		assert_eq!(second.status, 0);
		assert_eq!(first.records.get().unwrap().ip(), "203.0.113.5");
		assert_eq!(second.records.get().unwrap().ip(), "203.0.113.5");
		assert_eq!(doh.hosts.borrow().len(), 2, "the queued caller should ride the in-flight lookup, not start its own");
	}
}

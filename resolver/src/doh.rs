use core::net::IpAddr;
use core::time::Duration;
use std::sync::OnceLock;

use log::error;
use stakker::{Ret, CX};

use runtime::wake;

pub const DOH_PATH: &str = "/dns-query";

/// The result of one DoH round-trip, delivered exactly once.
#[derive(Debug, Clone)]
pub struct DohResult {
	pub status: u16,
	pub body: Vec<u8>,
	/// The TCP peer IP used for the connection, so a failed DoH parse can be
	/// retried over TCP/53 against the same server without a second lookup.
	pub peer_ip: Option<IpAddr>,
}

/// The request/response shape `PoolNsBackend` needs from a DoH transport.
/// Narrow on purpose: this is the only contract the state machine depends
/// on, so tests can substitute a fake without pulling in TLS or HTTP/2.
pub trait DohTransport {
	fn post(&self, cx: CX![], host: String, body: Vec<u8>, timeout: Duration, ret: Ret<DohResult>);
}

/// A `reqwest`-backed transport. TLS is rustls, ALPN prefers `h2`; dispatch
/// happens on a worker thread (see `runtime::wake::spawn_blocking`) so a slow
/// or hung DoH server never blocks the event loop.
pub struct ReqwestDohTransport;

impl ReqwestDohTransport {
	pub fn new() -> Self {
		Self
	}

	fn client() -> &'static reqwest::blocking::Client {
		static CLIENT: OnceLock<reqwest::blocking::Client> = OnceLock::new();

		CLIENT.get_or_init(|| {
			reqwest::blocking::Client::builder()
				.use_rustls_tls()
				.build()
				.expect("building a rustls-backed reqwest client never fails at this configuration")
		})
	}
}

impl Default for ReqwestDohTransport {
	fn default() -> Self {
		Self::new()
	}
}

impl DohTransport for ReqwestDohTransport {
	fn post(&self, _cx: CX![], host: String, body: Vec<u8>, timeout: Duration, ret: Ret<DohResult>) {
		wake::spawn_blocking(
			move || {
				let url = format!("https://{host}/dns-query");

				let response = Self::client()
					.post(&url)
					.header("Content-Type", "application/dns-message")
					.header("Accept", "application/dns-message")
					.timeout(timeout)
					.body(body)
					.send();

				match response {
					Ok(response) => {
						let status = response.status().as_u16();
						let peer_ip = response.remote_addr().map(|addr| addr.ip());
						let body = response.bytes().map(|b| b.to_vec()).unwrap_or_default();

						DohResult { status, body, peer_ip }
					}
					Err(err) => {
						error!("DoH request to {host} failed: {err}");
						DohResult { status: 0, body: Vec::new(), peer_ip: None }
					}
				}
			},
			ret,
		);
	}
}

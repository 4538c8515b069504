use core::time::Duration;

use serde::Deserialize;

/// Address-family filter applied when collecting `A`/`AAAA` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpVersion {
	#[default]
	Any,
	V4,
	V6,
}

impl<'de> Deserialize<'de> for IpVersion {
	fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
		match u32::deserialize(de)? {
			4 => Ok(IpVersion::V4),
			6 => Ok(IpVersion::V6),
			_ => Ok(IpVersion::Any),
		}
	}
}

fn default_ttl_ms() -> u64 {
	30_000
}

fn default_pool_ns_enabled() -> bool {
	true
}

fn default_pool_ns_timeout_ms() -> u64 {
	1_000
}

fn default_doh_primary() -> String {
	"dns.google".to_owned()
}

fn default_doh_fallback() -> String {
	"dns.nextdns.io".to_owned()
}

/// Resolved DNS configuration. Loading the surrounding JSON document is out
/// of scope here; this only models the already-resolved option set under the
/// `dns` key.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
	#[serde(rename = "ip_version", default)]
	pub ip_version: IpVersion,

	#[serde(rename = "ttl", default = "default_ttl_ms_secs")]
	ttl_secs: u64,

	#[serde(rename = "pool-ns", default = "default_pool_ns_enabled")]
	pub pool_ns_enabled: bool,

	#[serde(rename = "pool-ns-timeout", default = "default_pool_ns_timeout_ms")]
	pub pool_ns_timeout_ms: u64,

	#[serde(rename = "doh-primary", default = "default_doh_primary")]
	pub doh_primary: String,

	#[serde(rename = "doh-fallback", default = "default_doh_fallback")]
	pub doh_fallback: String,
}

fn default_ttl_ms_secs() -> u64 {
	30
}

impl Default for DnsConfig {
	fn default() -> Self {
		Self {
			ip_version: IpVersion::Any,
			ttl_secs: default_ttl_ms_secs(),
			pool_ns_enabled: default_pool_ns_enabled(),
			pool_ns_timeout_ms: default_pool_ns_timeout_ms(),
			doh_primary: default_doh_primary(),
			doh_fallback: default_doh_fallback(),
		}
	}
}

impl DnsConfig {
	/// Cache TTL, floored at one second like the source's `std::max(ttl, 1)`.
	pub fn ttl(&self) -> Duration {
		Duration::from_secs(self.ttl_secs.max(1))
	}

	pub fn pool_ns_timeout(&self) -> Duration {
		Duration::from_millis(self.pool_ns_timeout_ms)
	}

	pub fn is_doh_server(&self, host: &str) -> bool {
		host == self.doh_primary || host == self.doh_fallback
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_spec() {
		let config = DnsConfig::default();
		assert_eq!(config.ip_version, IpVersion::Any);
		assert_eq!(config.ttl(), Duration::from_secs(30));
		assert!(config.pool_ns_enabled);
		assert_eq!(config.pool_ns_timeout_ms, 1000);
		assert_eq!(config.doh_primary, "dns.google");
		assert_eq!(config.doh_fallback, "dns.nextdns.io");
	}

	#[test]
	fn ttl_is_floored_at_one_second() {
		let config = DnsConfig { ttl_secs: 0, ..DnsConfig::default() };
		assert_eq!(config.ttl(), Duration::from_secs(1));
	}

	#[test]
	fn deserializes_hyphenated_json_keys() {
		let json = r#"{"ip_version":6,"ttl":60,"pool-ns":false,"pool-ns-timeout":2000,"doh-primary":"a","doh-fallback":"b"}"#;
		let config: DnsConfig = serde_json::from_str(json).expect("valid JSON");
		assert_eq!(config.ip_version, IpVersion::V6);
		assert_eq!(config.ttl(), Duration::from_secs(60));
		assert!(!config.pool_ns_enabled);
		assert_eq!(config.pool_ns_timeout_ms, 2000);
		assert_eq!(config.doh_primary, "a");
		assert_eq!(config.doh_fallback, "b");
	}
}

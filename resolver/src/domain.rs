use core::net::IpAddr;

/// Detect IP literals and extract the registered base domain of a hostname.
///
/// No Public Suffix List lookup is performed; `base_domain` is the last two
/// dot-separated labels, which is sufficient for the common pool hostnames
/// this resolver cares about.
pub struct DomainUtils;

impl DomainUtils {
	pub fn is_ip(host: &str) -> bool {
		!host.is_empty() && host.parse::<IpAddr>().is_ok()
	}

	pub fn base_domain(host: &str) -> String {
		if host.is_empty() || Self::is_ip(host) {
			return host.to_owned();
		}

		let parts: Vec<&str> = host.split('.').collect();

		if parts.len() <= 2 {
			return host.to_owned();
		}

		format!("{}.{}", parts[parts.len() - 2], parts[parts.len() - 1])
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn recognises_ipv4_and_ipv6_literals() {
		assert!(DomainUtils::is_ip("10.0.0.1"));
		assert!(DomainUtils::is_ip("::1"));
		assert!(DomainUtils::is_ip("2001:db8::1"));
		assert!(!DomainUtils::is_ip("xmr.pool.example.com"));
		assert!(!DomainUtils::is_ip(""));
	}

	#[test]
	fn base_domain_keeps_last_two_labels() {
		assert_eq!(DomainUtils::base_domain("xmr.pool.example.com"), "example.com");
		assert_eq!(DomainUtils::base_domain("example.com"), "example.com");
		assert_eq!(DomainUtils::base_domain("localhost"), "localhost");
		assert_eq!(DomainUtils::base_domain(""), "");
	}

	#[test]
	fn base_domain_passes_through_ip_literals() {
		assert_eq!(DomainUtils::base_domain("10.0.0.1"), "10.0.0.1");
	}
}

//! Authoritative-first DNS resolution for pool hostnames: look up the base
//! domain's NS records over DoH, query one of those name servers directly
//! (DoH, then TCP/53), and fall back through simple DoH to the system
//! resolver when the authoritative path can't be completed.

mod backend;
mod config;
mod doh;
mod domain;
mod record;
mod registry;
mod system;
mod tcp_client;
mod wire;

pub use config::{DnsConfig, IpVersion};
pub use doh::{DohResult, DohTransport, ReqwestDohTransport, DOH_PATH};
pub use domain::DomainUtils;
pub use record::{DnsRecord, DnsRecords};
pub use registry::{ResolveOutcome, Registry};
pub use system::{DefaultSystemResolver, SystemResolver};
pub use wire::{RecordType, WireCodec};

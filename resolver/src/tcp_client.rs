use core::net::SocketAddr;
use core::time::Duration;
use std::io::{Read, Write};
use std::net::TcpStream;

use log::debug;
use utils::error::Result;

use crate::config::IpVersion;
use crate::record::DnsRecords;
use crate::wire::{RecordType, WireCodec};

const MIN_MESSAGE_LEN: usize = 12;
const MAX_MESSAGE_LEN: usize = 65535;

/// A one-shot DNS/TCP query: connect, `TCP_NODELAY`, send one length-prefixed
/// query, accumulate the length-prefixed reply, and parse it.
///
/// This runs synchronously on a worker thread (dispatched by the caller
/// through `runtime::wake::spawn_blocking`) rather than through the event
/// loop's poll reactor, since it is a single blocking round-trip with one
/// deadline covering connect, send, and recv alike — the socket is a local
/// variable here and is always closed before a result is produced, which is
/// what the "close handles before invoking the callback" rule is protecting
/// against in the first place.
pub fn query(addr: SocketAddr, host: &str, ip_version: IpVersion, timeout: Duration) -> Result<DnsRecords> {
	let deadline = std::time::Instant::now() + timeout;

	let mut stream = TcpStream::connect_timeout(&addr, timeout).map_err(|err| debug!("TCP connect to {addr} failed: {err}"))?;

	stream.set_nodelay(true).ok();

	let qtype = if matches!(ip_version, IpVersion::V6) { RecordType::Aaaa } else { RecordType::A };
	let message = WireCodec::build_query(host, qtype);

	if message.is_empty() {
		return Err(());
	}

	let mut framed = Vec::with_capacity(2 + message.len());
	framed.extend_from_slice(&(message.len() as u16).to_be_bytes());
	framed.extend_from_slice(&message);

	set_remaining_timeout(&stream, deadline)?;
	stream.write_all(&framed).map_err(|err| debug!("TCP write to {addr} failed: {err}"))?;

	let mut recv_buf = Vec::new();
	let mut chunk = [0u8; 1500];
	let mut expected_len: Option<usize> = None;

	loop {
		if let Some(len) = expected_len {
			if recv_buf.len() >= 2 + len {
				break;
			}
		}

		set_remaining_timeout(&stream, deadline)?;

		let n = stream.read(&mut chunk).map_err(|err| debug!("TCP read from {addr} failed: {err}"))?;

		if n == 0 {
			debug!("TCP connection to {addr} closed before a complete reply arrived");
			return Err(());
		}

		recv_buf.extend_from_slice(&chunk[..n]);

		if expected_len.is_none() && recv_buf.len() >= 2 {
			let len = u16::from_be_bytes([recv_buf[0], recv_buf[1]]) as usize;

			if !(MIN_MESSAGE_LEN..=MAX_MESSAGE_LEN).contains(&len) {
				debug!("TCP reply from {addr} declared an out-of-range length {len}");
				return Err(());
			}

			expected_len = Some(len);
		}
	}

	let len = expected_len.expect("loop only exits once the expected length is known");
	WireCodec::parse_address_records(&recv_buf[2..2 + len], ip_version).ok_or(())
}

fn set_remaining_timeout(stream: &TcpStream, deadline: std::time::Instant) -> Result<()> {
	let remaining = deadline.saturating_duration_since(std::time::Instant::now());

	if remaining.is_zero() {
		debug!("TCP query timed out");
		return Err(());
	}

	stream.set_read_timeout(Some(remaining)).map_err(|err| debug!("Failed to set TCP read timeout: {err}"))?;
	stream.set_write_timeout(Some(remaining)).map_err(|err| debug!("Failed to set TCP write timeout: {err}"))
}

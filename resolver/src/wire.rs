use core::net::{Ipv4Addr, Ipv6Addr};

use crate::config::IpVersion;
use crate::record::{DnsRecord, DnsRecords};

const HEADER_LEN: usize = 12;
const CLASS_IN: u16 = 1;
const MAX_JUMPS: u8 = 10;

/// The record types this resolver ever builds queries for or matches on parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
	A = 1,
	Ns = 2,
	Cname = 5,
	Aaaa = 28,
}

/// Builds and parses the classic DNS wire format (RFC 1035), the same bytes
/// carried by UDP/TCP/53 and by a DoH request body.
///
/// Parsing operates on untrusted network input, so every offset is checked
/// against the buffer length before a byte is read; malformed input returns
/// `None`/`false` rather than panicking.
pub struct WireCodec;

impl WireCodec {
	/// Builds a query message. Returns an empty vector on encoding failure
	/// (a label longer than 63 bytes).
	pub fn build_query(name: &str, qtype: RecordType) -> Vec<u8> {
		let mut query = Vec::with_capacity(512);

		let id: u16 = rand::random();
		query.extend_from_slice(&id.to_be_bytes());

		// Standard query, recursion desired.
		query.extend_from_slice(&[0x01, 0x00]);
		// QDCOUNT = 1, ANCOUNT/NSCOUNT/ARCOUNT = 0.
		query.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

		if !encode_name(name, &mut query) {
			return Vec::new();
		}

		query.extend_from_slice(&(qtype as u16).to_be_bytes());
		query.extend_from_slice(&CLASS_IN.to_be_bytes());

		query
	}

	/// Parses a response looking for records of `want_type`, returning their
	/// string representation (dotted-quad/v6 for address types, domain names
	/// for `NS`/`CNAME`). Succeeds iff at least one matching record was
	/// collected.
	pub fn parse_response(data: &[u8], want_type: RecordType) -> Option<Vec<String>> {
		if data.len() < HEADER_LEN {
			return None;
		}

		let flags = read_u16(data, 2)?;
		let qdcount = read_u16(data, 4)?;
		let ancount = read_u16(data, 6)?;

		if flags & 0x000F != 0 {
			return None;
		}

		let mut offset = HEADER_LEN;

		for _ in 0..qdcount {
			let (_, next) = decode_name(data, offset)?;
			offset = next.checked_add(4)?;

			if offset > data.len() {
				return None;
			}
		}

		let mut results = Vec::new();

		for _ in 0..ancount {
			if offset.checked_add(10).map_or(true, |end| end > data.len()) {
				return None;
			}

			let (_, name_end) = decode_name(data, offset)?;
			offset = name_end;

			let atype = read_u16(data, offset)?;
			offset += 8;

			let rdlength = read_u16(data, offset)? as usize;
			offset += 2;

			if offset.checked_add(rdlength).map_or(true, |end| end > data.len()) {
				return None;
			}

			if atype == want_type as u16 {
				match want_type {
					RecordType::Ns | RecordType::Cname => {
						if let Some((name, _)) = decode_name(data, offset) {
							results.push(name);
						}
					}
					RecordType::A if rdlength == 4 => {
						results.push(Ipv4Addr::new(data[offset], data[offset + 1], data[offset + 2], data[offset + 3]).to_string());
					}
					RecordType::Aaaa if rdlength == 16 => {
						let mut octets = [0u8; 16];
						octets.copy_from_slice(&data[offset..offset + 16]);
						results.push(Ipv6Addr::from(octets).to_string());
					}
					_ => {}
				}
			}

			offset += rdlength;
		}

		if results.is_empty() {
			None
		} else {
			Some(results)
		}
	}

	/// Parses `A`/`AAAA` answers honoring `ip_version`, preserving response
	/// order. Unlike `parse_response`, a malformed trailing answer stops
	/// collection but keeps whatever was already gathered, matching the
	/// source's `addrinfo` list assembly.
	pub fn parse_address_records(data: &[u8], ip_version: IpVersion) -> Option<DnsRecords> {
		if data.len() < HEADER_LEN {
			return None;
		}

		let flags = read_u16(data, 2)?;
		let qdcount = read_u16(data, 4)?;
		let ancount = read_u16(data, 6)?;

		if flags & 0x000F != 0 {
			return None;
		}

		let mut offset = HEADER_LEN;

		for _ in 0..qdcount {
			let (_, next) = decode_name(data, offset)?;
			offset = next.checked_add(4)?;

			if offset > data.len() {
				return None;
			}
		}

		let mut records = Vec::new();

		for _ in 0..ancount {
			if offset.checked_add(10).map_or(true, |end| end > data.len()) {
				break;
			}

			let Some((_, name_end)) = decode_name(data, offset) else { break };
			offset = name_end;

			let Some(atype) = read_u16(data, offset) else { break };
			offset += 8;

			let Some(rdlength) = read_u16(data, offset) else { break };
			let rdlength = rdlength as usize;
			offset += 2;

			if offset.checked_add(rdlength).map_or(true, |end| end > data.len()) {
				break;
			}

			if atype == RecordType::A as u16 && rdlength == 4 && matches!(ip_version, IpVersion::Any | IpVersion::V4) {
				records.push(DnsRecord::v4(Ipv4Addr::new(data[offset], data[offset + 1], data[offset + 2], data[offset + 3])));
			} else if atype == RecordType::Aaaa as u16 && rdlength == 16 && matches!(ip_version, IpVersion::Any | IpVersion::V6) {
				let mut octets = [0u8; 16];
				octets.copy_from_slice(&data[offset..offset + 16]);
				records.push(DnsRecord::v6(Ipv6Addr::from(octets)));
			}

			offset += rdlength;
		}

		if records.is_empty() {
			None
		} else {
			Some(DnsRecords::new(records))
		}
	}
}

fn encode_name(name: &str, out: &mut Vec<u8>) -> bool {
	if name.is_empty() {
		out.push(0);
		return true;
	}

	for label in name.split('.') {
		if label.len() > 63 {
			return false;
		}

		out.push(label.len() as u8);
		out.extend_from_slice(label.as_bytes());
	}

	out.push(0);
	true
}

/// Decodes a possibly-compressed name starting at `offset`. Returns the name
/// and the offset immediately following it in the *original* message (i.e.
/// the position after a compression pointer, not after whatever it points
/// to), so callers can continue parsing fixed-size fields that follow.
fn decode_name(data: &[u8], offset: usize) -> Option<(String, usize)> {
	let mut labels: Vec<&[u8]> = Vec::new();
	let mut pos = offset;
	let mut jumped = false;
	let mut next_offset = None;
	let mut jumps_left = MAX_JUMPS;

	loop {
		if pos >= data.len() {
			return None;
		}

		let label_len = data[pos];

		if label_len == 0 {
			if !jumped {
				next_offset = Some(pos + 1);
			}
			break;
		}

		if label_len & 0xC0 == 0xC0 {
			if jumps_left == 0 {
				return None;
			}

			let hi = data.get(pos + 1)?;
			if !jumped {
				next_offset = Some(pos + 2);
			}

			pos = (((label_len & 0x3F) as usize) << 8) | *hi as usize;
			jumped = true;
			jumps_left -= 1;
			continue;
		}

		let label_start = pos + 1;
		let label_end = label_start.checked_add(label_len as usize)?;

		if label_end > data.len() {
			return None;
		}

		labels.push(&data[label_start..label_end]);
		pos = label_end;
	}

	let name = labels.iter().map(|l| String::from_utf8_lossy(l)).collect::<Vec<_>>().join(".");

	Some((name, next_offset.unwrap_or(pos + 1)))
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
	let bytes = data.get(offset..offset + 2)?;
	Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn push_name(out: &mut Vec<u8>, name: &str) {
		encode_name(name, out);
	}

	fn craft_response(qname: &str, qtype: RecordType, answers: &[(RecordType, Vec<u8>)]) -> Vec<u8> {
		let mut msg = Vec::new();
		msg.extend_from_slice(&0x1234u16.to_be_bytes());
		msg.extend_from_slice(&0x8180u16.to_be_bytes());
		msg.extend_from_slice(&1u16.to_be_bytes());
		msg.extend_from_slice(&(answers.len() as u16).to_be_bytes());
		msg.extend_from_slice(&0u16.to_be_bytes());
		msg.extend_from_slice(&0u16.to_be_bytes());

		push_name(&mut msg, qname);
		msg.extend_from_slice(&(qtype as u16).to_be_bytes());
		msg.extend_from_slice(&CLASS_IN.to_be_bytes());

		for (ty, rdata) in answers {
			push_name(&mut msg, qname);
			msg.extend_from_slice(&(*ty as u16).to_be_bytes());
			msg.extend_from_slice(&CLASS_IN.to_be_bytes());
			msg.extend_from_slice(&0u32.to_be_bytes());
			msg.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
			msg.extend_from_slice(rdata);
		}

		msg
	}

	#[test]
	fn build_query_rejects_overlong_labels() {
		let long_label = "a".repeat(64);
		assert!(WireCodec::build_query(&long_label, RecordType::A).is_empty());
	}

	#[test]
	fn build_query_shape() {
		let query = WireCodec::build_query("example.com", RecordType::A);
		assert!(!query.is_empty());
		assert_eq!(&query[2..4], &[0x01, 0x00]);
		assert_eq!(&query[4..6], &1u16.to_be_bytes());
	}

	#[test]
	fn round_trips_an_a_record() {
		let msg = craft_response("example.com", RecordType::A, &[(RecordType::A, vec![203, 0, 113, 5])]);
		let results = WireCodec::parse_response(&msg, RecordType::A).unwrap();
		assert_eq!(results, vec!["203.0.113.5".to_owned()]);
	}

	#[test]
	fn round_trips_ns_records() {
		let msg = craft_response("example.com", RecordType::Ns, &[(RecordType::Ns, {
			let mut out = Vec::new();
			push_name(&mut out, "ns1.example.com");
			out
		})]);

		let results = WireCodec::parse_response(&msg, RecordType::Ns).unwrap();
		assert_eq!(results, vec!["ns1.example.com".to_owned()]);
	}

	#[test]
	fn parse_response_rejects_nonzero_rcode() {
		let mut msg = craft_response("example.com", RecordType::A, &[(RecordType::A, vec![1, 2, 3, 4])]);
		msg[3] = 0x82; // RCODE = 2 (server failure)
		assert!(WireCodec::parse_response(&msg, RecordType::A).is_none());
	}

	#[test]
	fn parse_response_fails_on_truncated_buffer() {
		let msg = craft_response("example.com", RecordType::A, &[(RecordType::A, vec![203, 0, 113, 5])]);
		assert!(WireCodec::parse_response(&msg[..msg.len() - 2], RecordType::A).is_none());
	}

	#[test]
	fn name_decoder_rejects_pointer_loops() {
		// Two bytes forming a compression pointer to itself.
		let mut msg = craft_response("example.com", RecordType::A, &[]);
		let qname_pos = HEADER_LEN;
		msg[qname_pos] = 0xC0;
		msg[qname_pos + 1] = qname_pos as u8;

		assert!(WireCodec::parse_response(&msg, RecordType::A).is_none());
	}

	#[test]
	fn parse_address_records_honors_ip_version_filter() {
		let msg = craft_response(
			"pool.example.com",
			RecordType::A,
			&[(RecordType::A, vec![203, 0, 113, 5]), (RecordType::Aaaa, vec![0; 16])],
		);

		let v4_only = WireCodec::parse_address_records(&msg, IpVersion::V4).unwrap();
		assert_eq!(v4_only.size(), 1);

		let any = WireCodec::parse_address_records(&msg, IpVersion::Any).unwrap();
		assert_eq!(any.size(), 2);
	}

	#[test]
	fn parse_address_records_keeps_response_order() {
		let msg = craft_response(
			"pool.example.com",
			RecordType::A,
			&[(RecordType::A, vec![203, 0, 113, 5]), (RecordType::A, vec![203, 0, 113, 6])],
		);

		let records = WireCodec::parse_address_records(&msg, IpVersion::Any).unwrap();
		assert_eq!(records.get().unwrap().ip(), "203.0.113.5");
	}
}

//! Just enough of the Thrift binary protocol to synthesize application
//! exceptions and to pull the sequence id out of a request payload. The
//! routing layer treats the result as opaque bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const MSG_CALL: u8 = 1;
pub const MSG_REPLY: u8 = 2;
pub const MSG_EXCEPTION: u8 = 3;

pub const EXC_UNKNOWN_APPLICATION: i32 = 0;
pub const EXC_INTERNAL_ERROR: i32 = 6;

const VERSION_1: u32 = 0x8001_0000;
const VERSION_MASK: u32 = 0xffff_0000;

const TYPE_STOP: u8 = 0;
const TYPE_I32: u8 = 8;
const TYPE_STRING: u8 = 11;

#[derive(Debug, thiserror::Error)]
pub enum ThriftError {
	#[error("truncated message header")]
	Truncated,
	#[error("unsupported protocol version {0:#010x}")]
	BadVersion(u32),
	#[error("method name is not utf-8")]
	BadName,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
	pub name: String,
	pub message_type: u8,
	pub seq_id: i32,
}

/// Reads a message header, accepting both the strict (versioned) and the
/// old unversioned encoding.
pub fn read_message_begin(buf: &[u8]) -> Result<MessageHeader, ThriftError> {
	let mut b = buf;
	if b.remaining() < 4 {
		return Err(ThriftError::Truncated);
	}
	let first = b.get_i32();
	if first < 0 {
		let version = first as u32 & VERSION_MASK;
		if version != VERSION_1 {
			return Err(ThriftError::BadVersion(version));
		}
		let message_type = (first & 0xff) as u8;
		let name = read_string(&mut b)?;
		if b.remaining() < 4 {
			return Err(ThriftError::Truncated);
		}
		Ok(MessageHeader {
			name,
			message_type,
			seq_id: b.get_i32(),
		})
	} else {
		// Unversioned: the leading i32 is the method name length.
		let len = first as usize;
		if b.remaining() < len + 5 {
			return Err(ThriftError::Truncated);
		}
		let name = String::from_utf8(b.copy_to_bytes(len).to_vec())
			.map_err(|_| ThriftError::BadName)?;
		let message_type = b.get_u8();
		Ok(MessageHeader {
			name,
			message_type,
			seq_id: b.get_i32(),
		})
	}
}

/// Sequence id of a request payload, or 0 when the header cannot be parsed.
pub fn seq_id(payload: &[u8]) -> i32 {
	read_message_begin(payload).map(|h| h.seq_id).unwrap_or(0)
}

fn read_string(b: &mut &[u8]) -> Result<String, ThriftError> {
	if b.remaining() < 4 {
		return Err(ThriftError::Truncated);
	}
	let len = b.get_i32();
	if len < 0 || b.remaining() < len as usize {
		return Err(ThriftError::Truncated);
	}
	String::from_utf8(b.copy_to_bytes(len as usize).to_vec()).map_err(|_| ThriftError::BadName)
}

fn write_message_begin(buf: &mut BytesMut, name: &str, message_type: u8, seq_id: i32) {
	buf.put_u32(VERSION_1 | message_type as u32);
	buf.put_i32(name.len() as i32);
	buf.put_slice(name.as_bytes());
	buf.put_i32(seq_id);
}

fn encode_exception(name: &str, seq_id: i32, code: i32, message: &str) -> Bytes {
	let mut buf = BytesMut::with_capacity(32 + name.len() + message.len());
	write_message_begin(&mut buf, name, MSG_EXCEPTION, seq_id);
	// TApplicationException: 1: string message, 2: i32 type
	buf.put_u8(TYPE_STRING);
	buf.put_i16(1);
	buf.put_i32(message.len() as i32);
	buf.put_slice(message.as_bytes());
	buf.put_u8(TYPE_I32);
	buf.put_i16(2);
	buf.put_i32(code);
	buf.put_u8(TYPE_STOP);
	buf.freeze()
}

/// Capability producing the error payloads returned when no backend can
/// serve a request. Injected so tests can stub the wire format.
pub trait ErrorEncoder: Send + Sync {
	fn service_not_found(&self, service: &str, seq_id: i32) -> Bytes;
	fn worker_not_found(&self, service: &str, seq_id: i32) -> Bytes;
}

/// Thrift binary-protocol encoder, the production implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinaryErrorEncoder;

impl ErrorEncoder for BinaryErrorEncoder {
	fn service_not_found(&self, service: &str, seq_id: i32) -> Bytes {
		encode_exception(
			service,
			seq_id,
			EXC_UNKNOWN_APPLICATION,
			&format!("service {service} not found"),
		)
	}

	fn worker_not_found(&self, service: &str, seq_id: i32) -> Bytes {
		encode_exception(
			service,
			seq_id,
			EXC_INTERNAL_ERROR,
			&format!("no worker available for {service}"),
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exception_header_round_trips() {
		let payload = BinaryErrorEncoder.service_not_found("echo", 42);
		let header = read_message_begin(&payload).unwrap();
		assert_eq!(header.name, "echo");
		assert_eq!(header.message_type, MSG_EXCEPTION);
		assert_eq!(header.seq_id, 42);
	}

	#[test]
	fn worker_not_found_uses_internal_error() {
		let payload = BinaryErrorEncoder.worker_not_found("echo", 7);
		let header = read_message_begin(&payload).unwrap();
		assert_eq!(header.message_type, MSG_EXCEPTION);
		assert_eq!(header.seq_id, 7);
		// field 2 carries the exception code at the payload tail:
		// [type:u8][id:i16][value:i32][stop]
		let tail = &payload[payload.len() - 8..];
		assert_eq!(tail[0], TYPE_I32);
		assert_eq!(i16::from_be_bytes([tail[1], tail[2]]), 2);
		assert_eq!(
			i32::from_be_bytes([tail[3], tail[4], tail[5], tail[6]]),
			EXC_INTERNAL_ERROR
		);
		assert_eq!(tail[7], TYPE_STOP);
	}

	#[test]
	fn unversioned_header_parses() {
		let mut buf = BytesMut::new();
		buf.put_i32(4);
		buf.put_slice(b"ping");
		buf.put_u8(MSG_CALL);
		buf.put_i32(9);
		let header = read_message_begin(&buf).unwrap();
		assert_eq!(header.name, "ping");
		assert_eq!(header.message_type, MSG_CALL);
		assert_eq!(header.seq_id, 9);
	}

	#[test]
	fn seq_id_defaults_to_zero_on_garbage() {
		assert_eq!(seq_id(b""), 0);
		assert_eq!(seq_id(b"\x01\x02"), 0);
		assert_eq!(seq_id(&[0xff, 0xff, 0x00, 0x00, 0x00]), 0);
	}
}

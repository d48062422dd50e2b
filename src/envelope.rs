//! The multipart routing envelope shared by both tiers.
//!
//! A message on the wire is an ordered run of frames: identity frames,
//! zero-length delimiters and an opaque payload suffix. Every hop prepends
//! the inbound peer identity, so routing needs nothing beyond the frames
//! themselves.

use bytes::Bytes;

/// Control opcodes a worker sends on a load balancer's backend socket.
pub const CONTROL_READY: u8 = 0x01;
pub const CONTROL_HEARTBEAT: u8 = 0x02;
pub const CONTROL_STOP: u8 = 0x03;

/// Version byte carried in READY/HEARTBEAT control frames.
pub const PROTOCOL_VERSION: u8 = 0x01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
	Ready,
	Heartbeat,
	Stop,
}

/// A decoded single-frame control message: `[opcode][version][capacity]`,
/// where the version and capacity bytes are optional and capacity defaults
/// to 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Control {
	pub opcode: Opcode,
	pub capacity: i32,
}

pub fn parse_control(frame: &[u8]) -> Option<Control> {
	let opcode = match frame.first()? {
		&CONTROL_READY => Opcode::Ready,
		&CONTROL_HEARTBEAT => Opcode::Heartbeat,
		&CONTROL_STOP => Opcode::Stop,
		_ => return None,
	};
	let capacity = if frame.len() >= 3 { frame[2] as i32 } else { 1 };
	Some(Control { opcode, capacity })
}

pub fn ready_frame(capacity: u8) -> Bytes {
	Bytes::copy_from_slice(&[CONTROL_READY, PROTOCOL_VERSION, capacity])
}

pub fn heartbeat_frame() -> Bytes {
	Bytes::copy_from_slice(&[CONTROL_HEARTBEAT])
}

pub fn stop_frame() -> Bytes {
	Bytes::copy_from_slice(&[CONTROL_STOP])
}

/// One logical wire message: the ordered list of frames.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Envelope {
	frames: Vec<Bytes>,
}

impl Envelope {
	pub fn new(frames: Vec<Bytes>) -> Envelope {
		Envelope { frames }
	}

	pub fn frames(&self) -> &[Bytes] {
		&self.frames
	}

	pub fn into_frames(self) -> Vec<Bytes> {
		self.frames
	}

	pub fn len(&self) -> usize {
		self.frames.len()
	}

	pub fn is_empty(&self) -> bool {
		self.frames.is_empty()
	}

	pub fn last(&self) -> Option<&Bytes> {
		self.frames.last()
	}

	/// Prepends a frame; used by the router side of the transport to stamp
	/// the inbound peer identity.
	pub fn push_front(&mut self, frame: Bytes) {
		self.frames.insert(0, frame);
	}

	/// Splits off the head frame, skipping one optional empty delimiter
	/// between the head and the rest. Returns `None` on an empty envelope.
	pub fn split_head(mut self) -> Option<(Bytes, Envelope)> {
		if self.frames.is_empty() {
			return None;
		}
		let head = self.frames.remove(0);
		if self.frames.first().is_some_and(|f| f.is_empty()) {
			self.frames.remove(0);
		}
		Some((head, self))
	}

	/// The inverse of [`split_head`]: `<head, "", tail...>`.
	///
	/// [`split_head`]: Envelope::split_head
	pub fn wrap(head: Bytes, tail: Envelope) -> Envelope {
		let mut frames = Vec::with_capacity(tail.frames.len() + 2);
		frames.push(head);
		frames.push(Bytes::new());
		frames.extend(tail.frames);
		Envelope { frames }
	}

	/// Strips all leading empty frames. Peers with mismatched delimiter
	/// conventions produce these; the routing layer tolerates them.
	pub fn trim_leading_empty(mut self) -> Envelope {
		let skip = self
			.frames
			.iter()
			.take_while(|f| f.is_empty())
			.count();
		self.frames.drain(..skip);
		self
	}
}

impl From<Vec<Bytes>> for Envelope {
	fn from(frames: Vec<Bytes>) -> Envelope {
		Envelope { frames }
	}
}

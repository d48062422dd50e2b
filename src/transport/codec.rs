//! Length-delimited multipart framing.
//!
//! Each frame is `[flags: u8][len: u32 BE][payload]`; flag bit 0 marks that
//! more frames of the same envelope follow. An envelope is the run of frames
//! up to the first one without the MORE bit.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::Envelope;

const FLAG_MORE: u8 = 0x01;
const HEADER_LEN: usize = 5;

/// Upper bound on a single frame. Anything larger is a corrupt or hostile
/// stream and kills the connection.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
	#[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte cap")]
	FrameTooLarge(usize),
	#[error("reserved frame flags set: {0:#04x}")]
	BadFlags(u8),
}

#[derive(Debug, Default)]
pub struct EnvelopeCodec {
	partial: Vec<Bytes>,
}

impl Decoder for EnvelopeCodec {
	type Item = Envelope;
	type Error = CodecError;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, CodecError> {
		loop {
			if src.len() < HEADER_LEN {
				return Ok(None);
			}
			let flags = src[0];
			if flags & !FLAG_MORE != 0 {
				return Err(CodecError::BadFlags(flags));
			}
			let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
			if len > MAX_FRAME_LEN {
				return Err(CodecError::FrameTooLarge(len));
			}
			if src.len() < HEADER_LEN + len {
				src.reserve(HEADER_LEN + len - src.len());
				return Ok(None);
			}
			src.advance(HEADER_LEN);
			self.partial.push(src.split_to(len).freeze());
			if flags & FLAG_MORE == 0 {
				return Ok(Some(Envelope::new(std::mem::take(&mut self.partial))));
			}
		}
	}
}

impl Encoder<Envelope> for EnvelopeCodec {
	type Error = CodecError;

	fn encode(&mut self, env: Envelope, dst: &mut BytesMut) -> Result<(), CodecError> {
		let frames = env.into_frames();
		if frames.is_empty() {
			// An empty envelope still occupies one zero-length terminal frame.
			dst.put_u8(0);
			dst.put_u32(0);
			return Ok(());
		}
		let last = frames.len() - 1;
		for (i, frame) in frames.iter().enumerate() {
			if frame.len() > MAX_FRAME_LEN {
				return Err(CodecError::FrameTooLarge(frame.len()));
			}
			dst.put_u8(if i < last { FLAG_MORE } else { 0 });
			dst.put_u32(frame.len() as u32);
			dst.extend_from_slice(frame);
		}
		Ok(())
	}
}

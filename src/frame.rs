use bytes::{BufMut, BytesMut};

use crate::mask::MaskingKey;

pub const FIN: u8 = 0x80;
pub const RSV: u8 = 0x70;
pub const OPCODE: u8 = 0x0f;
pub const MASKED: u8 = 0x80;
pub const LENGTH: u8 = 0x7f;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Status code sent in our CLOSE frame.
pub const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    pub fn bits(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xa,
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = FrameErr;

    fn try_from(bits: u8) -> Result<Self, FrameErr> {
        Ok(match bits {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xa => OpCode::Pong,
            other => return Err(FrameErr::ReservedOpcode(other)),
        })
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FrameErr {
    #[error("reserved bits set in frame header ({0:#04x})")]
    ReservedBits(u8),
    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),
    #[error("fragmented control frame")]
    FragmentedControl,
    #[error("control frame payload of {0} bytes")]
    ControlTooLong(u64),
    #[error("frame payload of {0} bytes exceeds limit")]
    TooLarge(u64),
}

/// Appends one masked, final frame to `dst`.
///
/// The mask is regenerated by the caller before each frame; the payload is
/// masked as it is copied so `payload` itself is left untouched.
pub fn encode_frame(dst: &mut BytesMut, opcode: OpCode, payload: &[u8], mask: &mut MaskingKey) {
    let len = payload.len();
    let header_len = 2
        + match len {
            0..=125 => 0,
            126..=0xffff => 2,
            _ => 8,
        }
        + 4;
    reserve_doubling(dst, header_len + len);

    dst.put_u8(FIN | opcode.bits());
    match len {
        0..=125 => dst.put_u8(MASKED | len as u8),
        126..=0xffff => {
            dst.put_u8(MASKED | 126);
            dst.put_u16(len as u16);
        }
        _ => {
            dst.put_u8(MASKED | 127);
            dst.put_u64(len as u64);
        }
    }
    dst.put_slice(&mask.key());

    let start = dst.len();
    dst.put_slice(payload);
    mask.apply(&mut dst[start..]);
}

/// Grows `buf` so `additional` more bytes fit, at least doubling its
/// capacity whenever it has to grow.
pub(crate) fn reserve_doubling(buf: &mut BytesMut, additional: usize) {
    let needed = buf.len() + additional;
    if needed > buf.capacity() {
        let target = needed.max(buf.capacity() * 2);
        buf.reserve(target - buf.len());
    }
}

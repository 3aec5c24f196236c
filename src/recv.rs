//! Incremental decoder for server-to-client frames.
//!
//! [`FrameReceiver::poll`] pulls from any [`Read`] source and may be called
//! again and again as bytes trickle in: a `WouldBlock` from the source
//! suspends the machine in its current phase, and the next call resumes at the
//! exact byte where it stopped.

use std::io::{ErrorKind, Read};

use bytes::BytesMut;

use crate::error::WsError;
use crate::frame::{FIN, FrameErr, LENGTH, MASKED, MAX_CONTROL_PAYLOAD, OPCODE, OpCode, RSV};
use crate::mask::MaskingKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Previous frame fully consumed.
    Overed,
    Opcode,
    /// `extended` is the width of the extended length field being read, or
    /// zero while the first length byte is pending.
    Length { extended: usize },
    Mask,
    Payload,
}

/// Outcome of one [`FrameReceiver::poll`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recv {
    /// The source has no bytes right now.
    Pending,
    /// The source reached end of stream.
    Eof,
    /// A data frame finished; its payload (of this many bytes) is in staging.
    Data(u64),
    Ping(Vec<u8>),
    Pong,
    /// The peer's CLOSE frame with its status code, when one was carried.
    Close(Option<u16>),
}

enum Fill {
    Done,
    Pending,
    Eof,
}

#[derive(Debug)]
pub struct FrameReceiver {
    phase: Phase,
    head: [u8; 8],
    filled: usize,
    want: usize,
    fin: bool,
    masked: bool,
    opcode: OpCode,
    length: u64,
    remaining: u64,
    mask: MaskingKey,
    control: Vec<u8>,
    max_frame_size: u64,
    read_chunk: usize,
}

impl FrameReceiver {
    pub fn new(max_frame_size: u64, read_chunk: usize) -> Self {
        Self {
            phase: Phase::Overed,
            head: [0; 8],
            filled: 0,
            want: 0,
            fin: false,
            masked: false,
            opcode: OpCode::Continuation,
            length: 0,
            remaining: 0,
            mask: MaskingKey::new(),
            control: Vec::with_capacity(MAX_CONTROL_PAYLOAD as usize),
            max_frame_size,
            read_chunk: read_chunk.max(1),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Drops any partially decoded frame.
    pub fn reset(&mut self) {
        self.phase = Phase::Overed;
        self.filled = 0;
        self.want = 0;
        self.mask.reset();
        self.control.clear();
    }

    /// Drives the machine until one frame completes, the source would block,
    /// or the source is exhausted. Data-frame payload is unmasked straight
    /// into `staging`.
    pub fn poll<R: Read + ?Sized>(
        &mut self,
        src: &mut R,
        staging: &mut BytesMut,
    ) -> Result<Recv, WsError> {
        loop {
            match self.phase {
                Phase::Overed => {
                    self.fin = false;
                    self.masked = false;
                    self.opcode = OpCode::Continuation;
                    self.length = 0;
                    self.remaining = 0;
                    self.mask.reset();
                    self.control.clear();
                    self.arm(1);
                    self.phase = Phase::Opcode;
                }
                Phase::Opcode => {
                    match self.fill(src)? {
                        Fill::Done => {}
                        Fill::Pending => return Ok(Recv::Pending),
                        Fill::Eof => return Ok(Recv::Eof),
                    }
                    let b = self.head[0];
                    if b & RSV != 0 {
                        return Err(FrameErr::ReservedBits(b & RSV).into());
                    }
                    self.fin = b & FIN != 0;
                    self.opcode = OpCode::try_from(b & OPCODE)?;
                    self.arm(1);
                    self.phase = Phase::Length { extended: 0 };
                }
                Phase::Length { extended } => {
                    match self.fill(src)? {
                        Fill::Done => {}
                        Fill::Pending => return Ok(Recv::Pending),
                        Fill::Eof => return Ok(Recv::Eof),
                    }
                    if extended == 0 {
                        let b = self.head[0];
                        self.masked = b & MASKED != 0;
                        match b & LENGTH {
                            126 => {
                                self.arm(2);
                                self.phase = Phase::Length { extended: 2 };
                                continue;
                            }
                            127 => {
                                self.arm(8);
                                self.phase = Phase::Length { extended: 8 };
                                continue;
                            }
                            n => self.length = u64::from(n),
                        }
                    } else {
                        self.length = self.head[..extended]
                            .iter()
                            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
                    }
                    self.check_length()?;
                    self.remaining = self.length;
                    if self.masked {
                        self.arm(4);
                        self.phase = Phase::Mask;
                    } else {
                        self.phase = Phase::Payload;
                    }
                }
                Phase::Mask => {
                    match self.fill(src)? {
                        Fill::Done => {}
                        Fill::Pending => return Ok(Recv::Pending),
                        Fill::Eof => return Ok(Recv::Eof),
                    }
                    let key = [self.head[0], self.head[1], self.head[2], self.head[3]];
                    self.mask.set_key(key);
                    self.phase = Phase::Payload;
                }
                Phase::Payload => {
                    while self.remaining > 0 {
                        let step = if self.opcode.is_control() {
                            self.read_control(src)?
                        } else {
                            self.read_data(src, staging)?
                        };
                        match step {
                            Fill::Done => {}
                            Fill::Pending => return Ok(Recv::Pending),
                            Fill::Eof => return Ok(Recv::Eof),
                        }
                    }
                    self.phase = Phase::Overed;
                    log::trace!(
                        "frame {:?} fin={} len={} complete",
                        self.opcode,
                        self.fin,
                        self.length
                    );
                    return Ok(self.dispatch());
                }
            }
        }
    }

    fn arm(&mut self, want: usize) {
        self.filled = 0;
        self.want = want;
    }

    fn fill<R: Read + ?Sized>(&mut self, src: &mut R) -> Result<Fill, WsError> {
        while self.filled < self.want {
            match src.read(&mut self.head[self.filled..self.want]) {
                Ok(0) => return Ok(Fill::Eof),
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Fill::Pending),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Fill::Done)
    }

    fn check_length(&self) -> Result<(), FrameErr> {
        if self.opcode.is_control() {
            if !self.fin {
                return Err(FrameErr::FragmentedControl);
            }
            if self.length > MAX_CONTROL_PAYLOAD {
                return Err(FrameErr::ControlTooLong(self.length));
            }
        }
        if self.length > self.max_frame_size || self.length >> 63 != 0 {
            return Err(FrameErr::TooLarge(self.length));
        }
        Ok(())
    }

    fn read_control<R: Read + ?Sized>(&mut self, src: &mut R) -> Result<Fill, WsError> {
        let mut tmp = [0u8; MAX_CONTROL_PAYLOAD as usize];
        let want = self.remaining as usize;
        match src.read(&mut tmp[..want]) {
            Ok(0) => Ok(Fill::Eof),
            Ok(n) => {
                self.mask.apply(&mut tmp[..n]);
                self.control.extend_from_slice(&tmp[..n]);
                self.remaining -= n as u64;
                Ok(Fill::Done)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Fill::Pending),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(Fill::Done),
            Err(e) => Err(e.into()),
        }
    }

    fn read_data<R: Read + ?Sized>(
        &mut self,
        src: &mut R,
        staging: &mut BytesMut,
    ) -> Result<Fill, WsError> {
        let want = self.remaining.min(self.read_chunk as u64) as usize;
        let start = staging.len();
        staging.resize(start + want, 0);
        let res = src.read(&mut staging[start..]);
        let got = match &res {
            Ok(n) => *n,
            Err(_) => 0,
        };
        staging.truncate(start + got);
        match res {
            Ok(0) => Ok(Fill::Eof),
            Ok(n) => {
                self.mask.apply(&mut staging[start..]);
                self.remaining -= n as u64;
                Ok(Fill::Done)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Fill::Pending),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(Fill::Done),
            Err(e) => Err(e.into()),
        }
    }

    fn dispatch(&mut self) -> Recv {
        match self.opcode {
            OpCode::Continuation | OpCode::Text | OpCode::Binary => Recv::Data(self.length),
            OpCode::Pong => Recv::Pong,
            OpCode::Ping => Recv::Ping(std::mem::take(&mut self.control)),
            OpCode::Close => {
                let code = (self.control.len() >= 2)
                    .then(|| u16::from_be_bytes([self.control[0], self.control[1]]));
                Recv::Close(code)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;

    use super::*;

    /// Source that hands out scripted chunks and reports `WouldBlock` between
    /// them, then end of stream once `eof` is set and the script runs dry.
    struct Script {
        chunks: VecDeque<Vec<u8>>,
        blocked: bool,
        eof: bool,
    }

    impl Script {
        fn new(bytes: &[u8], split: &[usize], eof: bool) -> Self {
            let mut chunks = VecDeque::new();
            let mut rest = bytes;
            for &n in split {
                let n = n.min(rest.len());
                chunks.push_back(rest[..n].to_vec());
                rest = &rest[n..];
            }
            if !rest.is_empty() {
                chunks.push_back(rest.to_vec());
            }
            Self {
                chunks,
                blocked: false,
                eof,
            }
        }

        fn bytewise(bytes: &[u8]) -> Self {
            Self {
                chunks: bytes.iter().map(|b| vec![*b]).collect(),
                blocked: false,
                eof: false,
            }
        }
    }

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.blocked {
                self.blocked = false;
                return Err(ErrorKind::WouldBlock.into());
            }
            let Some(chunk) = self.chunks.front_mut() else {
                return if self.eof {
                    Ok(0)
                } else {
                    Err(ErrorKind::WouldBlock.into())
                };
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            chunk.drain(..n);
            if chunk.is_empty() {
                self.chunks.pop_front();
                self.blocked = true;
            }
            Ok(n)
        }
    }

    fn server_frame(first: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
        let mut out = vec![first];
        let bit = if mask.is_some() { 0x80 } else { 0 };
        match payload.len() {
            n @ 0..=125 => out.push(bit | n as u8),
            n @ 126..=0xffff => {
                out.push(bit | 126);
                out.extend_from_slice(&(n as u16).to_be_bytes());
            }
            n => {
                out.push(bit | 127);
                out.extend_from_slice(&(n as u64).to_be_bytes());
            }
        }
        match mask {
            Some(key) => {
                out.extend_from_slice(&key);
                out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
            }
            None => out.extend_from_slice(payload),
        }
        out
    }

    /// Polls until `src` is drained, collecting every non-pending event.
    fn drain(rx: &mut FrameReceiver, src: &mut Script, staging: &mut BytesMut) -> Vec<Recv> {
        let mut events = Vec::new();
        loop {
            match rx.poll(src, staging).unwrap() {
                Recv::Pending if src.chunks.is_empty() => break,
                Recv::Pending => {}
                Recv::Eof => {
                    events.push(Recv::Eof);
                    break;
                }
                ev => events.push(ev),
            }
        }
        events
    }

    fn receiver() -> FrameReceiver {
        FrameReceiver::new(64 << 20, 16 * 1024)
    }

    #[test]
    fn decodes_short_unmasked_frame_in_one_read() {
        let bytes = server_frame(0x82, b"hello", None);
        let mut src = Script::new(&bytes, &[], false);
        let mut staging = BytesMut::new();
        let mut rx = receiver();
        assert_eq!(rx.poll(&mut src, &mut staging).unwrap(), Recv::Data(5));
        assert_eq!(&staging[..], b"hello");
        assert_eq!(rx.phase(), Phase::Overed);
    }

    #[test]
    fn fragmentation_does_not_change_payload() {
        let payload: Vec<u8> = (0..300u32).map(|i| (i * 7) as u8).collect();
        for mask in [None, Some([0x11, 0x22, 0x33, 0x44])] {
            let bytes = server_frame(0x82, &payload, mask);

            let mut whole = BytesMut::new();
            let mut rx = receiver();
            let mut src = Script::new(&bytes, &[], false);
            assert_eq!(rx.poll(&mut src, &mut whole).unwrap(), Recv::Data(300));

            let mut trickled = BytesMut::new();
            let mut rx = receiver();
            let mut src = Script::bytewise(&bytes);
            assert_eq!(drain(&mut rx, &mut src, &mut trickled), vec![Recv::Data(300)]);
            assert_eq!(trickled, whole);

            for split in [&[1usize, 1, 2][..], &[3, 5, 7], &[4, 100], &[9, 1, 1, 1]] {
                let mut chunked = BytesMut::new();
                let mut rx = receiver();
                let mut src = Script::new(&bytes, split, false);
                assert_eq!(drain(&mut rx, &mut src, &mut chunked), vec![Recv::Data(300)]);
                assert_eq!(chunked, whole, "split {split:?}");
            }
            assert_eq!(&whole[..], &payload[..]);
        }
    }

    #[test]
    fn suspends_in_each_phase() {
        let bytes = server_frame(0x82, &[1, 2, 3, 4, 5, 6], Some([9, 8, 7, 6]));
        let mut src = Script::bytewise(&bytes);
        let mut staging = BytesMut::new();
        let mut rx = receiver();
        let mut seen = Vec::new();
        loop {
            match rx.poll(&mut src, &mut staging).unwrap() {
                Recv::Pending => seen.push(rx.phase()),
                ev => {
                    assert_eq!(ev, Recv::Data(6));
                    break;
                }
            }
        }
        assert!(seen.contains(&Phase::Length { extended: 0 }));
        assert!(seen.contains(&Phase::Mask));
        assert!(seen.contains(&Phase::Payload));
        assert_eq!(&staging[..], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn extended_lengths() {
        for n in [126usize, 65535, 65536, 70000] {
            let payload = vec![0xabu8; n];
            let bytes = server_frame(0x82, &payload, None);
            let mut src = Script::new(&bytes, &[1, 1, 1, 1, 1, 1, 1], false);
            let mut staging = BytesMut::new();
            let mut rx = FrameReceiver::new(64 << 20, 4096);
            assert_eq!(drain(&mut rx, &mut src, &mut staging), vec![Recv::Data(n as u64)]);
            assert_eq!(staging.len(), n);
        }
    }

    #[test]
    fn continuation_frames_concatenate() {
        let mut bytes = server_frame(0x01, b"hel", None);
        bytes.extend(server_frame(0x80, b"lo", None));
        let mut src = Script::new(&bytes, &[], false);
        let mut staging = BytesMut::new();
        let mut rx = receiver();
        assert_eq!(
            drain(&mut rx, &mut src, &mut staging),
            vec![Recv::Data(3), Recv::Data(2)]
        );
        assert_eq!(&staging[..], b"hello");
    }

    #[test]
    fn control_frames_are_dispatched() {
        let mut bytes = server_frame(0x89, b"are you there", None);
        bytes.extend(server_frame(0x8a, b"", None));
        bytes.extend(server_frame(0x88, &1000u16.to_be_bytes(), Some([1, 2, 3, 4])));
        let mut src = Script::bytewise(&bytes);
        let mut staging = BytesMut::new();
        let mut rx = receiver();
        assert_eq!(
            drain(&mut rx, &mut src, &mut staging),
            vec![
                Recv::Ping(b"are you there".to_vec()),
                Recv::Pong,
                Recv::Close(Some(1000)),
            ]
        );
        assert!(staging.is_empty());
    }

    #[test]
    fn close_without_code() {
        let bytes = server_frame(0x88, b"", None);
        let mut src = Script::new(&bytes, &[], false);
        let mut staging = BytesMut::new();
        assert_eq!(receiver().poll(&mut src, &mut staging).unwrap(), Recv::Close(None));
    }

    #[test]
    fn reserved_bits_are_fatal() {
        let bytes = server_frame(0x82 | 0x40, b"x", None);
        let mut src = Script::new(&bytes, &[], false);
        let err = receiver().poll(&mut src, &mut BytesMut::new()).unwrap_err();
        assert!(matches!(err, WsError::Frame(FrameErr::ReservedBits(0x40))));
    }

    #[test]
    fn reserved_opcode_is_fatal() {
        let bytes = server_frame(0x83, b"x", None);
        let mut src = Script::new(&bytes, &[], false);
        let err = receiver().poll(&mut src, &mut BytesMut::new()).unwrap_err();
        assert!(matches!(err, WsError::Frame(FrameErr::ReservedOpcode(3))));
    }

    #[test]
    fn malformed_control_frames_are_fatal() {
        let bytes = server_frame(0x09, b"", None);
        let mut src = Script::new(&bytes, &[], false);
        let err = receiver().poll(&mut src, &mut BytesMut::new()).unwrap_err();
        assert!(matches!(err, WsError::Frame(FrameErr::FragmentedControl)));

        let bytes = server_frame(0x89, &[0u8; 126], None);
        let mut src = Script::new(&bytes, &[], false);
        let err = receiver().poll(&mut src, &mut BytesMut::new()).unwrap_err();
        assert!(matches!(err, WsError::Frame(FrameErr::ControlTooLong(126))));
    }

    #[test]
    fn declared_length_over_limit_is_rejected() {
        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&u64::MAX.to_be_bytes());
        let mut src = Script::new(&bytes, &[], false);
        let err = FrameReceiver::new(1024, 64)
            .poll(&mut src, &mut BytesMut::new())
            .unwrap_err();
        assert!(matches!(err, WsError::Frame(FrameErr::TooLarge(u64::MAX))));
    }

    #[test]
    fn eof_mid_frame_is_reported() {
        let bytes = server_frame(0x82, b"truncated", None);
        let mut src = Script::new(&bytes[..6], &[], true);
        let mut staging = BytesMut::new();
        let mut rx = receiver();
        assert_eq!(rx.poll(&mut src, &mut staging).unwrap(), Recv::Pending);
        assert_eq!(rx.poll(&mut src, &mut staging).unwrap(), Recv::Eof);
        assert_eq!(&staging[..], b"trun");
    }

    #[test]
    fn reset_discards_partial_frame() {
        let bytes = server_frame(0x82, b"abc", None);
        let mut src = Script::new(&bytes[..2], &[], false);
        let mut staging = BytesMut::new();
        let mut rx = receiver();
        assert_eq!(rx.poll(&mut src, &mut staging).unwrap(), Recv::Pending);
        assert_eq!(rx.phase(), Phase::Payload);
        rx.reset();
        assert_eq!(rx.phase(), Phase::Overed);

        let bytes = server_frame(0x82, b"xyz", None);
        let mut src = Script::new(&bytes, &[], false);
        assert_eq!(rx.poll(&mut src, &mut staging).unwrap(), Recv::Data(3));
    }
}

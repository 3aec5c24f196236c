use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use mio::Interest;

use crate::config::WsConfig;
use crate::error::{WsError, report};
use crate::frame::{CLOSE_NORMAL, OpCode, encode_frame};
use crate::http_upgrade::{
    HEADER_CONNECTION, HEADER_HOST, HEADER_SEC_WS_KEY, HEADER_SEC_WS_VERSION, HEADER_UPGRADE,
    UpgradeErr, build_request, generate_key, head_complete, parse_response, validate_response,
};
use crate::mask::MaskingKey;
use crate::recv::{FrameReceiver, Recv};
use crate::transport::Socket;
use crate::url::{WsUrl, parse_ws_or_wss};

/// Connection status. The handshake walks the variants in declaration order
/// from `Closed` to `Connected`; `Closing` is only entered from `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Closed,
    Connecting,
    HandshakeSend,
    HandshakeRecv,
    HandshakeParse,
    Connected,
    Closing,
}

impl Status {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Status::Closed,
            1 => Status::Connecting,
            2 => Status::HandshakeSend,
            3 => Status::HandshakeRecv,
            4 => Status::HandshakeParse,
            5 => Status::Connected,
            _ => Status::Closing,
        }
    }

    fn is_handshaking(self) -> bool {
        matches!(
            self,
            Status::Connecting | Status::HandshakeSend | Status::HandshakeRecv | Status::HandshakeParse
        )
    }
}

/// Result of a drive operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The operation finished.
    Complete,
    /// Not finished yet: the socket was not ready, the deadline passed, or
    /// (in non-blocking mode) another thread held the lock. Call again.
    Incomplete,
    /// The connection is closed, or failed and was reset. Failures are
    /// handed to the error sink, see [`crate::set_error_sink`].
    Failed,
}

impl Progress {
    pub fn is_complete(self) -> bool {
        self == Progress::Complete
    }
}

struct ReadSide {
    receiver: FrameReceiver,
    /// Decoded payload waiting for [`WebSocket::read`]; holds the response
    /// head while the handshake is in flight.
    staging: BytesMut,
}

struct WriteSide {
    /// Encoded bytes not yet accepted by the socket.
    buf: BytesMut,
    mask: MaskingKey,
}

/// A client WebSocket connection driven by its callers.
///
/// No threads are spawned; every operation makes as much progress as the
/// socket allows and, in blocking mode, waits for readiness until it is done
/// or its timeout elapses. One thread may read while another writes.
///
/// Lock order is read side, then write side. The read side takes the write
/// side to answer a PING; nothing takes them the other way round.
pub struct WebSocket {
    url: WsUrl,
    config: WsConfig,
    headers: Mutex<Vec<(String, String)>>,
    status: AtomicU8,
    blocking: AtomicBool,
    reading: AtomicBool,
    writing: AtomicBool,
    peer_close: Mutex<Option<u16>>,
    socket: Mutex<Option<Arc<Socket>>>,
    rx: Mutex<ReadSide>,
    tx: Mutex<WriteSide>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

impl WebSocket {
    pub fn new(url: &str) -> Result<Self, WsError> {
        Self::with_config(url, WsConfig::default())
    }

    pub fn with_config(url: &str, config: WsConfig) -> Result<Self, WsError> {
        let url = parse_ws_or_wss(url)?;
        let headers = vec![
            (HEADER_HOST.to_owned(), url.host_header()),
            (HEADER_CONNECTION.to_owned(), "Upgrade".to_owned()),
            (HEADER_UPGRADE.to_owned(), "websocket".to_owned()),
            (HEADER_SEC_WS_KEY.to_owned(), generate_key(&mut rand::rng())),
            (HEADER_SEC_WS_VERSION.to_owned(), "13".to_owned()),
        ];
        let receiver = FrameReceiver::new(config.max_frame_size, config.read_chunk);
        Ok(Self {
            config,
            headers: Mutex::new(headers),
            status: AtomicU8::new(Status::Closed as u8),
            blocking: AtomicBool::new(true),
            reading: AtomicBool::new(false),
            writing: AtomicBool::new(false),
            peer_close: Mutex::new(None),
            socket: Mutex::new(None),
            rx: Mutex::new(ReadSide {
                receiver,
                staging: BytesMut::new(),
            }),
            tx: Mutex::new(WriteSide {
                buf: BytesMut::new(),
                mask: MaskingKey::new(),
            }),
            url,
        })
    }

    pub fn url(&self) -> &WsUrl {
        &self.url
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    /// Sets a request header, replacing any existing one with the same
    /// case-insensitive name. Takes effect at the next handshake.
    pub fn header(&self, name: &str, value: &str) {
        let mut headers = lock(&self.headers);
        match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some((_, v)) => *v = value.to_owned(),
            None => headers.push((name.to_owned(), value.to_owned())),
        }
    }

    pub fn remove_header(&self, name: &str) -> Option<String> {
        let mut headers = lock(&self.headers);
        let i = headers.iter().position(|(k, _)| k.eq_ignore_ascii_case(name))?;
        Some(headers.remove(i).1)
    }

    pub fn header_value(&self, name: &str) -> Option<String> {
        lock(&self.headers)
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        lock(&self.headers).clone()
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: Status) {
        log::debug!("{}: {:?} -> {status:?}", self.url.host, self.status());
        self.status.store(status as u8, Ordering::Release);
    }

    /// Whether frames from the peer may still arrive.
    pub fn reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    /// Whether frames may still be sent.
    pub fn writing(&self) -> bool {
        self.writing.load(Ordering::Acquire)
    }

    pub fn blocking(&self) -> bool {
        self.blocking.load(Ordering::Acquire)
    }

    /// Switches between blocking and non-blocking operation. Waits for any
    /// in-flight read and write to finish.
    pub fn set_blocking(&self, blocking: bool) {
        let _rx = lock(&self.rx);
        let _tx = lock(&self.tx);
        self.blocking.store(blocking, Ordering::Release);
    }

    /// Status code of the CLOSE frame received from the peer, if any.
    pub fn peer_close_code(&self) -> Option<u16> {
        *lock(&self.peer_close)
    }

    fn socket(&self) -> Option<Arc<Socket>> {
        lock(&self.socket).clone()
    }

    /// Blocking mode waits for the lock; non-blocking mode gives up when it
    /// is held elsewhere.
    fn acquire<'a, T>(&self, m: &'a Mutex<T>) -> Option<MutexGuard<'a, T>> {
        if self.blocking() {
            return Some(lock(m));
        }
        match m.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Drives the opening handshake: connect, send the upgrade request,
    /// collect and validate the response.
    ///
    /// Calling it again resumes where the previous call stopped; once
    /// connected it returns [`Progress::Complete`] straight away.
    pub fn handshake(&self, timeout: Option<Duration>) -> Progress {
        let deadline = deadline(timeout);
        let Some(mut rx) = self.acquire(&self.rx) else {
            return Progress::Incomplete;
        };
        let Some(mut tx) = self.acquire(&self.tx) else {
            return Progress::Incomplete;
        };
        if self.status() == Status::Closing {
            return Progress::Failed;
        }
        match self.handshake_locked(&mut rx, &mut tx, deadline) {
            Ok(true) => Progress::Complete,
            Ok(false) => Progress::Incomplete,
            Err(e) => {
                self.fail(&mut rx, &mut tx, &e);
                Progress::Failed
            }
        }
    }

    fn handshake_locked(
        &self,
        rx: &mut ReadSide,
        tx: &mut WriteSide,
        deadline: Option<Instant>,
    ) -> Result<bool, WsError> {
        loop {
            let seen = self.socket().map(|s| s.marks()).unwrap_or_default();
            let interest = match self.status() {
                Status::Connected => return Ok(true),
                Status::Closing => return Ok(false),
                Status::Closed => {
                    let socket = Socket::connect(&self.url, &self.config)?;
                    *lock(&self.socket) = Some(Arc::new(socket));
                    *lock(&self.peer_close) = None;
                    self.set_status(Status::Connecting);
                    continue;
                }
                Status::Connecting => {
                    if self.connected_socket()?.poll_connected()? {
                        let request = build_request(&self.url.path, &lock(&self.headers));
                        tx.buf.clear();
                        tx.buf.extend_from_slice(&request);
                        rx.staging.clear();
                        self.set_status(Status::HandshakeSend);
                        continue;
                    }
                    Interest::WRITABLE
                }
                Status::HandshakeSend => {
                    let socket = self.connected_socket()?;
                    if flush_pending(&socket, tx)? {
                        self.set_status(Status::HandshakeRecv);
                        continue;
                    }
                    Interest::WRITABLE
                }
                Status::HandshakeRecv => {
                    let socket = self.connected_socket()?;
                    if self.recv_head(&socket, rx)? {
                        self.set_status(Status::HandshakeParse);
                        continue;
                    }
                    socket.read_interest()
                }
                Status::HandshakeParse => {
                    let head = parse_response(&rx.staging)?;
                    let key = self.header_value(HEADER_SEC_WS_KEY).unwrap_or_default();
                    validate_response(&head, &key)?;
                    rx.staging.clear();
                    rx.receiver.reset();
                    self.reading.store(true, Ordering::Release);
                    self.writing.store(true, Ordering::Release);
                    self.set_status(Status::Connected);
                    return Ok(true);
                }
            };
            if !self.blocking() || !self.connected_socket()?.wait(interest, seen, deadline)? {
                return Ok(false);
            }
        }
    }

    fn connected_socket(&self) -> Result<Arc<Socket>, WsError> {
        self.socket()
            .ok_or_else(|| io::Error::from(ErrorKind::NotConnected).into())
    }

    /// Pulls the response head one byte at a time so nothing past the blank
    /// line is consumed. `Ok(false)` when the socket ran dry first.
    fn recv_head(&self, socket: &Socket, rx: &mut ReadSide) -> Result<bool, WsError> {
        let mut byte = [0u8; 1];
        loop {
            if head_complete(&rx.staging) {
                return Ok(true);
            }
            if rx.staging.len() >= self.config.max_handshake_size {
                return Err(UpgradeErr::Oversized.into());
            }
            match socket.read(&mut byte) {
                Ok(0) => return Err(UpgradeErr::Eof.into()),
                Ok(_) => rx.staging.put_u8(byte[0]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reads decoded payload into `buf`.
    ///
    /// Returns `None` once the read side is closed and everything received
    /// has been handed out, and `Some(0)` when nothing is available yet
    /// (non-blocking mode, elapsed timeout, or handshake not finished).
    pub fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Option<usize> {
        let deadline = deadline(timeout);
        let Some(mut rx) = self.acquire(&self.rx) else {
            return Some(0);
        };
        loop {
            if !rx.staging.is_empty() {
                let n = buf.len().min(rx.staging.len());
                buf[..n].copy_from_slice(&rx.staging[..n]);
                rx.staging.advance(n);
                return Some(n);
            }
            let status = self.status();
            if status == Status::Closed {
                return None;
            }
            if status.is_handshaking() || buf.is_empty() {
                return Some(0);
            }
            if !self.reading() {
                return None;
            }
            let socket = self.socket()?;
            let seen = socket.marks();
            let ev = self.receive(&socket, &mut rx, deadline);
            let step = ev.and_then(|ev| match ev {
                // part of a frame may already be staged
                Recv::Pending if !rx.staging.is_empty() => Ok(true),
                Recv::Pending if self.blocking() => {
                    Ok(socket.wait(socket.read_interest(), seen, deadline)?)
                }
                Recv::Pending => Ok(false),
                _ => Ok(true),
            });
            match step {
                Ok(true) => {}
                Ok(false) => return Some(0),
                Err(e) => {
                    let mut tx = lock(&self.tx);
                    self.fail(&mut rx, &mut tx, &e);
                    return None;
                }
            }
        }
    }

    /// Runs the receive machine up to one frame and reacts to control frames.
    fn receive(
        &self,
        socket: &Socket,
        rx: &mut ReadSide,
        deadline: Option<Instant>,
    ) -> Result<Recv, WsError> {
        let ReadSide { receiver, staging } = rx;
        let ev = receiver.poll(&mut &*socket, staging)?;
        match &ev {
            Recv::Ping(payload) => self.send_pong(socket, payload, deadline)?,
            Recv::Close(code) => {
                log::debug!("{}: close frame received ({code:?})", self.url.host);
                *lock(&self.peer_close) = *code;
                self.reading.store(false, Ordering::Release);
            }
            Recv::Eof => {
                log::debug!("{}: stream ended by peer", self.url.host);
                self.reading.store(false, Ordering::Release);
            }
            Recv::Pending | Recv::Data(_) | Recv::Pong => {}
        }
        Ok(ev)
    }

    /// Answers a PING. Called with the read side held.
    fn send_pong(
        &self,
        socket: &Socket,
        payload: &[u8],
        deadline: Option<Instant>,
    ) -> Result<(), WsError> {
        let mut tx = lock(&self.tx);
        if !self.writing() {
            return Ok(());
        }
        queue_frame(&mut tx, OpCode::Pong, payload);
        self.flush_until(socket, &mut tx, deadline)?;
        Ok(())
    }

    /// Sends `payload` as one BINARY frame.
    ///
    /// [`Progress::Incomplete`] means the frame is queued but not all of it
    /// reached the socket yet; it goes out ahead of the next frame or with
    /// [`WebSocket::flush`]. A closed write side drops the payload.
    pub fn write(&self, payload: &[u8], timeout: Option<Duration>) -> Progress {
        self.send(OpCode::Binary, payload, timeout)
    }

    /// Sends `text` as one TEXT frame.
    pub fn write_text(&self, text: &str, timeout: Option<Duration>) -> Progress {
        self.send(OpCode::Text, text.as_bytes(), timeout)
    }

    fn send(&self, opcode: OpCode, payload: &[u8], timeout: Option<Duration>) -> Progress {
        let deadline = deadline(timeout);
        let Some(mut tx) = self.acquire(&self.tx) else {
            return Progress::Incomplete;
        };
        if self.status() != Status::Connected || !self.writing() {
            log::warn!(
                "{}: dropping {} byte frame, write side closed",
                self.url.host,
                payload.len()
            );
            return Progress::Failed;
        }
        let Some(socket) = self.socket() else {
            return Progress::Failed;
        };
        queue_frame(&mut tx, opcode, payload);
        match self.flush_until(&socket, &mut tx, deadline) {
            Ok(true) => Progress::Complete,
            Ok(false) => Progress::Incomplete,
            Err(e) => {
                drop(tx);
                self.fail_from_writer(&socket, &e);
                Progress::Failed
            }
        }
    }

    /// Pushes queued frame bytes to the socket.
    pub fn flush(&self, timeout: Option<Duration>) -> Progress {
        let deadline = deadline(timeout);
        let Some(mut tx) = self.acquire(&self.tx) else {
            return Progress::Incomplete;
        };
        let Some(socket) = self.socket() else {
            return if tx.buf.is_empty() {
                Progress::Complete
            } else {
                Progress::Failed
            };
        };
        match self.flush_until(&socket, &mut tx, deadline) {
            Ok(true) => Progress::Complete,
            Ok(false) => Progress::Incomplete,
            Err(e) => {
                drop(tx);
                self.fail_from_writer(&socket, &e);
                Progress::Failed
            }
        }
    }

    fn flush_until(
        &self,
        socket: &Socket,
        tx: &mut WriteSide,
        deadline: Option<Instant>,
    ) -> Result<bool, WsError> {
        loop {
            let seen = socket.marks();
            if flush_pending(socket, tx)? {
                return Ok(true);
            }
            if !self.blocking() || !socket.wait(Interest::WRITABLE, seen, deadline)? {
                return Ok(false);
            }
        }
    }

    /// Graceful shutdown: sends CLOSE (1000) and waits for the peer's CLOSE.
    ///
    /// [`Progress::Incomplete`] leaves the connection in [`Status::Closing`];
    /// call again to keep waiting. Closing a closed connection is a no-op, and
    /// closing mid-handshake simply resets.
    pub fn close(&self, timeout: Option<Duration>) -> Progress {
        let deadline = deadline(timeout);
        let Some(mut rx) = self.acquire(&self.rx) else {
            return Progress::Incomplete;
        };
        let Some(mut tx) = self.acquire(&self.tx) else {
            return Progress::Incomplete;
        };
        match self.status() {
            Status::Closed => return Progress::Complete,
            Status::Connected => self.set_status(Status::Closing),
            Status::Closing => {}
            _ => {
                self.reset_locked(&mut rx, &mut tx);
                return Progress::Complete;
            }
        }
        match self.close_locked(&mut rx, &mut tx, deadline) {
            Ok(true) => {
                self.reset_locked(&mut rx, &mut tx);
                Progress::Complete
            }
            Ok(false) => Progress::Incomplete,
            Err(e) => {
                self.fail(&mut rx, &mut tx, &e);
                Progress::Failed
            }
        }
    }

    fn close_locked(
        &self,
        rx: &mut ReadSide,
        tx: &mut WriteSide,
        deadline: Option<Instant>,
    ) -> Result<bool, WsError> {
        let Some(socket) = self.socket() else {
            return Ok(true);
        };

        if self.writing() {
            queue_frame(tx, OpCode::Close, &CLOSE_NORMAL.to_be_bytes());
            self.writing.store(false, Ordering::Release);
        }
        if !tx.buf.is_empty() {
            match self.flush_until(&socket, tx, deadline) {
                Ok(true) => log::debug!("{}: close frame sent", self.url.host),
                Ok(false) => return Ok(false),
                Err(e) => {
                    // the peer may already be gone; carry on with the read side
                    log::debug!("{}: close frame not sent: {e}", self.url.host);
                    tx.buf.clear();
                }
            }
        }

        while self.reading() {
            let seen = socket.marks();
            let ReadSide { receiver, staging } = &mut *rx;
            match receiver.poll(&mut &*socket, staging)? {
                Recv::Pending => {
                    if !self.blocking() || !socket.wait(socket.read_interest(), seen, deadline)? {
                        return Ok(false);
                    }
                }
                Recv::Close(code) => {
                    log::debug!("{}: close frame received ({code:?})", self.url.host);
                    *lock(&self.peer_close) = code;
                    self.reading.store(false, Ordering::Release);
                }
                Recv::Eof => self.reading.store(false, Ordering::Release),
                Recv::Data(_) | Recv::Ping(_) | Recv::Pong => {}
            }
        }
        Ok(true)
    }

    /// Abruptly drops the connection and returns to [`Status::Closed`] in
    /// blocking mode. Safe in any state.
    pub fn reset(&self) {
        let mut rx = lock(&self.rx);
        let mut tx = lock(&self.tx);
        self.reset_locked(&mut rx, &mut tx);
    }

    fn reset_locked(&self, rx: &mut ReadSide, tx: &mut WriteSide) {
        if let Some(socket) = lock(&self.socket).take() {
            socket.shutdown();
        }
        rx.receiver.reset();
        rx.staging.clear();
        tx.buf.clear();
        tx.mask.reset();
        self.reading.store(false, Ordering::Release);
        self.writing.store(false, Ordering::Release);
        self.blocking.store(true, Ordering::Release);
        if self.status() != Status::Closed {
            self.set_status(Status::Closed);
        }
    }

    fn fail(&self, rx: &mut ReadSide, tx: &mut WriteSide, err: &WsError) {
        report(err);
        self.reset_locked(rx, tx);
    }

    /// Failure seen with only the write side held: re-take both sides in
    /// order, and reset unless the connection was replaced meanwhile.
    fn fail_from_writer(&self, failed: &Arc<Socket>, err: &WsError) {
        report(err);
        let mut rx = lock(&self.rx);
        let mut tx = lock(&self.tx);
        let same = self
            .socket()
            .is_some_and(|current| Arc::ptr_eq(&current, failed));
        if same {
            self.reset_locked(&mut rx, &mut tx);
        }
    }
}

fn queue_frame(tx: &mut WriteSide, opcode: OpCode, payload: &[u8]) {
    let WriteSide { buf, mask } = tx;
    mask.generate(&mut rand::rng());
    encode_frame(buf, opcode, payload, mask);
}

/// Writes out `tx.buf`; `Ok(false)` when the socket stopped accepting bytes.
fn flush_pending(socket: &Socket, tx: &mut WriteSide) -> Result<bool, WsError> {
    while !tx.buf.is_empty() {
        match socket.write(&tx.buf) {
            Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero).into()),
            Ok(n) => tx.buf.advance(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(socket.flushed()?)
}

/// `Ok(0)` at end of stream, `WouldBlock` when nothing is available yet.
impl Read for &WebSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match WebSocket::read(*self, buf, None) {
            None => Ok(0),
            Some(0) if !buf.is_empty() => Err(ErrorKind::WouldBlock.into()),
            Some(n) => Ok(n),
        }
    }
}

/// Every `write` call becomes one BINARY frame.
impl Write for &WebSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match WebSocket::write(*self, buf, None) {
            Progress::Complete | Progress::Incomplete => Ok(buf.len()),
            Progress::Failed => Err(ErrorKind::BrokenPipe.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match WebSocket::flush(*self, None) {
            Progress::Complete => Ok(()),
            Progress::Incomplete => Err(ErrorKind::WouldBlock.into()),
            Progress::Failed => Err(ErrorKind::BrokenPipe.into()),
        }
    }
}

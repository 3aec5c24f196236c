//! Non-blocking socket shared by the read and write sides of a connection.
//!
//! The TCP stream is always in non-blocking mode. Blocking behaviour is built
//! on top by [`Socket::wait`], which parks the caller on a `mio::Poll` until
//! the socket reports the requested readiness or a deadline passes.
//!
//! `mio` readiness is edge triggered, so every event bumps a per-direction
//! counter instead of setting a flag. A caller snapshots the counters with
//! [`Socket::marks`] before it touches the socket and waits for them to move;
//! no waiter can swallow an edge another one is waiting for.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use rustls::ClientConnection;

use crate::error::WsError;
use crate::config::WsConfig;
use crate::tls::{client_session, default_config};
use crate::url::WsUrl;

const SOCKET: Token = Token(0);

struct Poller {
    poll: Poll,
    events: Events,
}

/// Readiness event counts at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Marks {
    read: u64,
    write: u64,
}

pub struct Socket {
    tcp: TcpStream,
    tls: Option<Mutex<ClientConnection>>,
    poller: Mutex<Poller>,
    read_events: AtomicU64,
    write_events: AtomicU64,
    slice: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Socket {
    /// Starts a non-blocking connect to `url`; completion is observed with
    /// [`Socket::poll_connected`].
    pub fn connect(url: &WsUrl, config: &WsConfig) -> Result<Self, WsError> {
        let addr = (url.host.as_str(), url.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "host resolved to no address"))?;

        let mut tcp = TcpStream::connect(addr)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut tcp, SOCKET, Interest::READABLE | Interest::WRITABLE)?;

        let tls = if url.scheme.is_secure() {
            let tls_config = config.tls_config.clone().unwrap_or_else(default_config);
            Some(Mutex::new(client_session(&url.host, tls_config)?))
        } else {
            None
        };

        log::debug!("connecting to {addr} ({}:{})", url.host, url.port);
        Ok(Self {
            tcp,
            tls,
            poller: Mutex::new(Poller {
                poll,
                events: Events::with_capacity(8),
            }),
            read_events: AtomicU64::new(0),
            write_events: AtomicU64::new(0),
            slice: config.poll_slice,
        })
    }

    /// `Ok(false)` while the TCP connect is still in flight.
    pub fn poll_connected(&self) -> io::Result<bool> {
        if let Some(e) = self.tcp.take_error()? {
            return Err(e);
        }
        match self.tcp.peer_addr() {
            Ok(_) => {
                let _ = self.tcp.set_nodelay(true);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Reads plaintext. `WouldBlock` means nothing is available yet and
    /// `Ok(0)` means the peer closed the stream.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(tls) = &self.tls else {
            return (&self.tcp).read(buf);
        };
        let mut conn = lock(tls);
        loop {
            match conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            self.flush_tls(&mut conn)?;
            if conn.read_tls(&mut &self.tcp)? == 0 {
                return Ok(0);
            }
            conn.process_new_packets().map_err(io::Error::other)?;
        }
    }

    /// Writes plaintext; for TLS the bytes are accepted into the session and
    /// pushed to the socket as far as it allows.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let Some(tls) = &self.tls else {
            return (&self.tcp).write(buf);
        };
        let mut conn = lock(tls);
        let mut n = conn.writer().write(buf)?;
        if n == 0 && !buf.is_empty() {
            self.flush_tls(&mut conn)?;
            n = conn.writer().write(buf)?;
            if n == 0 {
                return Err(ErrorKind::WouldBlock.into());
            }
        }
        self.flush_tls(&mut conn)?;
        Ok(n)
    }

    /// True when no encrypted output is left waiting for the socket.
    pub fn flushed(&self) -> io::Result<bool> {
        match &self.tls {
            None => Ok(true),
            Some(tls) => {
                let mut conn = lock(tls);
                self.flush_tls(&mut conn)?;
                Ok(!conn.wants_write())
            }
        }
    }

    fn flush_tls(&self, conn: &mut ClientConnection) -> io::Result<()> {
        while conn.wants_write() {
            match conn.write_tls(&mut &self.tcp) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Readiness to wait for before retrying a read; a TLS session with
    /// output still queued also needs the socket writable.
    pub fn read_interest(&self) -> Interest {
        match &self.tls {
            Some(tls) if lock(tls).wants_write() => Interest::READABLE | Interest::WRITABLE,
            _ => Interest::READABLE,
        }
    }

    pub fn marks(&self) -> Marks {
        Marks {
            read: self.read_events.load(Ordering::Acquire),
            write: self.write_events.load(Ordering::Acquire),
        }
    }

    /// Parks until the socket reports `interest` after `since` was taken, or
    /// `deadline` passes. Returns `Ok(false)` on deadline.
    ///
    /// Reader and writer threads share one poller; each holds it for at most
    /// one slice and counts what it saw for the other.
    pub fn wait(
        &self,
        interest: Interest,
        since: Marks,
        deadline: Option<Instant>,
    ) -> io::Result<bool> {
        loop {
            let now = self.marks();
            if (interest.is_readable() && now.read != since.read)
                || (interest.is_writable() && now.write != since.write)
            {
                return Ok(true);
            }
            let timeout = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(false);
                    }
                    (d - now).min(self.slice)
                }
                None => self.slice,
            };

            let mut poller = lock(&self.poller);
            let Poller { poll, events } = &mut *poller;
            match poll.poll(events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            for ev in events.iter() {
                if ev.is_readable() || ev.is_read_closed() || ev.is_error() {
                    self.read_events.fetch_add(1, Ordering::AcqRel);
                }
                if ev.is_writable() || ev.is_write_closed() || ev.is_error() {
                    self.write_events.fetch_add(1, Ordering::AcqRel);
                }
            }
        }
    }

    pub fn shutdown(&self) {
        if let Some(tls) = &self.tls {
            let mut conn = lock(tls);
            conn.send_close_notify();
            let _ = self.flush_tls(&mut conn);
        }
        let _ = self.tcp.shutdown(Shutdown::Both);
    }
}

impl Read for &Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Socket::read(self, buf)
    }
}

//! # websockets-mio
//!
//! A WebSocket (RFC 6455) client over a non-blocking `mio` socket that is
//! driven entirely by its callers. There is no runtime and no background
//! thread: the same connection can be polled from an event loop in
//! non-blocking mode or used with plain blocking calls, each optionally
//! bounded by a timeout.
//!
//! ## Features
//!
//! - **Resumable everywhere**: handshake, frame decoding and frame writing all
//!   pick up exactly where the previous call stopped, at any byte boundary
//! - **Blocking or not**: flip [`WebSocket::set_blocking`] at any time
//! - **Timeouts**: every driving call takes an optional deadline and reports
//!   [`Progress::Incomplete`] instead of failing when it runs out
//! - **Control frames handled for you**: PINGs are answered, PONGs dropped,
//!   CLOSE ends the read side
//! - **TLS**: `wss://` through `rustls` with `webpki-roots` anchors
//!
//! ## Basic Example
//!
//! ```no_run
//! use std::time::Duration;
//! use websockets_mio::{Progress, WebSocket};
//!
//! fn main() -> Result<(), websockets_mio::WsError> {
//!     let ws = WebSocket::new("ws://127.0.0.1:9001/echo")?;
//!     if ws.handshake(Some(Duration::from_secs(5))) != Progress::Complete {
//!         return Ok(());
//!     }
//!
//!     if ws.write(b"Hello, WebSocket!", None) != Progress::Complete {
//!         return Ok(());
//!     }
//!
//!     let mut buf = [0u8; 1024];
//!     while let Some(n) = ws.read(&mut buf, Some(Duration::from_secs(1))) {
//!         if n == 0 {
//!             break;
//!         }
//!         println!("Received: {}", String::from_utf8_lossy(&buf[..n]));
//!     }
//!
//!     ws.close(Some(Duration::from_secs(3)));
//!     Ok(())
//! }
//! ```
//!
//! ## Polling Example
//!
//! ```no_run
//! use websockets_mio::{Progress, WebSocket};
//!
//! let ws = WebSocket::new("ws://127.0.0.1:9001/").unwrap();
//! ws.set_blocking(false);
//! while ws.handshake(None) == Progress::Incomplete {
//!     // do other work
//!     std::thread::yield_now();
//! }
//! ```
//!
//! ## Errors
//!
//! Constructors return [`WsError`]. Drive operations never do: when the
//! handshake, a frame, or the socket fails, the connection is reset to
//! [`Status::Closed`] and the error goes to a process-wide sink
//! ([`set_error_sink`]), which by default logs it through the `log` crate.

pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod http_upgrade;
pub mod mask;
pub mod recv;
pub mod tls;
pub mod transport;
pub mod url;

pub use client::{Progress, Status, WebSocket};
pub use config::WsConfig;
pub use error::{ErrorSink, WsError, set_error_sink};
pub use mask::MaskingKey;

//! A simple echo client demonstrating basic WebSocket usage.
//!
//! Connects to a WebSocket echo server, sends a message, prints the echoed
//! response and closes the connection. Pass a URL to use another server.

use std::time::Duration;

use anyhow::{Result, bail};
use websockets_mio::{Progress, WebSocket};

fn main() -> Result<()> {
    env_logger::init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "wss://echo.websocket.org/".to_owned());
    println!("Connecting to {url}...");

    let ws = WebSocket::new(&url)?;
    if ws.handshake(Some(Duration::from_secs(10))) != Progress::Complete {
        bail!("handshake with {url} did not complete");
    }

    let message = "Hello from websockets-mio!";
    if ws.write_text(message, Some(Duration::from_secs(5))) != Progress::Complete {
        bail!("could not send message");
    }
    println!("Message sent: {message}");
    println!("Waiting for echo...");

    // Some echo servers greet first; print everything that arrives for a moment.
    let mut buf = [0u8; 4096];
    let until = std::time::Instant::now() + Duration::from_secs(3);
    while std::time::Instant::now() < until {
        match ws.read(&mut buf, Some(Duration::from_millis(500))) {
            Some(0) => {}
            Some(n) => println!("Echo received: {}", String::from_utf8_lossy(&buf[..n])),
            None => {
                println!("Server closed the connection ({:?})", ws.peer_close_code());
                return Ok(());
            }
        }
    }

    match ws.close(Some(Duration::from_secs(3))) {
        Progress::Complete => println!("Closed cleanly"),
        other => println!("Close ended with {other:?}"),
    }
    Ok(())
}

use base64::{Engine as _, engine::general_purpose::STANDARD as b64};
use httparse::Status;
use rand::RngCore;
use sha1::{Digest, Sha1};
use smallvec::SmallVec;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const HEADER_HOST: &str = "Host";
pub const HEADER_CONNECTION: &str = "Connection";
pub const HEADER_UPGRADE: &str = "Upgrade";
pub const HEADER_SEC_WS_KEY: &str = "Sec-WebSocket-Key";
pub const HEADER_SEC_WS_VERSION: &str = "Sec-WebSocket-Version";
pub const HEADER_SEC_WS_ACCEPT: &str = "Sec-WebSocket-Accept";
pub const HEADER_SEC_WS_PROTOCOL: &str = "Sec-WebSocket-Protocol";
pub const HEADER_SEC_WS_EXTENSIONS: &str = "Sec-WebSocket-Extensions";

pub const TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(thiserror::Error, Debug)]
pub enum UpgradeErr {
    #[error("eof during handshake")]
    Eof,
    #[error("oversized handshake")]
    Oversized,
    #[error("bare LF in response head")]
    LineEnding,
    #[error("malformed response head")]
    Malformed,
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("missing or invalid {0} header")]
    Headers(&'static str),
    #[error("bad Sec-WebSocket-Accept")]
    Accept,
    #[error("server selected a subprotocol that was not offered")]
    Subprotocol,
    #[error("server selected an extension that was not offered")]
    Extension,
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),
}

/// 16 random bytes, base64 encoded, for `Sec-WebSocket-Key`.
pub fn generate_key<R: RngCore + ?Sized>(rng: &mut R) -> String {
    let mut key_bytes = [0u8; 16];
    rng.fill_bytes(&mut key_bytes);
    b64.encode(key_bytes)
}

/// The `Sec-WebSocket-Accept` value a conforming server answers `key` with.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    b64.encode(sha1.finalize())
}

/// Serialises the upgrade request. Every entry in `headers` is emitted as is,
/// so the caller is responsible for the mandatory ones.
pub fn build_request(path: &str, headers: &[(String, String)]) -> SmallVec<[u8; 512]> {
    const REQUEST_PREFIX: &[u8] = b"GET ";
    const REQUEST_SUFFIX: &[u8] = b" HTTP/1.1\r\n";
    const HEADER_SEPARATOR: &[u8] = b": ";
    const CRLF: &[u8] = b"\r\n";

    let headers_len: usize = headers
        .iter()
        .map(|(k, v)| k.len() + HEADER_SEPARATOR.len() + v.len() + CRLF.len())
        .sum();
    let total_len =
        REQUEST_PREFIX.len() + path.len() + REQUEST_SUFFIX.len() + headers_len + CRLF.len();

    let mut buffer = SmallVec::<[u8; 512]>::with_capacity(total_len);
    buffer.extend_from_slice(REQUEST_PREFIX);
    buffer.extend_from_slice(path.as_bytes());
    buffer.extend_from_slice(REQUEST_SUFFIX);
    for (k, v) in headers {
        buffer.extend_from_slice(k.as_bytes());
        buffer.extend_from_slice(HEADER_SEPARATOR);
        buffer.extend_from_slice(v.as_bytes());
        buffer.extend_from_slice(CRLF);
    }
    buffer.extend_from_slice(CRLF);
    buffer
}

/// True once `head` ends with the blank line closing the response head.
pub fn head_complete(head: &[u8]) -> bool {
    head.ends_with(TERMINATOR)
}

/// Response headers with lowercase names; repeated names are merged into a
/// single comma-separated value.
#[derive(Debug, Default)]
pub struct ResponseHead {
    pub code: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub fn parse_response(head: &[u8]) -> Result<ResponseHead, UpgradeErr> {
    for i in memchr::memchr_iter(b'\n', head) {
        if i == 0 || head[i - 1] != b'\r' {
            return Err(UpgradeErr::LineEnding);
        }
    }

    let mut raw = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut raw);
    match response.parse(head) {
        Ok(Status::Complete(_)) => {}
        _ => return Err(UpgradeErr::Malformed),
    }
    let code = response.code.ok_or(UpgradeErr::Malformed)?;

    let mut headers: Vec<(String, String)> = Vec::with_capacity(response.headers.len());
    for h in response.headers.iter() {
        let name = h.name.to_ascii_lowercase();
        let value = std::str::from_utf8(h.value)?.trim();
        match headers.iter_mut().find(|(k, _)| *k == name) {
            Some((_, merged)) => {
                merged.push_str(", ");
                merged.push_str(value);
            }
            None => headers.push((name, value.to_owned())),
        }
    }

    Ok(ResponseHead { code, headers })
}

/// Checks a parsed response against the key that was sent.
pub fn validate_response(head: &ResponseHead, sec_websocket_key: &str) -> Result<(), UpgradeErr> {
    if head.code != 101 {
        return Err(UpgradeErr::Status(head.code));
    }

    let connection = head
        .get(HEADER_CONNECTION)
        .ok_or(UpgradeErr::Headers(HEADER_CONNECTION))?;
    if !connection.eq_ignore_ascii_case("upgrade") {
        return Err(UpgradeErr::Headers(HEADER_CONNECTION));
    }

    let upgrade = head
        .get(HEADER_UPGRADE)
        .ok_or(UpgradeErr::Headers(HEADER_UPGRADE))?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(UpgradeErr::Headers(HEADER_UPGRADE));
    }

    let accept = head
        .get(HEADER_SEC_WS_ACCEPT)
        .ok_or(UpgradeErr::Headers(HEADER_SEC_WS_ACCEPT))?;
    if accept != accept_key(sec_websocket_key) {
        return Err(UpgradeErr::Accept);
    }

    if head.get(HEADER_SEC_WS_PROTOCOL).is_some() {
        return Err(UpgradeErr::Subprotocol);
    }
    if head.get(HEADER_SEC_WS_EXTENSIONS).is_some() || head.get("Sec-WebSocket-Extension").is_some()
    {
        return Err(UpgradeErr::Extension);
    }

    Ok(())
}

//! HTTP upgrade handshake for the gateway WebSocket.

use base64::Engine;
use sha1::{Digest, Sha1};
use std::collections::HashMap;

use crate::error::WsError;

/// Fixed GUID appended to the nonce when computing the accept key
/// (RFC 6455 §1.3).
const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A fresh 16-byte base64 nonce for `Sec-WebSocket-Key`.
pub fn nonce() -> String {
    let raw: [u8; 16] = rand::random();
    base64::engine::general_purpose::STANDARD.encode(raw)
}

/// The `Sec-WebSocket-Accept` value the server must echo for `key`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// The upgrade request for `path` on `host`.
pub fn upgrade_request(host: &str, path: &str, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}

/// Try to parse the server's upgrade response from the head of `buf`.
///
/// Returns `Ok(Some(consumed))` once a valid `101 Switching Protocols`
/// response with a matching accept key has been read, `Ok(None)` while the
/// headers are still incomplete.
pub fn parse_upgrade_response(buf: &[u8], key: &str) -> Result<Option<usize>, WsError> {
    let Some(end) = find_header_end(buf) else {
        return Ok(None);
    };

    let head = std::str::from_utf8(&buf[..end])
        .map_err(|_| WsError::Handshake("response headers are not utf-8".into()))?;
    let mut lines = head.split("\r\n");

    let status = lines.next().unwrap_or_default();
    if !status.starts_with("HTTP/1.1 101") {
        return Err(WsError::Handshake(format!("unexpected status line: {status}")));
    }

    let mut headers: HashMap<String, &str> = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim());
        }
    }

    let upgraded = headers
        .get("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !upgraded {
        return Err(WsError::Handshake("missing Upgrade: websocket header".into()));
    }

    match headers.get("sec-websocket-accept") {
        Some(accept) if *accept == accept_key(key) => Ok(Some(end + 4)),
        Some(_) => Err(WsError::BadAccept),
        None => Err(WsError::Handshake("missing Sec-WebSocket-Accept header".into())),
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

//! WebSocket upgrade handshake (spec.md §4.6, §8 S6).
//!
//! Only the handshake is in scope; application-level message framing is an
//! external collaborator handed the raw stream (spec.md §1). The
//! `Sec-WebSocket-Accept` derivation is grounded in
//! `rama_http_headers::SecWebSocketAccept` (`sha1` + `base64`, SHA-1 over
//! the client key concatenated with the RFC 6455 magic GUID).

use base64::Engine;
use sha1::{Digest, Sha1};

/// The GUID RFC 6455 §1.3 defines for deriving `Sec-WebSocket-Accept`.
const MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Derives the `Sec-WebSocket-Accept` header value from the client's
/// `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(MAGIC_GUID.as_bytes());
    let digest = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// `true` if the request headers ask for a WebSocket upgrade:
/// `Connection: Upgrade` and `Upgrade: websocket`.
pub fn is_upgrade_request(headers: &crate::headers::HeaderList) -> bool {
    headers.connection_has("upgrade")
        && headers
            .get_str("upgrade")
            .map_or(false, |v| v.eq_ignore_ascii_case("websocket"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc6455_example_vector() {
        // https://tools.ietf.org/html/rfc6455#section-1.2
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn detects_upgrade_request() {
        let mut h = crate::headers::HeaderList::new();
        h.add("Connection", "Upgrade");
        h.add("Upgrade", "websocket");
        assert!(is_upgrade_request(&h));
    }

    #[test]
    fn ignores_non_websocket_upgrade() {
        let mut h = crate::headers::HeaderList::new();
        h.add("Connection", "Upgrade");
        h.add("Upgrade", "h2c");
        assert!(!is_upgrade_request(&h));
    }
}

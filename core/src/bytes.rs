//! Byte-string helpers shared by the trie and the decoder's trace logging.

pub type TokenId = u32;

pub fn to_hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join("")
}

/// Render a byte string for logs: quoted lossy UTF-8 when printable,
/// hex otherwise, truncated to `max_len` bytes.
pub fn limit_bytes(bytes: &[u8], max_len: usize) -> String {
    let (head, ellipsis) = if bytes.len() > max_len {
        (&bytes[..max_len], "...")
    } else {
        (bytes, "")
    };
    let s = String::from_utf8_lossy(head);
    if s.contains('\u{fffd}') {
        format!("HEX[{}]{}", to_hex_string(head), ellipsis)
    } else {
        format!("{:?}{}", s, ellipsis)
    }
}

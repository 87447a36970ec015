//! Hex dump rendering for protocol errors.
//!
//! Grounded line-for-line in
//! `NetworkStreamClient::Implementation::Dump`: renders the active buffer
//! as a bracketed hex run with the offending byte wrapped in `<xx>`.

use std::fmt::Write;

/// Renders `buf[begin..end]` as `[ 01 02 <03> 04 ]`, bracketing the byte at
/// `highlight_offset` (relative to `begin`).
pub fn dump(buf: &[u8], begin: usize, end: usize, highlight_offset: usize) -> String {
    let mut out = String::new();
    out.push_str("[ ");
    for (i, b) in buf[begin..end].iter().enumerate() {
        if i == highlight_offset {
            let _ = write!(out, "<{:02x}> ", b);
        } else {
            let _ = write!(out, "{:02x} ", b);
        }
    }
    out.push(']');
    out
}

/// Full message matching spec.md §8 scenario 6:
/// `Protocol error: "..."`. Active buffer: `[ ... ]`. Expected byte: 0x..`.
pub fn format_protocol_error(
    log_tag: &str,
    message: &str,
    buf: &[u8],
    highlight_offset: usize,
    expected_byte: u8,
) -> String {
    format!(
        "{}Protocol error: \"{}\". Active buffer: {}. Expected byte: 0x{:02x}.",
        log_tag,
        message,
        dump(buf, 0, buf.len(), highlight_offset),
        expected_byte
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highlights_the_offending_byte() {
        let buf = [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c];
        let rendered = dump(&buf, 0, buf.len(), 5);
        assert_eq!(
            rendered,
            "[ 01 02 03 04 05 <06> 07 08 09 0a 0b 0c ]"
        );
    }

    #[test]
    fn formats_full_protocol_error_message() {
        let buf = [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c];
        let msg = format_protocol_error("[gateway] ", "unexpected byte", &buf, 5, 0x0a);
        assert!(msg.contains("Expected byte: 0x0a."));
        assert!(msg.contains("<06>"));
        assert!(msg.starts_with("[gateway] Protocol error:"));
    }
}

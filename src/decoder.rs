//! The polymorphic decoder interface the `StreamClient` read loop calls
//! into. This is the seam at which a broker-specific protocol plugs in;
//! the core depends only on this trait (spec.md §4.F, §9 "Decoder
//! polymorphism").

use crate::measurement::MeasurementToken;

/// Raised by a decoder when it encounters a byte it cannot make sense of.
/// Carries enough context for the client to render a hex dump: the offset
/// of the offending byte within the range it was given, and the byte value
/// the decoder expected instead.
#[derive(Debug, Clone)]
pub struct ProtocolSignal {
    pub message: String,
    /// Offset of the offending byte, relative to the `buffer_begin` the
    /// decoder was called with.
    pub offset: usize,
    pub expected: u8,
}

impl ProtocolSignal {
    pub fn new<S: Into<String>>(message: S, offset: usize, expected: u8) -> ProtocolSignal {
        ProtocolSignal {
            message: message.into(),
            offset,
            expected,
        }
    }
}

/// The capability set a broker gateway implements to plug its wire format
/// into the core. No assumption about length-prefixing, delimiters, or
/// self-describing sizes is made by the core — only that the decoder can
/// locate "the last byte of the last complete message" in a byte range.
pub trait Decoder {
    /// Locates the last byte of the last complete message in
    /// `buf[transfer_begin..transfer_end]` (all offsets relative to
    /// `buffer_begin`, which is always 0 for a single contiguous buffer but
    /// kept in the signature to mirror the spec's three-offset contract).
    /// Returns an offset in `[transfer_begin, transfer_end]`; equality with
    /// `transfer_end` means "no complete message present". Must be
    /// O(transferred bytes) and must not mutate decoder state.
    fn find_last_message_last_byte(
        &self,
        buf: &[u8],
        buffer_begin: usize,
        transfer_begin: usize,
        transfer_end: usize,
    ) -> Result<usize, ProtocolSignal>;

    /// Invoked at most once per completed read, when at least one complete
    /// message is present. `buf[buffer_begin..=last_byte_inclusive]` is the
    /// run of complete messages to dispatch. May mutate decoder state.
    fn handle_new_messages(
        &mut self,
        now: ::std::time::SystemTime,
        buf: &[u8],
        buffer_begin: usize,
        last_byte_inclusive: usize,
        measurement: MeasurementToken,
    ) -> Result<(), ProtocolSignal>;

    /// Called once, from `StreamClient::start`, before the first read is
    /// armed.
    fn on_start(&mut self) {}

    /// Called once, from `StreamClient::stop`.
    fn on_stop(&mut self) {}

    /// A short tag prefixed to log lines for this decoder's endpoint.
    fn get_log_tag(&self) -> &str {
        ""
    }
}

/// A reference decoder used only by tests: messages are terminated by
/// `\r\n`, matching spec.md §8 scenarios 1 and 2. Complete messages are
/// appended to `received` verbatim (CRLF included).
#[derive(Default)]
pub struct LineDecoder {
    pub received: Vec<Vec<u8>>,
}

impl Decoder for LineDecoder {
    fn find_last_message_last_byte(
        &self,
        buf: &[u8],
        _buffer_begin: usize,
        transfer_begin: usize,
        transfer_end: usize,
    ) -> Result<usize, ProtocolSignal> {
        let window = &buf[transfer_begin..transfer_end];
        let mut last_end = None;
        let mut i = 0;
        while i + 1 < window.len() {
            if window[i] == b'\r' && window[i + 1] == b'\n' {
                last_end = Some(transfer_begin + i + 2);
                i += 2;
            } else {
                i += 1;
            }
        }
        Ok(last_end.unwrap_or(transfer_end))
    }

    fn handle_new_messages(
        &mut self,
        _now: ::std::time::SystemTime,
        buf: &[u8],
        buffer_begin: usize,
        last_byte_inclusive: usize,
        _measurement: MeasurementToken,
    ) -> Result<(), ProtocolSignal> {
        let region = &buf[buffer_begin..last_byte_inclusive];
        let mut start = 0;
        let mut i = 0;
        while i + 1 < region.len() {
            if region[i] == b'\r' && region[i + 1] == b'\n' {
                self.received.push(region[start..i + 2].to_vec());
                i += 2;
                start = i;
            } else {
                i += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_last_crlf_boundary() {
        let dec = LineDecoder::default();
        let buf = b"ABC\r\nDEF\r\nGHI";
        let end = dec
            .find_last_message_last_byte(buf, 0, 0, buf.len())
            .unwrap();
        assert_eq!(end, 10);
        assert_eq!(&buf[..end], b"ABC\r\nDEF\r\n");
    }

    #[test]
    fn no_boundary_returns_transfer_end() {
        let dec = LineDecoder::default();
        let buf = b"no terminator";
        let end = dec
            .find_last_message_last_byte(buf, 0, 0, buf.len())
            .unwrap();
        assert_eq!(end, buf.len());
    }

    #[test]
    fn dispatches_each_complete_message() {
        let mut dec = LineDecoder::default();
        let buf = b"ABC\r\nDEF\r\nGHI";
        let now = ::std::time::SystemTime::now();
        dec.handle_new_messages(now, buf, 0, 10, MeasurementToken::now())
            .unwrap();
        assert_eq!(dec.received, vec![b"ABC\r\n".to_vec(), b"DEF\r\n".to_vec()]);
    }
}

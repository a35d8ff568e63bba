//! UTF-8 boundary buffering for streamed detokenizer output
//!
//! The detokenizer emits arbitrary byte slices: a multi-byte code point can
//! be split across two token emissions. SSE payloads are embedded in JSON,
//! so every emitted chunk must be complete, valid UTF-8. [`Utf8Buffer`]
//! carries the incomplete trailing sequence from one emission to the next
//! and never lets a partial or invalid sequence escape.

/// Number of trailing bytes that form an incomplete UTF-8 sequence.
///
/// Scans backwards at most 4 bytes for the start byte of the last code
/// point and compares its declared length against the bytes available.
/// Returns 0 when the slice ends on a complete character (or when the
/// trailing bytes are not a valid sequence at all, which full validation
/// handles separately).
#[must_use]
pub fn incomplete_suffix_len(bytes: &[u8]) -> usize {
    if bytes.is_empty() {
        return 0;
    }
    let len = bytes.len();
    for i in 1..=4.min(len) {
        let c = bytes[len - i];
        // Continuation byte (10xxxxxx): keep looking for the start byte.
        if c & 0xC0 == 0x80 {
            continue;
        }
        let expected = match c {
            b if b & 0x80 == 0x00 => 1,
            b if b & 0xE0 == 0xC0 => 2,
            b if b & 0xF0 == 0xE0 => 3,
            b if b & 0xF8 == 0xF0 => 4,
            _ => return 0, // invalid start byte
        };
        if i < expected {
            return i;
        }
        return 0;
    }
    0
}

/// Length of the longest valid UTF-8 prefix of `bytes`.
///
/// Truncates at the first invalid start byte, invalid continuation byte,
/// or incomplete trailing sequence.
#[must_use]
pub fn valid_prefix_len(bytes: &[u8]) -> usize {
    let mut len = 0;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let char_len = match c {
            b if b & 0x80 == 0x00 => 1,
            b if b & 0xE0 == 0xC0 => 2,
            b if b & 0xF0 == 0xE0 => 3,
            b if b & 0xF8 == 0xF0 => 4,
            _ => break,
        };
        if i + char_len > bytes.len() {
            break;
        }
        if bytes[i + 1..i + char_len].iter().any(|&b| b & 0xC0 != 0x80) {
            break;
        }
        i += char_len;
        len = i;
    }
    len
}

/// Carries incomplete multi-byte sequences across detokenizer emissions.
#[derive(Debug, Default)]
pub struct Utf8Buffer {
    carry: Vec<u8>,
}

impl Utf8Buffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no bytes are being carried
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.carry.is_empty()
    }

    /// Append a detokenizer emission and return the complete UTF-8 portion.
    ///
    /// The trailing incomplete sequence (at most 3 bytes) stays buffered
    /// for the next call. Invalid bytes that can never complete are
    /// dropped with a warning rather than emitted.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        if bytes.is_empty() && self.carry.is_empty() {
            return String::new();
        }
        self.carry.extend_from_slice(bytes);

        let incomplete = incomplete_suffix_len(&self.carry);
        let complete = self.carry.len() - incomplete;
        let mut head: Vec<u8> = self.carry.drain(..complete).collect();

        let valid = valid_prefix_len(&head);
        if valid < head.len() {
            tracing::warn!(
                dropped = head.len() - valid,
                "dropping invalid UTF-8 bytes from detokenizer output"
            );
            head.truncate(valid);
        }
        // Only validated bytes remain.
        String::from_utf8(head).unwrap_or_default()
    }

    /// Flush the buffer at stream end.
    ///
    /// Emits the longest valid prefix of whatever is still carried and
    /// discards the rest, so a stream that ends mid-character never leaks
    /// a partial sequence into a JSON payload.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.carry);
        let valid = valid_prefix_len(&rest);
        if valid < rest.len() {
            tracing::warn!(
                dropped = rest.len() - valid,
                "discarding incomplete UTF-8 sequence at stream end"
            );
        }
        String::from_utf8(rest[..valid].to_vec()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ascii_passes_through() {
        let mut buf = Utf8Buffer::new();
        assert_eq!(buf.push(b"hello"), "hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_slice_is_noop() {
        let mut buf = Utf8Buffer::new();
        assert_eq!(buf.push(b""), "");
        assert_eq!(buf.finish(), "");
    }

    #[test]
    fn test_split_three_byte_sequence() {
        // "中文" = e4 b8 ad e6 96 87, split mid-character
        let mut buf = Utf8Buffer::new();
        assert_eq!(buf.push(&[0xe4, 0xb8]), "");
        assert!(!buf.is_empty());
        assert_eq!(buf.push(&[0xad, 0xe6, 0x96, 0x87]), "中文");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_split_four_byte_emoji() {
        let emoji = "🚀".as_bytes(); // f0 9f 9a 80
        let mut buf = Utf8Buffer::new();
        assert_eq!(buf.push(&emoji[..1]), "");
        assert_eq!(buf.push(&emoji[1..3]), "");
        assert_eq!(buf.push(&emoji[3..]), "🚀");
    }

    #[test]
    fn test_complete_char_with_trailing_partial() {
        let bytes = "a中".as_bytes();
        let mut buf = Utf8Buffer::new();
        assert_eq!(buf.push(&bytes[..3]), "a");
        assert_eq!(buf.push(&bytes[3..]), "中");
    }

    #[test]
    fn test_finish_discards_incomplete_tail() {
        let mut buf = Utf8Buffer::new();
        assert_eq!(buf.push(&[b'o', b'k', 0xe4, 0xb8]), "ok");
        assert_eq!(buf.finish(), "");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_finish_emits_valid_prefix() {
        let mut buf = Utf8Buffer::new();
        buf.carry = b"ab\xff\xffcd".to_vec();
        assert_eq!(buf.finish(), "ab");
    }

    #[test]
    fn test_invalid_start_byte_dropped() {
        let mut buf = Utf8Buffer::new();
        let out = buf.push(&[b'x', 0xff, b'y']);
        // Truncated at the invalid byte; nothing invalid is ever emitted.
        assert_eq!(out, "x");
    }

    #[test]
    fn test_incomplete_suffix_len_cases() {
        assert_eq!(incomplete_suffix_len(b""), 0);
        assert_eq!(incomplete_suffix_len(b"abc"), 0);
        assert_eq!(incomplete_suffix_len(&[0xe4]), 1);
        assert_eq!(incomplete_suffix_len(&[0xe4, 0xb8]), 2);
        assert_eq!(incomplete_suffix_len(&[0xe4, 0xb8, 0xad]), 0);
        assert_eq!(incomplete_suffix_len(&[0xf0, 0x9f, 0x9a]), 3);
        assert_eq!(incomplete_suffix_len(&[b'a', 0xc3]), 1);
    }

    #[test]
    fn test_valid_prefix_len_cases() {
        assert_eq!(valid_prefix_len(b"abc"), 3);
        assert_eq!(valid_prefix_len("中文".as_bytes()), 6);
        assert_eq!(valid_prefix_len(&[0xff, b'a']), 0);
        assert_eq!(valid_prefix_len(&[b'a', 0xe4, 0xb8]), 1);
        // Continuation byte in start position
        assert_eq!(valid_prefix_len(&[0x80, b'a']), 0);
    }

    proptest! {
        /// Any chunking of a valid string reassembles exactly.
        #[test]
        fn prop_chunked_roundtrip(s in "\\PC{0,64}", cut in 0usize..64) {
            let bytes = s.as_bytes();
            let cut = cut.min(bytes.len());
            let mut buf = Utf8Buffer::new();
            let mut out = buf.push(&bytes[..cut]);
            out.push_str(&buf.push(&bytes[cut..]));
            out.push_str(&buf.finish());
            prop_assert_eq!(out, s);
        }

        /// Arbitrary bytes never panic and never produce invalid output.
        #[test]
        fn prop_arbitrary_bytes_safe(chunks in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..16), 0..8)) {
            let mut buf = Utf8Buffer::new();
            for chunk in &chunks {
                let s = buf.push(chunk);
                prop_assert!(std::str::from_utf8(s.as_bytes()).is_ok());
            }
            let s = buf.finish();
            prop_assert!(std::str::from_utf8(s.as_bytes()).is_ok());
        }
    }
}

//! Streaming UTF-8 decoding for response bodies.
//!
//! HTTP chunks are cut at arbitrary byte offsets, so a multi-byte character
//! can straddle two chunks. `Utf8ChunkDecoder` holds back an incomplete
//! trailing sequence until the rest of it arrives.

#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the complete characters in `pending + chunk`. Invalid sequences
    /// become U+FFFD; an incomplete sequence at the end is kept for later.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let input = if self.pending.is_empty() {
            std::borrow::Cow::Borrowed(chunk)
        } else {
            let mut joined = std::mem::take(&mut self.pending);
            joined.extend_from_slice(chunk);
            std::borrow::Cow::Owned(joined)
        };

        let mut out = String::with_capacity(input.len());
        let mut rest: &[u8] = &input;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush a held-back partial sequence at end of stream.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        self.pending.clear();
        char::REPLACEMENT_CHARACTER.to_string()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

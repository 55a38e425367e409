//! Streaming UTF-8 decoding for raw PTY chunks.

/// Buffers incomplete multi-byte sequences across chunk boundaries so that
/// raw PTY reads never produce replacement characters from split
/// characters. Genuinely invalid bytes still become U+FFFD.
pub struct Utf8StreamDecoder {
    buf: Vec<u8>,
}

impl Default for Utf8StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Drop any buffered incomplete bytes. Call after broadcast lag: the
    /// continuation bytes were in a dropped chunk and will never arrive.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Feed a chunk and return the longest valid UTF-8 prefix. A trailing
    /// incomplete sequence is retained for the next call.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.buf.extend_from_slice(chunk);
        let mut result = String::new();

        loop {
            match std::str::from_utf8(&self.buf) {
                Ok(s) => {
                    result.push_str(s);
                    self.buf.clear();
                    break;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    if valid_up_to > 0 {
                        // Safety: from_utf8 validated these bytes
                        result.push_str(std::str::from_utf8(&self.buf[..valid_up_to]).unwrap());
                    }

                    match e.error_len() {
                        None => {
                            // Incomplete sequence at the end, keep for next call
                            self.buf = self.buf[valid_up_to..].to_vec();
                            break;
                        }
                        Some(len) => {
                            result.push('\u{FFFD}');
                            self.buf = self.buf[valid_up_to + len..].to_vec();
                        }
                    }
                }
            }
        }

        result
    }
}

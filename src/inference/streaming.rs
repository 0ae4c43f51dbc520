//! Streaming text decoding
//!
//! Token pieces are raw bytes and a multi-byte character may be split across
//! two tokens. `TokenDecoder` holds back incomplete sequences so every piece
//! handed to the caller is valid UTF-8.

/// Incremental UTF-8 decoder for token byte pieces
#[derive(Debug, Default)]
pub struct TokenDecoder {
    pending: Vec<u8>,
}

impl TokenDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the bytes of one token and return whatever text is now complete.
    ///
    /// The result may be empty when the token ends inside a character.
    /// Invalid byte sequences are replaced with U+FFFD.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // valid_up_to guarantees this prefix decodes
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete sequence at the end, wait for more bytes
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush any held-back bytes at end of generation
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }

    /// Returns true if bytes are being held back
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

//! Splitting evaluator output at the end-of-output sentinel.
//!
//! The evaluator prints the session token after an evaluation's output and
//! then reports the outcome on the socket. Output arrives in arbitrary
//! chunks, so a token (or a multi-byte UTF-8 character) may straddle a chunk
//! boundary; those bytes are held back until the next chunk decides them.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

static COLOR_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("\x1b[^m]*m").expect("valid regex for color escapes"));

/// Remove terminal color escape sequences.
pub fn strip_color(text: &str) -> Cow<'_, str> {
    COLOR_ESCAPE.replace_all(text, "")
}

/// Output decided by one [`TokenSplitter::push`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Split {
    /// Text known to precede the token
    pub text: String,
    /// The token was seen; anything after it in the chunk was discarded
    pub found_token: bool,
}

#[derive(Debug)]
pub struct TokenSplitter {
    token: Vec<u8>,
    pending: Vec<u8>,
}

impl TokenSplitter {
    pub fn new(token: &str) -> Self {
        Self {
            token: token.as_bytes().to_vec(),
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Split {
        self.pending.extend_from_slice(chunk);

        // The last token in the chunk ends the operation
        if let Some(at) = rfind(&self.pending, &self.token) {
            let text = String::from_utf8_lossy(&self.pending[..at]).into_owned();
            self.pending.clear();
            return Split {
                text,
                found_token: true,
            };
        }

        let mut emit = self.pending.len() - partial_token_len(&self.pending, &self.token);
        if let Err(e) = std::str::from_utf8(&self.pending[..emit]) {
            // Hold an incomplete trailing character; invalid bytes elsewhere
            // are replaced below.
            if e.error_len().is_none() {
                emit = e.valid_up_to();
            }
        }
        let text = String::from_utf8_lossy(&self.pending[..emit]).into_owned();
        self.pending.drain(..emit);
        Split {
            text,
            found_token: false,
        }
    }
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

/// Length of the longest token prefix that ends `pending`.
fn partial_token_len(pending: &[u8], token: &[u8]) -> usize {
    (1..token.len())
        .rev()
        .find(|&len| pending.ends_with(&token[..len]))
        .unwrap_or(0)
}

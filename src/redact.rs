//! Streaming secret redaction.
//!
//! Replaces every occurrence of a set of secret literals in a byte stream
//! with `[REDACTED]`, including occurrences that straddle chunk boundaries.
//! Matching is leftmost-longest: overlapping candidates prefer the longer
//! match, equal lengths prefer the earlier start. Patterns are literals, so
//! no escaping is ever needed. Operates on raw UTF-8 bytes.

use aho_corasick::{AhoCorasick, MatchKind};

pub const REDACTED: &[u8] = b"[REDACTED]";

/// Streaming replacement transform over one byte stream.
///
/// Between pushes the transform withholds the last `maxSecretLen - 1` bytes,
/// the longest tail that could still be the prefix of a secret completed by
/// the next chunk. One instance per stream; not shared across pipes.
pub struct Redactor {
    matcher: Option<AhoCorasick>,
    max_len: usize,
    pending: Vec<u8>,
}

impl Redactor {
    /// Build a redactor over a set of secret literals. Empty literals are
    /// dropped; with no remaining literals the transform is the identity.
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let patterns: Vec<Vec<u8>> = secrets
            .into_iter()
            .map(|s| s.as_ref().to_vec())
            .filter(|s| !s.is_empty())
            .collect();

        let max_len = patterns.iter().map(Vec::len).max().unwrap_or(0);
        let matcher = if patterns.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::builder()
                    .match_kind(MatchKind::LeftmostLongest)
                    .build(&patterns)
                    .expect("literal patterns always build"),
            )
        };

        Self {
            matcher,
            max_len,
            pending: Vec::new(),
        }
    }

    /// Feed a chunk, returning the bytes that are safe to emit. Zero-length
    /// chunks are fine.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        let Some(matcher) = &self.matcher else {
            // Identity transform; nothing is ever withheld.
            let mut out = Vec::with_capacity(chunk.len());
            out.extend_from_slice(chunk);
            return out;
        };

        self.pending.extend_from_slice(chunk);

        // Bytes past this point could still be the start of a secret that
        // completes in a later chunk.
        let holdback = self.max_len - 1;
        let boundary = self.pending.len().saturating_sub(holdback);

        let mut out = Vec::new();
        let mut cursor = 0;
        for m in matcher.find_iter(&self.pending) {
            if m.start() >= boundary {
                break;
            }
            out.extend_from_slice(&self.pending[cursor..m.start()]);
            out.extend_from_slice(REDACTED);
            // A match may extend past the boundary; it is emitted in full
            // and the emission point advances with it.
            cursor = m.end();
        }

        let emit_to = boundary.max(cursor);
        out.extend_from_slice(&self.pending[cursor..emit_to]);
        self.pending.drain(..emit_to);
        out
    }

    /// Close the stream: redact and emit the withheld tail.
    pub fn finish(&mut self) -> Vec<u8> {
        let pending = std::mem::take(&mut self.pending);
        let Some(matcher) = &self.matcher else {
            return pending;
        };

        let mut out = Vec::new();
        let mut cursor = 0;
        for m in matcher.find_iter(&pending) {
            out.extend_from_slice(&pending[cursor..m.start()]);
            out.extend_from_slice(REDACTED);
            cursor = m.end();
        }
        out.extend_from_slice(&pending[cursor..]);
        out
    }
}

//! Sentence accumulator: groups LLM token deltas into sentence-sized
//! chunks for TTS.
//!
//! A sentence boundary is `.`, `!`, `?`, or a newline. If no boundary
//! arrives within the configured token window, the buffer is soft-flushed
//! anyway, bounding first-audio latency. The concatenation of everything
//! flushed over a turn equals the raw delta stream exactly; nothing is
//! trimmed, lost, or duplicated.

/// Incremental sentence grouping over a token/delta stream.
pub struct SentenceAccumulator {
    buf: String,
    tokens_since_flush: usize,
    in_word: bool,
    soft_flush_tokens: usize,
}

fn is_boundary(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '\n')
}

impl SentenceAccumulator {
    pub fn new(soft_flush_tokens: usize) -> Self {
        Self {
            buf: String::new(),
            tokens_since_flush: 0,
            in_word: false,
            soft_flush_tokens: soft_flush_tokens.max(1),
        }
    }

    /// Feed one delta; returns zero or more flushed sentences.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        let mut flushed = Vec::new();

        for c in delta.chars() {
            self.buf.push(c);

            // Whitespace-delimited words stand in for tokens.
            if c.is_whitespace() {
                if self.in_word {
                    self.tokens_since_flush += 1;
                }
                self.in_word = false;
            } else {
                self.in_word = true;
            }

            if is_boundary(c) {
                flushed.push(self.take());
            } else if !self.in_word && self.tokens_since_flush >= self.soft_flush_tokens {
                flushed.push(self.take());
            }
        }

        flushed
    }

    /// Force out whatever remains (end of the LLM stream).
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discard buffered text (barge-in).
    pub fn clear(&mut self) {
        self.buf.clear();
        self.tokens_since_flush = 0;
        self.in_word = false;
    }

    fn take(&mut self) -> String {
        self.tokens_since_flush = 0;
        self.in_word = false;
        std::mem::take(&mut self.buf)
    }
}

//! Incremental thinking/answer separation.
//!
//! Models with a reasoning preamble emit `<thinking text><marker><answer>`
//! as one token stream, and the marker can be torn across any number of
//! chunk boundaries. The splitter is a small state machine over an owned
//! buffer: text before the first marker occurrence is thinking, text after
//! it is answer, and a trailing strict prefix of the marker is held back
//! until a later fragment resolves it one way or the other.

/// Text classified by one [`ThinkingSplitter::push`] or
/// [`ThinkingSplitter::finish`] call, in arrival order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SplitOutput {
    /// Reasoning text. Never forwarded in the client delta stream.
    pub thinking: String,
    /// Answer text.
    pub answer: String,
}

impl SplitOutput {
    fn answer_only(text: &str) -> Self {
        Self {
            thinking: String::new(),
            answer: text.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// No marker seen yet; unclassified bytes may still turn out to be it.
    AwaitingMarker,
    /// Marker consumed; everything from here on is answer text verbatim.
    InAnswer,
}

/// Per-session splitter state machine.
///
/// Construct with `None` for models without thinking capability — every
/// fragment then passes through as answer text with no scanning.
#[derive(Debug)]
pub struct ThinkingSplitter {
    marker: Option<String>,
    /// Bytes not yet classified: at most `marker.len() - 1` trailing bytes
    /// that form a strict prefix of the marker.
    pending: String,
    phase: Phase,
}

impl ThinkingSplitter {
    /// Create a splitter for the given marker.
    pub fn new(marker: Option<&str>) -> Self {
        let marker = marker.filter(|m| !m.is_empty()).map(str::to_string);
        Self {
            phase: if marker.is_some() {
                Phase::AwaitingMarker
            } else {
                Phase::InAnswer
            },
            marker,
            pending: String::new(),
        }
    }

    /// Bytes currently held back as a possible marker prefix.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Classify one content fragment.
    pub fn push(&mut self, fragment: &str) -> SplitOutput {
        if self.phase == Phase::InAnswer {
            return SplitOutput::answer_only(fragment);
        }
        // phase == AwaitingMarker implies a marker is configured
        let marker = self.marker.as_deref().unwrap_or_default().to_string();

        let mut out = SplitOutput::default();
        self.pending.push_str(fragment);

        if let Some(pos) = self.pending.find(&marker) {
            // First occurrence splits the stream; later occurrences are
            // literal answer text.
            out.thinking.push_str(&self.pending[..pos]);
            out.answer.push_str(&self.pending[pos + marker.len()..]);
            self.pending.clear();
            self.phase = Phase::InAnswer;
            return out;
        }

        // No full match: hold back the longest trailing strict prefix of
        // the marker (at most marker.len() - 1 bytes), emit the rest.
        let keep = trailing_marker_prefix(&self.pending, &marker);
        let emit = self.pending.len() - keep;
        out.thinking.push_str(&self.pending[..emit]);
        drop(self.pending.drain(..emit));
        out
    }

    /// Flush held-back bytes at end of stream.
    ///
    /// A partial-match suffix that was never completed was not a marker;
    /// it belongs to whichever destination is current.
    pub fn finish(&mut self) -> SplitOutput {
        let pending = std::mem::take(&mut self.pending);
        match self.phase {
            Phase::AwaitingMarker => SplitOutput {
                thinking: pending,
                answer: String::new(),
            },
            Phase::InAnswer => SplitOutput::answer_only(&pending),
        }
    }

    /// Whether the marker has been consumed.
    pub fn marker_seen(&self) -> bool {
        self.marker.is_some() && self.phase == Phase::InAnswer
    }
}

/// Length of the longest strict prefix of `marker` that `text` ends with.
fn trailing_marker_prefix(text: &str, marker: &str) -> usize {
    let max = marker.len().saturating_sub(1).min(text.len());
    for k in (1..=max).rev() {
        if marker.is_char_boundary(k) && text.ends_with(&marker[..k]) {
            return k;
        }
    }
    0
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

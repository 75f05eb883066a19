//! Incremental sentence segmentation of a streamed reply.
//!
//! Fragments arrive as the model produces them; complete sentences are
//! emitted as soon as their boundary is certain so synthesis can start
//! before the reply is finished. Fenced code blocks never reach synthesis:
//! each one is replaced by a fixed placeholder sentence.

pub mod speech;

use tracing::debug;

use crate::config::SegmenterConfig;

pub const CODE_PLACEHOLDER: &str = "Here is some code; see the chat for details.";

const FENCE: &str = "```";

/// Words whose trailing `.` never ends a sentence (compared lowercase).
const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "vs", "e.g", "i.e", "approx", "fig", "inc",
    "ltd", "mt", "ave",
];

/// Abbreviations only in this exact form; lowercase they are ordinary words.
const CAPITALISED_ABBREVIATIONS: &[&str] = &["No", "Co", "St"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Prose,
    CodePlaceholder,
}

/// A complete, synthesis-ready span of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceUnit {
    pub seq: u64,
    pub text: String,
    pub kind: UnitKind,
}

pub struct SentenceSegmenter {
    buffer: String,
    in_code: bool,
    next_seq: u64,
    max_unit_chars: usize,
    abbreviations: Vec<String>,
}

impl SentenceSegmenter {
    pub fn new(config: &SegmenterConfig) -> Self {
        let mut abbreviations: Vec<String> = ABBREVIATIONS.iter().map(|a| a.to_string()).collect();
        abbreviations.extend(
            config
                .abbreviations
                .iter()
                .map(|a| a.trim_end_matches('.').to_lowercase()),
        );

        Self {
            buffer: String::new(),
            in_code: false,
            next_seq: 0,
            max_unit_chars: config.max_unit_chars,
            abbreviations,
        }
    }

    /// Append a fragment and return every unit it completed.
    pub fn feed(&mut self, fragment: &str) -> Vec<SentenceUnit> {
        let mut units = Vec::new();
        if fragment.is_empty() {
            return units;
        }
        self.buffer.push_str(fragment);
        self.drain_complete(&mut units);
        units
    }

    /// End of stream: whatever is left becomes the final unit.
    pub fn flush(&mut self) -> Option<SentenceUnit> {
        let rest = std::mem::take(&mut self.buffer);
        if self.in_code {
            // unterminated fence, the placeholder was already emitted
            self.in_code = false;
            return None;
        }
        self.make_unit(&rest, UnitKind::Prose)
    }

    /// Drop buffered text and code state (turn cancelled).
    pub fn reset(&mut self) {
        if !self.buffer.is_empty() {
            debug!("Segmenter discarding {} buffered bytes", self.buffer.len());
        }
        self.buffer.clear();
        self.in_code = false;
    }

    fn drain_complete(&mut self, units: &mut Vec<SentenceUnit>) {
        loop {
            if self.in_code {
                match self.buffer.find(FENCE) {
                    Some(pos) => {
                        self.buffer.drain(..pos + FENCE.len());
                        self.in_code = false;
                        continue;
                    }
                    None => {
                        // keep a possible partial closing fence
                        let ticks = self.buffer.len() - self.buffer.trim_end_matches('`').len();
                        let cut = self.buffer.len() - ticks.min(FENCE.len() - 1);
                        self.buffer.drain(..cut);
                        return;
                    }
                }
            }

            let fence = self.buffer.find(FENCE);
            let scan_end = fence.unwrap_or(self.buffer.len());

            if let Some(end) = self.find_boundary(&self.buffer[..scan_end], fence.is_some()) {
                let sentence: String = self.buffer.drain(..end).collect();
                units.extend(self.make_unit(&sentence, UnitKind::Prose));
                continue;
            }

            if let Some(pos) = fence {
                let before: String = self.buffer.drain(..pos).collect();
                units.extend(self.make_unit(&before, UnitKind::Prose));
                self.buffer.drain(..FENCE.len());
                self.in_code = true;
                units.extend(self.make_unit(CODE_PLACEHOLDER, UnitKind::CodePlaceholder));
                continue;
            }

            if let Some(split) = self.overflow_split() {
                let chunk: String = self.buffer.drain(..split).collect();
                units.extend(self.make_unit(&chunk, UnitKind::Prose));
                continue;
            }

            return;
        }
    }

    /// Byte offset just past the first certain sentence end in `text`.
    ///
    /// A terminator run needs whitespace after it; a `.` followed by a digit
    /// (`2.1`) therefore never ends a sentence. A terminator at the very end
    /// of `text` is undecided unless a code fence follows it.
    fn find_boundary(&self, text: &str, fence_follows: bool) -> Option<usize> {
        let bytes = text.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            if !is_terminator(bytes[i]) {
                i += 1;
                continue;
            }

            let mut end = i + 1;
            while end < bytes.len() && is_terminator(bytes[end]) {
                end += 1;
            }
            let single_dot = bytes[i] == b'.' && end == i + 1;
            while end < bytes.len() && is_closer(bytes[end]) {
                end += 1;
            }

            let guarded = single_dot && self.is_guarded(text, i);

            if end == bytes.len() {
                return (fence_follows && !guarded).then_some(end);
            }
            if !guarded && text[end..].starts_with(char::is_whitespace) {
                return Some(end);
            }
            i = end;
        }

        None
    }

    /// Does the `.` at `dot` belong to an abbreviation, initial or number?
    fn is_guarded(&self, text: &str, dot: usize) -> bool {
        let before = &text[..dot];
        let after = &text[dot + 1..];

        let digit_before = before.ends_with(|c: char| c.is_ascii_digit());
        let digit_after = after.starts_with(|c: char| c.is_ascii_digit());
        if digit_before && digit_after {
            return true;
        }

        let word = before
            .rsplit(char::is_whitespace)
            .next()
            .unwrap_or("")
            .trim_start_matches(|c: char| !c.is_alphanumeric());
        if word.is_empty() {
            return false;
        }

        let lower = word.to_lowercase();
        if self.abbreviations.iter().any(|a| *a == lower)
            || CAPITALISED_ABBREVIATIONS.contains(&word)
        {
            return true;
        }

        let mut chars = word.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            // single initial, but not the words "I" and "A"
            return c.is_uppercase() && c != 'I' && c != 'A';
        }

        // dotted initialisms such as "U.S"
        word.contains('.') && word.split('.').all(|part| part.chars().count() == 1)
    }

    /// Split point for a run-on longer than `max_unit_chars`.
    fn overflow_split(&self) -> Option<usize> {
        if self.max_unit_chars == 0 || self.buffer.len() <= self.max_unit_chars {
            return None;
        }

        let mut limit = self.max_unit_chars;
        while !self.buffer.is_char_boundary(limit) {
            limit -= 1;
        }

        match self.buffer[..limit].rfind(char::is_whitespace) {
            Some(pos) if !self.buffer[..pos].trim().is_empty() => Some(pos),
            _ => self.buffer[limit..]
                .find(char::is_whitespace)
                .map(|pos| limit + pos),
        }
    }

    fn make_unit(&mut self, text: &str, kind: UnitKind) -> Option<SentenceUnit> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let unit = SentenceUnit {
            seq: self.next_seq,
            text: text.to_string(),
            kind,
        };
        self.next_seq += 1;
        debug!("Unit #{}: \"{}\"", unit.seq, unit.text);
        Some(unit)
    }
}

fn is_terminator(b: u8) -> bool {
    matches!(b, b'.' | b'!' | b'?')
}

fn is_closer(b: u8) -> bool {
    matches!(b, b'"' | b'\'' | b')' | b']')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segmenter() -> SentenceSegmenter {
        SentenceSegmenter::new(&SegmenterConfig::default())
    }

    fn run(fragments: &[&str]) -> Vec<SentenceUnit> {
        let mut seg = segmenter();
        let mut units: Vec<SentenceUnit> = fragments.iter().flat_map(|f| seg.feed(f)).collect();
        units.extend(seg.flush());
        units
    }

    fn texts(units: &[SentenceUnit]) -> Vec<&str> {
        units.iter().map(|u| u.text.as_str()).collect()
    }

    fn squash(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    #[test]
    fn decimal_does_not_split() {
        let units = run(&["Paris is", " the capital.", " It has 2.1M people."]);
        assert_eq!(texts(&units), ["Paris is the capital.", "It has 2.1M people."]);
        assert_eq!(units[0].seq, 0);
        assert_eq!(units[1].seq, 1);
    }

    #[test]
    fn emits_as_soon_as_boundary_is_certain() {
        let mut seg = segmenter();
        assert!(seg.feed("Hello there.").is_empty());
        let units = seg.feed(" How are");
        assert_eq!(texts(&units), ["Hello there."]);
        assert!(seg.feed(" you").is_empty());
        assert_eq!(seg.flush().unwrap().text, "How are you");
    }

    #[test]
    fn decimal_split_across_fragments() {
        let units = run(&["It costs 2.", "5 dollars. Ok"]);
        assert_eq!(texts(&units), ["It costs 2.5 dollars.", "Ok"]);
    }

    #[test]
    fn abbreviations_and_initials_do_not_split() {
        let units = run(&["Dr. Smith met J. Doe, e.g. at noon. Then Mr. Jones left."]);
        assert_eq!(
            texts(&units),
            ["Dr. Smith met J. Doe, e.g. at noon.", "Then Mr. Jones left."]
        );
    }

    #[test]
    fn lowercase_no_ends_a_sentence() {
        let units = run(&[
            "The answer is no. I refuse. See No. 5 on the list. ",
            "Ask the co. Main St. is shut.",
        ]);
        assert_eq!(
            texts(&units),
            [
                "The answer is no.",
                "I refuse.",
                "See No. 5 on the list.",
                "Ask the co.",
                "Main St. is shut."
            ]
        );
    }

    #[test]
    fn configured_abbreviations_are_honoured() {
        let config = SegmenterConfig {
            abbreviations: vec!["Approx.".into(), "Dept".into()],
            ..SegmenterConfig::default()
        };
        let mut seg = SentenceSegmenter::new(&config);
        let units = seg.feed("Ask the Dept. of Sound. Bye ");
        assert_eq!(texts(&units), ["Ask the Dept. of Sound."]);
    }

    #[test]
    fn terminator_runs_and_closing_quotes() {
        let units = run(&["Really?! Yes... She said \"hi.\" Then left."]);
        assert_eq!(
            texts(&units),
            ["Really?!", "Yes...", "She said \"hi.\"", "Then left."]
        );
    }

    #[test]
    fn pronoun_i_still_ends_sentence() {
        let units = run(&["So do I. Next one."]);
        assert_eq!(texts(&units), ["So do I.", "Next one."]);
    }

    #[test]
    fn code_block_becomes_placeholder() {
        let units = run(&["Try this:\n```py", "thon\nprint(1)\n``", "`\nDone."]);
        assert_eq!(texts(&units), ["Try this:", CODE_PLACEHOLDER, "Done."]);
        assert_eq!(units[1].kind, UnitKind::CodePlaceholder);
        assert!(units.iter().all(|u| !u.text.contains("print")));
    }

    #[test]
    fn fence_split_across_fragments() {
        let units = run(&["Here. ``", "`rust\nfn main() {}\n```"]);
        assert_eq!(texts(&units), ["Here.", CODE_PLACEHOLDER]);
    }

    #[test]
    fn sentence_ending_right_before_fence() {
        let units = run(&["Look.```\nls -la\n``` Nice."]);
        assert_eq!(texts(&units), ["Look.", CODE_PLACEHOLDER, "Nice."]);
    }

    #[test]
    fn unterminated_fence_is_dropped_on_flush() {
        let mut seg = segmenter();
        let units = seg.feed("Look: ```\nlet x");
        assert_eq!(texts(&units), ["Look:", CODE_PLACEHOLDER]);
        assert!(seg.feed(" = 1;").is_empty());
        assert!(seg.flush().is_none());
    }

    #[test]
    fn flush_emits_unpunctuated_remainder() {
        let mut seg = segmenter();
        assert!(seg.feed("no punctuation at all").is_empty());
        let unit = seg.flush().unwrap();
        assert_eq!(unit.text, "no punctuation at all");
        assert!(seg.flush().is_none());
    }

    #[test]
    fn run_on_text_is_split_at_whitespace() {
        let config = SegmenterConfig {
            max_unit_chars: 20,
            ..SegmenterConfig::default()
        };
        let mut seg = SentenceSegmenter::new(&config);
        let units = seg.feed("one two three four five six seven");
        assert!(!units.is_empty());
        assert!(units.iter().all(|u| u.text.len() <= 20));
        let mut all: Vec<String> = units.into_iter().map(|u| u.text).collect();
        all.extend(seg.flush().map(|u| u.text));
        assert_eq!(all.join(" "), "one two three four five six seven");
    }

    #[test]
    fn reset_discards_partial_text() {
        let mut seg = segmenter();
        seg.feed("half a sent");
        seg.feed("ence ```\ncode");
        seg.reset();
        assert!(seg.flush().is_none());
        let units = seg.feed("Fresh start. ");
        assert_eq!(texts(&units), ["Fresh start."]);
    }

    #[test]
    fn concatenation_matches_input_for_any_chunking() {
        let text = "Dr. Who said hi. The price is 3.50 today! Is it? Yes... \"Quoted.\" Trailing words";
        for size in 1..=9 {
            let chars: Vec<char> = text.chars().collect();
            let fragments: Vec<String> = chars.chunks(size).map(|c| c.iter().collect()).collect();
            let refs: Vec<&str> = fragments.iter().map(String::as_str).collect();
            let units = run(&refs);
            let joined: String = units.iter().map(|u| u.text.as_str()).collect();
            assert_eq!(squash(&joined), squash(text), "chunk size {size}");
            let seqs: Vec<u64> = units.iter().map(|u| u.seq).collect();
            assert_eq!(seqs, (0..units.len() as u64).collect::<Vec<_>>());
        }
    }

    #[test]
    fn segmentation_is_deterministic() {
        let fragments = ["First one. Sec", "ond one! ```x\ny``", "` Third 1.5 units. Tail"];
        let a = run(&fragments);
        let b = run(&fragments);
        assert_eq!(a, b);
        assert_eq!(
            texts(&a),
            ["First one.", "Second one!", CODE_PLACEHOLDER, "Third 1.5 units.", "Tail"]
        );
    }
}

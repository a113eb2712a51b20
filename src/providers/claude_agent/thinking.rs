//! Streaming `<thinking>` tag extraction.
//!
//! The agent is prompted to put its reasoning inside `<thinking>…</thinking>`
//! tags. The scanner splits text deltas into content and reasoning as they
//! stream, holding back just enough tail to detect a tag split across chunk
//! boundaries.

const OPEN_TAG: &str = "<thinking>";
const CLOSE_TAG: &str = "</thinking>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Scanning,
    InThinking,
}

#[derive(Debug, Default, PartialEq)]
pub struct ScanOutput {
    pub content: String,
    pub reasoning: String,
}

impl ScanOutput {
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.reasoning.is_empty()
    }
}

pub struct ThinkingScanner {
    state: ScanState,
    tail: String,
}

impl Default for ThinkingScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Longest k < pat.len() such that `s` ends with `pat[..k]`. The pattern is
/// ASCII, so byte slicing the suffix off `s` stays on a char boundary.
fn partial_tag_suffix(s: &str, pat: &str) -> usize {
    for k in (1..pat.len()).rev() {
        if s.ends_with(&pat[..k]) {
            return k;
        }
    }
    0
}

impl ThinkingScanner {
    pub fn new() -> Self {
        Self {
            state: ScanState::Scanning,
            tail: String::new(),
        }
    }

    /// Feed a text delta, splitting it into content and reasoning.
    pub fn push(&mut self, text: &str) -> ScanOutput {
        let mut buf = std::mem::take(&mut self.tail);
        buf.push_str(text);
        let mut out = ScanOutput::default();

        loop {
            match self.state {
                ScanState::Scanning => {
                    if let Some(pos) = buf.find(OPEN_TAG) {
                        out.content.push_str(&buf[..pos]);
                        buf.drain(..pos + OPEN_TAG.len());
                        self.state = ScanState::InThinking;
                    } else {
                        let keep = partial_tag_suffix(&buf, OPEN_TAG);
                        out.content.push_str(&buf[..buf.len() - keep]);
                        self.tail = buf.split_off(buf.len() - keep);
                        break;
                    }
                }
                ScanState::InThinking => {
                    if let Some(pos) = buf.find(CLOSE_TAG) {
                        out.reasoning.push_str(&buf[..pos]);
                        buf.drain(..pos + CLOSE_TAG.len());
                        self.state = ScanState::Scanning;
                    } else {
                        let keep = partial_tag_suffix(&buf, CLOSE_TAG);
                        out.reasoning.push_str(&buf[..buf.len() - keep]);
                        self.tail = buf.split_off(buf.len() - keep);
                        break;
                    }
                }
            }
        }

        out
    }

    /// Flush the held-back tail in whatever state the scanner ended in.
    pub fn finish(&mut self) -> ScanOutput {
        let tail = std::mem::take(&mut self.tail);
        match self.state {
            ScanState::Scanning => ScanOutput {
                content: tail,
                reasoning: String::new(),
            },
            ScanState::InThinking => ScanOutput {
                content: String::new(),
                reasoning: tail,
            },
        }
    }
}

/// Non-streaming variant: strip one `<thinking>` block anchored at the very
/// start of the text. Blocks appearing later are deliberately left in place.
pub fn extract_leading_thinking(text: &str) -> Option<(String, String)> {
    let rest = text.strip_prefix(OPEN_TAG)?;
    let close = rest.find(CLOSE_TAG)?;
    let reasoning = rest[..close].to_string();
    let remainder = rest[close + CLOSE_TAG.len()..].trim_start().to_string();
    Some((reasoning, remainder))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_partition(chunks: &[&str]) -> ScanOutput {
        let mut scanner = ThinkingScanner::new();
        let mut total = ScanOutput::default();
        for chunk in chunks {
            let out = scanner.push(chunk);
            total.content.push_str(&out.content);
            total.reasoning.push_str(&out.reasoning);
        }
        let out = scanner.finish();
        total.content.push_str(&out.content);
        total.reasoning.push_str(&out.reasoning);
        total
    }

    #[test]
    fn test_every_two_chunk_partition() {
        let input = "A<thinking>B</thinking>C";
        for split in 0..=input.len() {
            let out = run_partition(&[&input[..split], &input[split..]]);
            assert_eq!(out.content, "AC", "split at {split}");
            assert_eq!(out.reasoning, "B", "split at {split}");
        }
    }

    #[test]
    fn test_every_char_is_its_own_chunk() {
        let input = "A<thinking>B</thinking>C";
        let chunks: Vec<String> = input.chars().map(|c| c.to_string()).collect();
        let refs: Vec<&str> = chunks.iter().map(|s| s.as_str()).collect();
        let out = run_partition(&refs);
        assert_eq!(out.content, "AC");
        assert_eq!(out.reasoning, "B");
    }

    #[test]
    fn test_no_tags_passes_through() {
        let out = run_partition(&["plain ", "text with < angle"]);
        assert_eq!(out.content, "plain text with < angle");
        assert!(out.reasoning.is_empty());
    }

    #[test]
    fn test_unclosed_thinking_flushes_as_reasoning() {
        let out = run_partition(&["<thinking>never ", "closed"]);
        assert!(out.content.is_empty());
        assert_eq!(out.reasoning, "never closed");
    }

    #[test]
    fn test_false_opener_is_content() {
        let out = run_partition(&["a <think", "ering> b"]);
        assert_eq!(out.content, "a <thinkering> b");
        assert!(out.reasoning.is_empty());
    }

    #[test]
    fn test_multiple_blocks() {
        let out = run_partition(&["<thinking>one</thinking>mid<thinking>two</thinking>end"]);
        assert_eq!(out.content, "midend");
        assert_eq!(out.reasoning, "onetwo");
    }

    #[test]
    fn test_extract_leading_thinking() {
        let (reasoning, rest) =
            extract_leading_thinking("<thinking>I consider…</thinking>Because.").unwrap();
        assert_eq!(reasoning, "I consider…");
        assert_eq!(rest, "Because.");

        // Not anchored at the start: left alone
        assert!(extract_leading_thinking("Because. <thinking>late</thinking>").is_none());
        assert!(extract_leading_thinking("<thinking>unclosed").is_none());
    }
}

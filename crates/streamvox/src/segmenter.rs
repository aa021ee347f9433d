//! Sentence segmentation and primer extraction
//!
//! Input text is split into sentence-sized segments bounded by a character
//! limit. The first segment can additionally be cut into a short primer and
//! a remainder, so the primer is synthesized first and reaches the client
//! quickly.

use crate::config::SegmenterConfig;
use crate::types::Segment;

const SENTENCE_TERMINATORS: [char; 5] = ['.', '!', '?', ';', ':'];

/// Split text into ordered segments of at most `max_segment_chars` characters
pub fn segment(text: &str, max_segment_chars: usize) -> Vec<Segment> {
    let max_segment_chars = max_segment_chars.max(1);
    let mut pieces = Vec::new();

    for sentence in split_sentences(text) {
        split_long(sentence, max_segment_chars, &mut pieces);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, text)| Segment::new(index, text))
        .collect()
}

/// Split a segment into `(primer, remainder)` using default settings
pub fn split_primer(segment_text: &str) -> (String, String) {
    split_primer_with(segment_text, &SegmenterConfig::default())
}

/// Split a segment into `(primer, remainder)`
///
/// Returns `(full_text, "")` when the segment is short enough that a primer
/// would not help, or when no word boundary gives a usable cut.
pub fn split_primer_with(segment_text: &str, config: &SegmenterConfig) -> (String, String) {
    let text = segment_text.trim();
    let whole = || (text.to_string(), String::new());

    let len = text.chars().count();
    if len <= config.primer_min_chars {
        return whole();
    }

    let target = (len as f32 * config.primer_target_ratio).round() as usize;
    let cut = text
        .char_indices()
        .enumerate()
        .filter(|(_, (_, c))| c.is_whitespace())
        .min_by_key(|(char_pos, _)| char_pos.abs_diff(target))
        .map(|(char_pos, (byte_pos, _))| (char_pos, byte_pos));

    let Some((char_pos, byte_pos)) = cut else {
        return whole();
    };
    // A boundary past the midpoint would make the primer slower than the remainder
    if char_pos * 2 > len {
        return whole();
    }

    let primer = text[..byte_pos].trim_end();
    let remainder = text[byte_pos..].trim_start();
    if primer.is_empty() || remainder.is_empty() {
        return whole();
    }

    (primer.to_string(), remainder.to_string())
}

/// Segment text and carve a primer out of the first segment
pub fn plan_segments(text: &str, config: &SegmenterConfig) -> Vec<Segment> {
    let mut planned = Vec::new();

    for (position, seg) in segment(text, config.max_segment_chars)
        .into_iter()
        .enumerate()
    {
        if position == 0 && config.enable_primer {
            let (primer, remainder) = split_primer_with(&seg.text, config);
            if !remainder.is_empty() {
                planned.push(Segment::primer(0, primer));
                planned.push(Segment::new(0, remainder));
                continue;
            }
        }
        planned.push(seg);
    }

    for (index, seg) in planned.iter_mut().enumerate() {
        seg.index = index;
    }
    planned
}

/// Whether the segments reconstruct `original` modulo whitespace
///
/// Up to `tolerance` characters of drift are accepted to absorb
/// normalization differences.
pub fn is_valid_utf8_preserving(original: &str, segments: &[Segment], tolerance: usize) -> bool {
    let expected: Vec<char> = original.chars().filter(|c| !c.is_whitespace()).collect();
    let actual: Vec<char> = segments
        .iter()
        .flat_map(|s| s.text.chars())
        .filter(|c| !c.is_whitespace())
        .collect();

    expected == actual || within_edit_distance(&expected, &actual, tolerance)
}

/// Banded Levenshtein check: true when `a` and `b` differ by at most `k` edits
fn within_edit_distance(a: &[char], b: &[char], k: usize) -> bool {
    let (n, m) = (a.len(), b.len());
    if n.abs_diff(m) > k {
        return false;
    }

    let cap = k + 1;
    let mut prev = vec![cap; m + 1];
    let mut cur = vec![cap; m + 1];
    for (j, cell) in prev.iter_mut().enumerate().take(k.min(m) + 1) {
        *cell = j;
    }

    for i in 1..=n {
        let lo = i.saturating_sub(k);
        let hi = (i + k).min(m);
        if lo == 0 {
            cur[0] = i.min(cap);
        } else {
            cur[lo - 1] = cap;
        }
        for j in lo.max(1)..=hi {
            let substitution = prev[j - 1] + usize::from(a[i - 1] != b[j - 1]);
            cur[j] = substitution.min(prev[j] + 1).min(cur[j - 1] + 1).min(cap);
        }
        if hi < m {
            cur[hi + 1] = cap;
        }
        std::mem::swap(&mut prev, &mut cur);
    }

    prev[m] <= k
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        let end = pos + c.len_utf8();
        let boundary = if c == '\n' {
            true
        } else if SENTENCE_TERMINATORS.contains(&c) {
            chars.peek().is_none_or(|(_, next)| next.is_whitespace())
        } else {
            false
        };

        if boundary {
            push_trimmed(&text[start..end], &mut sentences);
            start = end;
        }
    }
    push_trimmed(&text[start..], &mut sentences);

    sentences
}

fn push_trimmed<'a>(piece: &'a str, out: &mut Vec<&'a str>) {
    let piece = piece.trim();
    if !piece.is_empty() {
        out.push(piece);
    }
}

fn split_long(sentence: &str, max_chars: usize, out: &mut Vec<String>) {
    let mut rest = sentence.trim();

    while !rest.is_empty() {
        let Some((limit, _)) = rest.char_indices().nth(max_chars) else {
            out.push(rest.to_string());
            return;
        };

        let window = &rest[..limit];
        let cut = if rest[limit..].starts_with(char::is_whitespace) {
            limit
        } else {
            match window.rfind(char::is_whitespace) {
                Some(pos) if pos > 0 => pos,
                _ => limit,
            }
        };

        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        rest = rest[cut..].trim_start();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(segments: &[Segment]) -> Vec<&str> {
        segments.iter().map(|s| s.text.as_str()).collect()
    }

    fn two_hundred_chars() -> String {
        let words = [
            "the", "quick", "brown", "fox", "jumps", "over", "a", "lazy", "dog", "while",
        ];
        let mut text = String::new();
        let mut i = 0;
        while text.len() < 200 {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(words[i % words.len()]);
            i += 1;
        }
        text.truncate(200);
        text.trim_end().to_string()
    }

    #[test]
    fn test_splits_on_sentence_boundaries() {
        let segments = segment("Hello world. This is a test.", 400);
        assert_eq!(texts(&segments), vec!["Hello world.", "This is a test."]);
        assert_eq!(segments[0].index, 0);
        assert_eq!(segments[1].index, 1);
        assert!(segments.iter().all(|s| !s.is_primer));
    }

    #[test]
    fn test_keeps_decimal_numbers_together() {
        let segments = segment("Pi is 3.14 roughly! Yes?", 400);
        assert_eq!(texts(&segments), vec!["Pi is 3.14 roughly!", "Yes?"]);
    }

    #[test]
    fn test_splits_on_newlines_and_drops_blank_lines() {
        let segments = segment("First line\n\n  Second line  \n", 400);
        assert_eq!(texts(&segments), vec!["First line", "Second line"]);
    }

    #[test]
    fn test_bounds_long_sentences_at_word_boundaries() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa";
        let segments = segment(text, 16);
        assert!(segments.iter().all(|s| s.text.chars().count() <= 16));
        assert!(is_valid_utf8_preserving(text, &segments, 0));
        assert!(segments.iter().all(|s| !s.text.starts_with(' ')));
    }

    #[test]
    fn test_hard_cuts_unbroken_text() {
        let text = "x".repeat(40);
        let segments = segment(&text, 16);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].text.len(), 16);
        assert!(is_valid_utf8_preserving(&text, &segments, 0));
    }

    #[test]
    fn test_handles_multibyte_text() {
        let text = "Grüße aus Köln. Ça va très bien, merci beaucoup à vous.";
        let segments = segment(text, 20);
        assert!(segments.iter().all(|s| s.text.chars().count() <= 20));
        assert!(is_valid_utf8_preserving(text, &segments, 0));
    }

    #[test]
    fn test_short_segment_is_not_split() {
        let (primer, remainder) = split_primer("Hello world. This is a test.");
        assert_eq!(primer, "Hello world. This is a test.");
        assert!(remainder.is_empty());
    }

    #[test]
    fn test_unsplittable_segment_falls_back_to_whole() {
        let text = "x".repeat(120);
        let (primer, remainder) = split_primer(&text);
        assert_eq!(primer, text);
        assert!(remainder.is_empty());
    }

    #[test]
    fn test_primer_on_two_hundred_chars() {
        let text = two_hundred_chars();
        let len = text.chars().count();
        assert!(len >= 195);

        let (primer, remainder) = split_primer(&text);
        assert!(!primer.is_empty());
        assert!(!remainder.is_empty());

        let ratio = primer.chars().count() as f32 / len as f32;
        assert!((0.08..=0.17).contains(&ratio), "primer ratio {ratio}");

        let rebuilt = vec![Segment::primer(0, primer), Segment::new(1, remainder)];
        assert!(is_valid_utf8_preserving(&text, &rebuilt, 0));
    }

    #[test]
    fn test_plan_inserts_primer_and_reindexes() {
        let first = two_hundred_chars();
        let text = format!("{first}. And a second sentence.");
        let planned = plan_segments(&text, &SegmenterConfig::default());

        assert_eq!(planned.len(), 3);
        assert!(planned[0].is_primer);
        assert!(!planned[1].is_primer);
        assert_eq!(planned[2].text, "And a second sentence.");
        for (i, seg) in planned.iter().enumerate() {
            assert_eq!(seg.index, i);
        }
        assert!(is_valid_utf8_preserving(&text, &planned, 3));
    }

    #[test]
    fn test_plan_without_primer() {
        let config = SegmenterConfig::default().with_primer(false);
        let planned = plan_segments(&two_hundred_chars(), &config);
        assert_eq!(planned.len(), 1);
        assert!(!planned[0].is_primer);
    }

    #[test]
    fn test_plan_of_blank_text_is_empty() {
        assert!(plan_segments("   \n  ", &SegmenterConfig::default()).is_empty());
    }

    #[test]
    fn test_reconstruction_tolerates_small_drift() {
        let original = "Hello world, this is fine.";
        let drifted = vec![Segment::new(0, "Hello world this is fine")];
        assert!(is_valid_utf8_preserving(original, &drifted, 3));
        assert!(!is_valid_utf8_preserving(original, &drifted, 0));

        let lost = vec![Segment::new(0, "Hello")];
        assert!(!is_valid_utf8_preserving(original, &lost, 3));
    }
}

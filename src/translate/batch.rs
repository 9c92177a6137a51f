//! Page-wide batching: greedy splitting by item count and character limit,
//! plus the `[k] text` numbering used to send one combined provider call per
//! batch and to demultiplex the reply.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

/// One text node queued for translation; `id` is its position in the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub id: usize,
    pub text: String,
}

impl BatchItem {
    pub fn new(id: usize, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
        }
    }

    fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Greedy bin-packing in input order. A batch closes when adding the next
/// item would exceed `max_items` or `max_chars`. Items are never split; an
/// item longer than `max_chars` gets a batch of its own.
pub fn split(items: Vec<BatchItem>, max_items: usize, max_chars: usize) -> Vec<Vec<BatchItem>> {
    let max_items = max_items.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<BatchItem> = Vec::new();
    let mut current_chars = 0usize;

    for item in items {
        let len = item.char_len();
        let over_count = current.len() + 1 > max_items;
        let over_chars = current_chars + len > max_chars;
        if !current.is_empty() && (over_count || over_chars) {
            batches.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        current_chars += len;
        current.push(item);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Join texts as `[1] first\n\n[2] second ...`.
pub fn number_segments<S: AsRef<str>>(texts: &[S]) -> String {
    texts
        .iter()
        .enumerate()
        .map(|(i, text)| format!("[{}] {}", i + 1, text.as_ref().trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn line_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*\[(\d+)\][ \t]*").expect("valid marker regex"))
}

fn inline_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(\d+)\][ \t]*").expect("valid marker regex"))
}

fn segments_by(re: &Regex, response: &str, count: usize) -> HashMap<usize, String> {
    let markers: Vec<(usize, usize, usize)> = re
        .captures_iter(response)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let n = caps.get(1)?.as_str().parse::<usize>().ok()?;
            Some((n, whole.start(), whole.end()))
        })
        .collect();

    let mut found = HashMap::new();
    for (i, &(n, _, body_start)) in markers.iter().enumerate() {
        if n == 0 || n > count || found.contains_key(&n) {
            continue;
        }
        let body_end = markers
            .get(i + 1)
            .map(|&(_, next_start, _)| next_start)
            .unwrap_or(response.len());
        let body = response[body_start..body_end].trim();
        if !body.is_empty() {
            found.insert(n, body.to_string());
        }
    }
    found
}

/// Parse a numbered reply into `count` slots. A slot is `None` when its
/// marker is missing or empty.
///
/// Markers count only at the start of a line. The one exception is a reply
/// with no line-start marker at all, where inline markers are accepted if
/// they read exactly `[1]..[count]` in order; a bracketed number inside a
/// translated segment must never split it.
pub fn parse_numbered(response: &str, count: usize) -> Vec<Option<String>> {
    let mut found = segments_by(line_marker(), response, count);
    if found.is_empty() && inline_sequence_is_exact(response, count) {
        found = segments_by(inline_marker(), response, count);
    }
    (1..=count).map(|n| found.remove(&n)).collect()
}

fn inline_sequence_is_exact(response: &str, count: usize) -> bool {
    let numbers: Vec<usize> = inline_marker()
        .captures_iter(response)
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .collect();
    count > 0 && numbers.len() == count && numbers.iter().copied().eq(1..=count)
}

/// Demultiplex a numbered reply back onto `originals`, in order. Any segment
/// whose marker is missing degrades to its own source text.
pub fn demux<S: AsRef<str>>(response: &str, originals: &[S]) -> Vec<String> {
    parse_numbered(response, originals.len())
        .into_iter()
        .zip(originals)
        .map(|(parsed, original)| parsed.unwrap_or_else(|| original.as_ref().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(texts: &[&str]) -> Vec<BatchItem> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| BatchItem::new(i, *t))
            .collect()
    }

    #[test]
    fn demux_two_markers() {
        let out = demux("[1] Bonjour\n\n[2] Monde", &["Hello", "World"]);
        assert_eq!(out, vec!["Bonjour", "Monde"]);
    }

    #[test]
    fn missing_marker_falls_back_to_source() {
        let out = demux("[1] Bonjour\n\n[3] Chat", &["Hello", "World", "Cat"]);
        assert_eq!(out, vec!["Bonjour", "World", "Chat"]);
    }

    #[test]
    fn reordered_markers_land_in_original_slots() {
        let out = demux("[2] Monde\n\n[1] Bonjour", &["Hello", "World"]);
        assert_eq!(out, vec!["Bonjour", "Monde"]);
    }

    #[test]
    fn inline_markers_are_recovered() {
        let out = demux("Voici : [1] Bonjour [2] Monde", &["Hello", "World"]);
        assert_eq!(out, vec!["Bonjour", "Monde"]);
    }

    #[test]
    fn bracketed_number_inside_kept_segment_is_not_a_marker() {
        let out = demux("[1] See note [2] below", &["See note [2] below", "World"]);
        assert_eq!(out, vec!["See note [2] below", "World"]);
    }

    #[test]
    fn inline_markers_out_of_order_are_ignored() {
        let out = demux("Voici : [2] Monde [1] Bonjour", &["Hello", "World"]);
        assert_eq!(out, vec!["Hello", "World"]);
        let out = demux("Voici : [1] Bonjour [2] voir [1]", &["Hello", "World"]);
        assert_eq!(out, vec!["Hello", "World"]);
    }

    #[test]
    fn multiline_segments_and_bracketed_text() {
        let reply = "[1] Première ligne\nseconde ligne\n\n[2] Voir la note [7] ci-dessous";
        let out = demux(reply, &["a", "b"]);
        assert_eq!(out[0], "Première ligne\nseconde ligne");
        assert_eq!(out[1], "Voir la note [7] ci-dessous");
    }

    #[test]
    fn unnumbered_reply_returns_sources() {
        let out = demux("Bonjour le monde", &["Hello", "World"]);
        assert_eq!(out, vec!["Hello", "World"]);
    }

    #[test]
    fn numbering_format() {
        assert_eq!(number_segments(&["Hello ", "World"]), "[1] Hello\n\n[2] World");
    }

    #[test]
    fn oversized_item_gets_its_own_batch() {
        let big = "x".repeat(50);
        let batches = split(items(&["ab", &big, "cd"]), 10, 10);
        let shapes: Vec<Vec<usize>> = batches
            .iter()
            .map(|b| b.iter().map(|i| i.id).collect())
            .collect();
        assert_eq!(shapes, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn count_bound_closes_batches() {
        let batches = split(items(&["a", "b", "c", "d", "e"]), 2, 1000);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2], vec![BatchItem::new(4, "e")]);
    }

    #[test]
    fn split_preserves_order_and_respects_bounds() {
        // deterministic pseudo-random lengths
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        for round in 0..200 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let n = (seed >> 59) as usize;
            let max_items = 1 + (round % 7);
            let max_chars = 5 + (round % 40);
            let input: Vec<BatchItem> = (0..n)
                .map(|i| {
                    seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                    BatchItem::new(i, "y".repeat((seed >> 58) as usize))
                })
                .collect();

            let batches = split(input.clone(), max_items, max_chars);
            let flattened: Vec<BatchItem> = batches.iter().flatten().cloned().collect();
            assert_eq!(flattened, input);
            for batch in &batches {
                assert!(!batch.is_empty());
                assert!(batch.len() <= max_items);
                let chars: usize = batch.iter().map(|i| i.text.chars().count()).sum();
                if batch.len() > 1 {
                    assert!(chars <= max_chars);
                }
            }
        }
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(split(Vec::new(), 5, 100).is_empty());
    }
}

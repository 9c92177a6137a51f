//! Terminology hints. Term pairs come from a JSON file and are compiled into
//! one case-insensitive matcher; a fragment picks up the pairs whose source
//! term occurs in it as a whole word.

use std::collections::HashMap;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use super::GlossaryEntry;

#[derive(Debug, thiserror::Error)]
pub enum GlossaryError {
    #[error("glossary IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("glossary parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("glossary matcher: {0}")]
    Matcher(#[from] regex::Error),
}

/// Either `{"version": n, "entries": [...]}` or a bare entry list.
#[derive(Deserialize)]
#[serde(untagged)]
enum Document {
    Versioned { version: u32, entries: Vec<GlossaryEntry> },
    Bare(Vec<GlossaryEntry>),
}

pub struct Glossary {
    version: u32,
    terms: Vec<GlossaryEntry>,
    by_folded: HashMap<String, usize>,
    matcher: Option<Regex>,
}

impl Glossary {
    pub fn load_from_file(path: &Path) -> Result<Self, GlossaryError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Blank source terms are dropped; a repeated term keeps its last target.
    pub fn from_json(content: &str) -> Result<Self, GlossaryError> {
        let (version, raw) = match serde_json::from_str(content)? {
            Document::Versioned { version, entries } => (version, entries),
            Document::Bare(entries) => (0, entries),
        };

        let mut terms: Vec<GlossaryEntry> = Vec::with_capacity(raw.len());
        let mut by_folded = HashMap::new();
        for entry in raw {
            let source = entry.source.trim();
            if source.is_empty() {
                continue;
            }
            let pair = GlossaryEntry {
                source: source.to_string(),
                target: entry.target,
            };
            match by_folded.get(&source.to_lowercase()) {
                Some(&slot) => terms[slot] = pair,
                None => {
                    by_folded.insert(source.to_lowercase(), terms.len());
                    terms.push(pair);
                }
            }
        }

        let matcher = compile(&terms)?;
        Ok(Self {
            version,
            terms,
            by_folded,
            matcher,
        })
    }

    pub fn empty() -> Self {
        Self {
            version: 0,
            terms: Vec::new(),
            by_folded: HashMap::new(),
            matcher: None,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Pairs whose source term occurs in `text`, in order of first
    /// occurrence. Where terms overlap the longest one wins.
    pub fn match_entries(&self, text: &str) -> Vec<GlossaryEntry> {
        let Some(matcher) = &self.matcher else {
            return Vec::new();
        };
        let mut seen = vec![false; self.terms.len()];
        let mut hits = Vec::new();
        for found in matcher.find_iter(text) {
            let Some(&slot) = self.by_folded.get(&found.as_str().to_lowercase()) else {
                continue;
            };
            if !std::mem::replace(&mut seen[slot], true) {
                hits.push(self.terms[slot].clone());
            }
        }
        hits
    }
}

fn compile(terms: &[GlossaryEntry]) -> Result<Option<Regex>, regex::Error> {
    if terms.is_empty() {
        return Ok(None);
    }
    let mut sources: Vec<&str> = terms.iter().map(|t| t.source.as_str()).collect();
    sources.sort_by_key(|s| std::cmp::Reverse(s.chars().count()));

    let alternation = sources
        .iter()
        .map(|source| {
            let mut pattern = regex::escape(source);
            if source.chars().next().is_some_and(spaced_word_char) {
                pattern.insert_str(0, r"\b");
            }
            if source.chars().last().is_some_and(spaced_word_char) {
                pattern.push_str(r"\b");
            }
            pattern
        })
        .collect::<Vec<_>>()
        .join("|");

    RegexBuilder::new(&alternation)
        .case_insensitive(true)
        .build()
        .map(Some)
}

// Scripts written without spaces (CJK, Thai) get no word boundary.
fn spaced_word_char(c: char) -> bool {
    c.is_alphanumeric() && (c as u32) < 0x0800
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources(hits: &[GlossaryEntry]) -> Vec<&str> {
        hits.iter().map(|e| e.source.as_str()).collect()
    }

    #[test]
    fn hits_follow_text_order_and_ignore_case() {
        let glossary = Glossary::from_json(
            r#"{"version": 3, "entries": [
                {"source": "Pull Request", "target": "合并请求"},
                {"source": "commit", "target": "提交"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(glossary.version(), 3);
        let hits = glossary.match_entries("Each COMMIT belongs to a pull request; amend the commit.");
        assert_eq!(sources(&hits), ["commit", "Pull Request"]);
    }

    #[test]
    fn terms_match_whole_words_only() {
        let glossary = Glossary::from_json(r#"[{"source": "art", "target": "arte"}]"#).unwrap();
        assert_eq!(glossary.version(), 0);
        assert!(glossary.match_entries("a smart start").is_empty());
        assert_eq!(glossary.match_entries("Modern art.").len(), 1);
    }

    #[test]
    fn cjk_terms_match_inside_running_text() {
        let glossary = Glossary::from_json(r#"[{"source": "合并请求", "target": "pull request"}]"#).unwrap();
        assert_eq!(glossary.match_entries("请先创建合并请求再提交").len(), 1);
    }

    #[test]
    fn longer_term_shadows_its_prefix() {
        let glossary = Glossary::from_json(
            r#"[{"source": "cache", "target": "caché"}, {"source": "cache key", "target": "clé de cache"}]"#,
        )
        .unwrap();
        assert_eq!(sources(&glossary.match_entries("the cache key")), ["cache key"]);
        assert_eq!(sources(&glossary.match_entries("a warm cache")), ["cache"]);
    }

    #[test]
    fn blank_and_repeated_terms_collapse() {
        let glossary = Glossary::from_json(
            r#"[{"source": " ", "target": "x"}, {"source": "Merge", "target": "a"}, {"source": "merge", "target": "b"}]"#,
        )
        .unwrap();
        assert_eq!(glossary.len(), 1);
        assert_eq!(glossary.match_entries("merge it")[0].target, "b");
        assert!(Glossary::empty().match_entries("merge").is_empty());
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let glossary = Glossary::from_json(r#"[{"source": "C++", "target": "C++"}]"#).unwrap();
        assert_eq!(glossary.match_entries("written in C++ mostly").len(), 1);
        assert!(glossary.match_entries("written in C mostly").is_empty());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        assert!(matches!(
            Glossary::from_json("{\"entries\": 5}"),
            Err(GlossaryError::Parse(_))
        ));
    }
}

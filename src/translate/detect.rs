//! Local language detection: Unicode script counting first, whatlang for
//! Latin-script text. Never touches the network; see `racer` for that path.

/// Outcome of the local heuristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptGuess {
    /// The script alone pins down the language.
    Confident(String),
    /// Several languages share the script; `best_guess` is the fallback.
    Ambiguous { best_guess: String },
}

impl ScriptGuess {
    pub fn language(&self) -> &str {
        match self {
            ScriptGuess::Confident(lang) => lang,
            ScriptGuess::Ambiguous { best_guess } => best_guess,
        }
    }

    pub fn is_confident(&self) -> bool {
        matches!(self, ScriptGuess::Confident(_))
    }
}

#[derive(Default)]
struct ScriptCounts {
    letters: usize,
    han: usize,
    kana: usize,
    hangul: usize,
    cyrillic: usize,
    arabic: usize,
    thai: usize,
    devanagari: usize,
    greek: usize,
    hebrew: usize,
}

impl ScriptCounts {
    fn tally(text: &str) -> Self {
        let mut counts = ScriptCounts::default();
        for c in text.chars().filter(|c| c.is_alphabetic()) {
            counts.letters += 1;
            match c as u32 {
                0x3040..=0x30FF | 0x31F0..=0x31FF | 0xFF66..=0xFF9F => counts.kana += 1,
                0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF | 0x20000..=0x2A6DF => {
                    counts.han += 1
                }
                0xAC00..=0xD7AF | 0x1100..=0x11FF | 0x3130..=0x318F => counts.hangul += 1,
                0x0400..=0x04FF | 0x0500..=0x052F => counts.cyrillic += 1,
                0x0600..=0x06FF | 0x0750..=0x077F => counts.arabic += 1,
                0x0E00..=0x0E7F => counts.thai += 1,
                0x0900..=0x097F => counts.devanagari += 1,
                0x0370..=0x03FF => counts.greek += 1,
                0x0590..=0x05FF => counts.hebrew += 1,
                _ => {}
            }
        }
        counts
    }

    fn ratio(&self, n: usize) -> f64 {
        if self.letters == 0 {
            0.0
        } else {
            n as f64 / self.letters as f64
        }
    }
}

/// Minimum share of letters a script needs before it decides the language.
const SCRIPT_THRESHOLD: f64 = 0.3;

/// Guess the language of `text` from script ranges, falling back to
/// whatlang for Latin-script text.
pub fn guess_language(text: &str) -> ScriptGuess {
    let counts = ScriptCounts::tally(text);
    if counts.letters == 0 {
        return ScriptGuess::Ambiguous {
            best_guess: "en".into(),
        };
    }

    // Any kana means Japanese even when kanji dominate.
    if counts.kana > 0 && counts.ratio(counts.kana + counts.han) >= SCRIPT_THRESHOLD {
        return ScriptGuess::Confident("ja".into());
    }
    let scripts = [
        (counts.hangul, "ko"),
        (counts.han, "zh"),
        (counts.thai, "th"),
        (counts.devanagari, "hi"),
        (counts.greek, "el"),
        (counts.hebrew, "he"),
    ];
    for (n, lang) in scripts {
        if counts.ratio(n) >= SCRIPT_THRESHOLD {
            return ScriptGuess::Confident(lang.into());
        }
    }
    // Cyrillic and Arabic scripts are shared by several languages; let
    // whatlang decide, defaulting to the most common one.
    if counts.ratio(counts.cyrillic) >= SCRIPT_THRESHOLD {
        return statistical_guess(text, "ru");
    }
    if counts.ratio(counts.arabic) >= SCRIPT_THRESHOLD {
        return statistical_guess(text, "ar");
    }
    statistical_guess(text, "en")
}

fn statistical_guess(text: &str, default: &str) -> ScriptGuess {
    match detect_reliable(text) {
        Some(lang) => ScriptGuess::Confident(lang),
        None => ScriptGuess::Ambiguous {
            best_guess: default.into(),
        },
    }
}

/// Detects the dominant language of `text` using whatlang.
/// Returns an ISO 639-1 code or None if detection is unreliable.
pub fn detect_reliable(text: &str) -> Option<String> {
    let info = whatlang::detect(text)?;
    if !info.is_reliable() {
        return None;
    }
    lang_to_code(info.lang()).map(str::to_string)
}

fn lang_to_code(lang: whatlang::Lang) -> Option<&'static str> {
    use whatlang::Lang::*;
    let code = match lang {
        Eng => "en",
        Cmn => "zh",
        Jpn => "ja",
        Kor => "ko",
        Fra => "fr",
        Deu => "de",
        Spa => "es",
        Rus => "ru",
        Por => "pt",
        Ita => "it",
        Ara => "ar",
        Hin => "hi",
        Tur => "tr",
        Vie => "vi",
        Tha => "th",
        Nld => "nl",
        Pol => "pl",
        Ukr => "uk",
        Swe => "sv",
        Ind => "id",
        Ces => "cs",
        Pes => "fa",
        _ => return None,
    };
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cjk_scripts_are_confident() {
        assert_eq!(guess_language("今天天气很好"), ScriptGuess::Confident("zh".into()));
        assert_eq!(
            guess_language("今日はいい天気ですね"),
            ScriptGuess::Confident("ja".into())
        );
        assert_eq!(
            guess_language("오늘 날씨가 좋네요"),
            ScriptGuess::Confident("ko".into())
        );
    }

    #[test]
    fn unique_scripts() {
        assert_eq!(guess_language("สวัสดีครับ").language(), "th");
        assert_eq!(guess_language("Καλημέρα σας").language(), "el");
    }

    #[test]
    fn long_english_is_detected_statistically() {
        let guess = guess_language(
            "The quick brown fox jumps over the lazy dog while the children watch from the window.",
        );
        assert_eq!(guess.language(), "en");
    }

    #[test]
    fn short_latin_text_is_ambiguous() {
        let guess = guess_language("ok");
        assert!(!guess.is_confident());
        assert_eq!(guess.language(), "en");
    }

    #[test]
    fn no_letters_falls_back() {
        assert_eq!(
            guess_language("12345 !!!"),
            ScriptGuess::Ambiguous {
                best_guess: "en".into()
            }
        );
    }
}

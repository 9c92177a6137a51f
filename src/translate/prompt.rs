//! System prompt construction. Pure: identical inputs give identical prompts.

use std::collections::BTreeMap;

use super::{ContextType, GlossaryEntry, PageContext, Tone};

/// Human-readable name for a language code; unknown codes pass through.
pub fn language_name(code: &str) -> &str {
    match code.to_ascii_lowercase().as_str() {
        "en" => "English",
        "zh" | "zh-cn" | "zh-hans" => "Simplified Chinese",
        "zh-tw" | "zh-hant" => "Traditional Chinese",
        "ja" => "Japanese",
        "ko" => "Korean",
        "fr" => "French",
        "de" => "German",
        "es" => "Spanish",
        "pt" => "Portuguese",
        "it" => "Italian",
        "ru" => "Russian",
        "ar" => "Arabic",
        "hi" => "Hindi",
        "th" => "Thai",
        "vi" => "Vietnamese",
        "nl" => "Dutch",
        "pl" => "Polish",
        "tr" => "Turkish",
        "uk" => "Ukrainian",
        "el" => "Greek",
        "he" => "Hebrew",
        "sv" => "Swedish",
        "id" => "Indonesian",
        _ => code,
    }
}

fn content_guidance(context_type: ContextType) -> Option<&'static str> {
    match context_type {
        ContextType::General => None,
        ContextType::Technical => Some(
            "The text is technical documentation. Keep code, identifiers, commands and units unchanged.",
        ),
        ContextType::Academic => {
            Some("The text is academic writing. Preserve precise terminology and citations.")
        }
        ContextType::Literary => {
            Some("The text is literary. Preserve voice, imagery and rhythm over literal wording.")
        }
        ContextType::Legal => {
            Some("The text is legal. Translate precisely; do not paraphrase obligations or terms.")
        }
        ContextType::Medical => {
            Some("The text is medical. Use standard clinical terminology.")
        }
        ContextType::Business => Some("The text is business communication. Keep it clear and professional."),
        ContextType::Casual => Some("The text is casual conversation. Keep it natural and idiomatic."),
        ContextType::News => Some("The text is news reporting. Keep a neutral, factual register."),
        ContextType::Subtitle => {
            Some("The text is a subtitle line. Keep it short enough to read on screen.")
        }
    }
}

fn tone_guidance(tone: Tone) -> &'static str {
    match tone {
        Tone::Formal => "Use a formal register.",
        Tone::Neutral => "Use a neutral register.",
        Tone::Casual => "Use a casual register.",
        Tone::Friendly => "Use a warm, friendly register.",
    }
}

/// Merge page terminology with glossary hints. Page terms win on conflict;
/// output is sorted by source term so prompts stay stable.
pub fn merge_terminology(page: &[GlossaryEntry], hints: &[GlossaryEntry]) -> Vec<GlossaryEntry> {
    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    for entry in hints.iter().chain(page.iter()) {
        if entry.source.trim().is_empty() {
            continue;
        }
        merged.insert(entry.source.trim().to_string(), entry.target.trim().to_string());
    }
    merged
        .into_iter()
        .map(|(source, target)| GlossaryEntry { source, target })
        .collect()
}

/// Build the translation system prompt.
pub fn build_system_prompt(
    context_type: ContextType,
    page: &PageContext,
    hints: &[GlossaryEntry],
    source_lang: &str,
    target_lang: &str,
) -> String {
    let mut prompt = format!(
        "You are a professional translator. Translate the user's text from {} into {}. \
         Output only the translation, nothing else.",
        language_name(source_lang),
        language_name(target_lang)
    );
    if let Some(guidance) = content_guidance(context_type) {
        prompt.push('\n');
        prompt.push_str(guidance);
    }
    if let Some(tone) = page.tone {
        prompt.push('\n');
        prompt.push_str(tone_guidance(tone));
    }
    if let Some(domain) = page.domain.as_deref().filter(|d| !d.trim().is_empty()) {
        prompt.push_str(&format!("\nSubject domain: {}.", domain.trim()));
    }
    if let Some(title) = page.page_title.as_deref().filter(|t| !t.trim().is_empty()) {
        prompt.push_str(&format!("\nThe text comes from a page titled \"{}\".", title.trim()));
    }
    let terms = merge_terminology(&page.terminology, hints);
    if !terms.is_empty() {
        prompt.push_str("\nUse these term translations consistently:");
        for term in &terms {
            prompt.push_str(&format!("\n- {} => {}", term.source, term.target));
        }
    }
    prompt
}

/// Extra instruction appended when the user message is a numbered batch.
pub const NUMBERED_BATCH_INSTRUCTION: &str = "The input is a numbered list of independent segments \
     in the form \"[n] text\", separated by blank lines. Translate each segment separately and \
     return the same \"[n]\" markers in the same order, one segment per marker. \
     Do not merge, split, drop or renumber segments.";

pub fn build_batch_system_prompt(
    context_type: ContextType,
    page: &PageContext,
    hints: &[GlossaryEntry],
    source_lang: &str,
    target_lang: &str,
) -> String {
    let mut prompt = build_system_prompt(context_type, page, hints, source_lang, target_lang);
    prompt.push('\n');
    prompt.push_str(NUMBERED_BATCH_INSTRUCTION);
    prompt
}

/// System prompt for the refinement conversation.
pub fn build_refine_system_prompt(source_lang: &str, target_lang: &str) -> String {
    format!(
        "You are a professional translator refining a {} translation of a {} text. \
         Apply the user's instructions to the current translation. \
         Reply with the full revised translation only, without commentary.",
        language_name(target_lang),
        language_name(source_lang)
    )
}

/// First user turn of a refinement: the text and its current translation.
pub fn build_refine_context(original: &str, current: &str) -> String {
    format!("Original text:\n{original}\n\nCurrent translation:\n{current}")
}

/// Estimate max_tokens for a translation: (input_tokens * 1.5 + 64), clamped.
pub fn estimate_max_tokens(text: &str) -> u32 {
    // Rough: ~4 chars/token for Latin, ~1.5 for CJK
    let estimated_input_tokens = text.len() as f64 / 3.0;
    let max = (estimated_input_tokens * 1.5 + 64.0) as u32;
    max.clamp(256, 8192)
}

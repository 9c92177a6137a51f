//! Fragment fingerprints: blake3 over (text | source | target | context type),
//! truncated to 128 bits and hex-encoded. Used as cache key and memory identity.

use super::ContextType;

/// Hex characters kept from the 256-bit digest.
pub const FINGERPRINT_LEN: usize = 32;

/// Compute the fingerprint of a fragment. A missing context type hashes
/// exactly like `ContextType::General`.
pub fn fingerprint(
    text: &str,
    source_lang: &str,
    target_lang: &str,
    context_type: Option<ContextType>,
) -> String {
    let context = context_type.unwrap_or_default();
    let mut hasher = blake3::Hasher::new();
    // Length prefixes keep field boundaries unambiguous.
    for field in [text, source_lang, target_lang, context.as_str()] {
        hasher.update(&(field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    let hex = hasher.finalize().to_hex();
    hex.as_str()[..FINGERPRINT_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_fragments_share_fingerprint() {
        let a = fingerprint("Hello", "en", "fr", Some(ContextType::Technical));
        let b = fingerprint("Hello", "en", "fr", Some(ContextType::Technical));
        assert_eq!(a, b);
        assert_eq!(a.len(), FINGERPRINT_LEN);
    }

    #[test]
    fn missing_context_equals_general() {
        assert_eq!(
            fingerprint("Hello", "en", "fr", None),
            fingerprint("Hello", "en", "fr", Some(ContextType::General))
        );
    }

    #[test]
    fn every_field_participates() {
        let base = fingerprint("Hello", "en", "fr", None);
        assert_ne!(base, fingerprint("Hello!", "en", "fr", None));
        assert_ne!(base, fingerprint("Hello", "de", "fr", None));
        assert_ne!(base, fingerprint("Hello", "en", "es", None));
        assert_ne!(base, fingerprint("Hello", "en", "fr", Some(ContextType::Legal)));
    }

    #[test]
    fn field_boundaries_do_not_collide() {
        assert_ne!(
            fingerprint("ab", "c", "fr", None),
            fingerprint("a", "bc", "fr", None)
        );
    }
}

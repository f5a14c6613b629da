//! # Translation Provider Seam
//!
//! Translates finalized (and throttled partial) transcript spans between
//! language codes. Translation is strictly best-effort in the session flow:
//! a failed or missing translation never blocks a transcript broadcast.
//!
//! ## Language Gating:
//! Whether a span is translated at all is decided here, by comparing the
//! base language subtags of the session's source and target codes. Region
//! differences alone (`ha-NG` vs `ha-GH`) do not trigger translation.

use async_trait::async_trait;
use std::fmt;

/// Errors surfaced by a translation provider.
#[derive(Debug)]
pub enum TranslationError {
    /// Vendor-side failure (network, quota, unsupported pair)
    Provider(String),
}

impl fmt::Display for TranslationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranslationError::Provider(msg) => write!(f, "translation provider error: {}", msg),
        }
    }
}

impl std::error::Error for TranslationError {}

/// Text translation between language codes. One implementation per vendor.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String, TranslationError>;
}

/// Passthrough translator used when no vendor adapter is configured.
pub struct NoopTranslator;

#[async_trait]
impl Translator for NoopTranslator {
    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String, TranslationError> {
        tracing::debug!(
            source = %source_language,
            target = %target_language,
            "noop translator passing text through"
        );
        Ok(text.to_string())
    }
}

/// Base language subtag of a BCP-47-ish code: `ha-NG` → `ha`, `en_US` → `en`.
pub fn base_subtag(code: &str) -> &str {
    code.split(['-', '_'])
        .next()
        .unwrap_or(code)
        .trim()
}

/// Whether a span should be sent to the translator at all.
///
/// Requires non-empty text and source/target codes that differ on the base
/// subtag. Region-only differences are treated as the same language.
pub fn needs_translation(source_language: &str, target_language: &str, text: &str) -> bool {
    if text.trim().is_empty() {
        return false;
    }
    let source = base_subtag(source_language);
    let target = base_subtag(target_language);
    !source.is_empty() && !target.is_empty() && !source.eq_ignore_ascii_case(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_subtag_strips_region() {
        assert_eq!(base_subtag("ha-NG"), "ha");
        assert_eq!(base_subtag("en_US"), "en");
        assert_eq!(base_subtag("fr"), "fr");
    }

    #[test]
    fn same_base_language_is_not_translated() {
        assert!(!needs_translation("ha-NG", "ha-NG", "sannu"));
        // Region-only difference: still the same language
        assert!(!needs_translation("ha-NG", "ha-GH", "sannu"));
        assert!(!needs_translation("EN", "en-GB", "hello"));
    }

    #[test]
    fn differing_base_languages_are_translated() {
        assert!(needs_translation("ha-NG", "en-US", "sannu"));
        assert!(needs_translation("en", "fr", "hello"));
    }

    #[test]
    fn empty_text_is_never_translated() {
        assert!(!needs_translation("en", "fr", ""));
        assert!(!needs_translation("en", "fr", "   "));
    }

    #[tokio::test]
    async fn noop_translator_passes_text_through() {
        let translated = NoopTranslator
            .translate("hello", "en", "fr")
            .await
            .unwrap();
        assert_eq!(translated, "hello");
    }
}

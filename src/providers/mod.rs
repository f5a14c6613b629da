//! # External Provider Adapters
//!
//! Trait seams for the external collaborators this backend depends on:
//! the speech-recognition provider, the translation provider, and the
//! identity/subscription lookup. The core never talks to a vendor SDK
//! directly; it goes through these traits, so vendor adapters can be
//! swapped without touching the session machinery.

pub mod identity;
pub mod recognizer;
pub mod translator;

pub use identity::{Identity, IdentityProvider, StaticIdentityProvider, ANONYMOUS_USER};
pub use recognizer::{
    RecognitionEvent, RecognizerError, RecognizerStream, SilentRecognizer, SpeechRecognizer,
};
pub use translator::{NoopTranslator, TranslationError, Translator};

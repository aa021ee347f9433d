//! Deterministic request fingerprints used as cache and history keys

use crate::types::StreamRequest;
use std::fmt;
use xxhash_rust::xxh3::xxh3_128;

/// Key namespace, so primer and full-segment entries never collide
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Namespace {
    Primer,
    Inference,
    Variation,
}

impl Namespace {
    fn tag(&self) -> &'static str {
        match self {
            Namespace::Primer => "primer",
            Namespace::Inference => "inference",
            Namespace::Variation => "variation",
        }
    }
}

/// 128-bit content hash of the normalized synthesis parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u128);

impl Fingerprint {
    pub fn compute(
        namespace: Namespace,
        text: &str,
        voice_id: &str,
        speed: f32,
        language: &str,
    ) -> Self {
        let key = format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{:.3}\u{1f}{}",
            namespace.tag(),
            normalize_text(text),
            voice_id.trim(),
            speed,
            language.trim().to_ascii_lowercase(),
        );
        Fingerprint(xxh3_128(key.as_bytes()))
    }

    /// Fingerprint for a piece of a request's text
    pub fn for_text(namespace: Namespace, request: &StreamRequest, text: &str) -> Self {
        Self::compute(
            namespace,
            text,
            &request.voice_id,
            request.speed,
            &request.language,
        )
    }

    /// Fingerprint of the whole request
    pub fn for_request(request: &StreamRequest) -> Self {
        Self::for_text(Namespace::Variation, request, &request.text)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Trim and collapse runs of whitespace to a single space
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_insensitive() {
        let a = Fingerprint::compute(Namespace::Inference, "Hello   world ", "a", 1.0, "en-us");
        let b = Fingerprint::compute(Namespace::Inference, " Hello world", "a", 1.0, "EN-US");
        assert_eq!(a, b);
    }

    #[test]
    fn test_parameters_change_fingerprint() {
        let base = Fingerprint::compute(Namespace::Inference, "Hello", "a", 1.0, "en-us");
        assert_ne!(
            base,
            Fingerprint::compute(Namespace::Inference, "Hello", "b", 1.0, "en-us")
        );
        assert_ne!(
            base,
            Fingerprint::compute(Namespace::Inference, "Hello", "a", 1.25, "en-us")
        );
        assert_ne!(
            base,
            Fingerprint::compute(Namespace::Inference, "Hello", "a", 1.0, "fr-fr")
        );
        assert_ne!(
            base,
            Fingerprint::compute(Namespace::Primer, "Hello", "a", 1.0, "en-us")
        );
    }

    #[test]
    fn test_display_is_fixed_width_hex() {
        let fp = Fingerprint::compute(Namespace::Primer, "x", "a", 1.0, "en");
        let rendered = fp.to_string();
        assert_eq!(rendered.len(), 32);
        assert!(rendered.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

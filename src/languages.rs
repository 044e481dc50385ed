// Curated language allowlist and its intersection with the model's language table

/// Major Asian languages plus English, in the order they are offered to clients.
pub const ASIAN_LANGUAGES: [&str; 21] = [
    "en", // English (as intermediary)
    "hi", // Hindi
    "ta", // Tamil
    "te", // Telugu
    "ml", // Malayalam
    "bn", // Bengali
    "ur", // Urdu
    "gu", // Gujarati
    "pa", // Punjabi
    "si", // Sinhala
    "ne", // Nepali
    "zh", // Chinese
    "ja", // Japanese
    "ko", // Korean
    "th", // Thai
    "id", // Indonesian
    "ms", // Malay
    "vi", // Vietnamese
    "ar", // Arabic
    "fa", // Persian
    "he", // Hebrew
];

/// Keeps the allowlisted codes the model knows, preserving allowlist order.
///
/// `resolves` is asked once per candidate; codes the model lists but cannot
/// map to a generation target id are dropped so every returned code is usable
/// as a forced first token.
pub fn supported_languages<F>(allowlist: &[&str], model_langs: &[String], resolves: F) -> Vec<String>
where
    F: Fn(&str) -> bool,
{
    allowlist
        .iter()
        .copied()
        .filter(|code| model_langs.iter().any(|lang| lang.as_str() == *code))
        .filter(|code| {
            let ok = resolves(*code);
            if !ok {
                log::warn!("language {code} is listed by the model but has no token id, skipping");
            }
            ok
        })
        .map(|code| code.to_string())
        .collect()
}

use crate::error::ResolveError;
use crate::models::{IntentCatalogEntry, Language, ServiceIntent};

pub const CONFIDENCE_THRESHOLD: f64 = 0.1;

pub fn normalize_text(input: &str) -> String {
    input.trim().to_lowercase()
}

pub fn detect_language(explicit: Option<Language>, text: &str) -> Language {
    if let Some(language) = explicit {
        return language;
    }

    if text.chars().any(is_arabic_script) {
        Language::Ar
    } else {
        Language::Fr
    }
}

fn is_arabic_script(ch: char) -> bool {
    let code = ch as u32;
    (0x0600..=0x06FF).contains(&code)
        || (0x0750..=0x077F).contains(&code)
        || (0xFB50..=0xFDFF).contains(&code)
        || (0xFE70..=0xFEFF).contains(&code)
}

pub fn classify(message: &str, catalog: &[IntentCatalogEntry]) -> ServiceIntent {
    let normalized = normalize_text(message);
    let mut best = ServiceIntent::unknown();
    if normalized.is_empty() {
        return best;
    }

    // Denominator is the raw message, whitespace and all.
    let message_len = message.chars().count() as f64;

    for entry in catalog.iter().filter(|entry| entry.active) {
        for keyword in &entry.keywords {
            let keyword = keyword.to_lowercase();
            if !normalized.contains(keyword.as_str()) {
                continue;
            }

            let confidence = (keyword.chars().count() as f64 / message_len).min(1.0);
            if confidence > best.confidence {
                best = ServiceIntent {
                    intent: entry.intent.clone(),
                    confidence,
                    category: entry.category,
                };
            }
        }
    }

    best
}

pub fn resolve_reply(
    intent: &ServiceIntent,
    language: Language,
    catalog: &[IntentCatalogEntry],
) -> Result<String, ResolveError> {
    if intent.confidence < CONFIDENCE_THRESHOLD {
        return Ok(unknown_reply(language).to_string());
    }

    let entry = catalog
        .iter()
        .find(|entry| entry.intent == intent.intent)
        .ok_or_else(|| ResolveError::NotFound {
            intent: intent.intent.clone(),
        })?;

    entry
        .reply_for(language)
        .map(ToString::to_string)
        .ok_or_else(|| ResolveError::MissingReply {
            intent: intent.intent.clone(),
            language,
        })
}

pub fn unknown_reply(language: Language) -> &'static str {
    match language {
        Language::Ar => "عذراً، لم أفهم طلبك. يرجى إعادة صياغة سؤالك أو التواصل مع خدمة العملاء.",
        Language::Fr => "Désolé, je n'ai pas compris votre demande. Merci de reformuler votre question ou de contacter notre service client.",
    }
}

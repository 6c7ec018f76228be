use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::error::CatalogError;
use crate::models::{Category, IntentCatalogEntry, Language};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogReport {
    pub entries: usize,
    pub active: usize,
    pub warnings: Vec<String>,
}

pub fn validate_catalog(entries: &[IntentCatalogEntry]) -> Result<CatalogReport, CatalogError> {
    let mut report = CatalogReport {
        entries: entries.len(),
        ..CatalogReport::default()
    };
    let mut seen = HashSet::new();

    for (position, entry) in entries.iter().enumerate() {
        validate_entry(position, entry, &mut report.warnings)?;

        if entry.active {
            report.active += 1;
            if !seen.insert(entry.intent.as_str()) {
                return Err(CatalogError::DuplicateIntent {
                    intent: entry.intent.clone(),
                });
            }
        }
    }

    Ok(report)
}

fn validate_entry(
    position: usize,
    entry: &IntentCatalogEntry,
    warnings: &mut Vec<String>,
) -> Result<(), CatalogError> {
    if entry.intent.trim().is_empty() {
        return Err(CatalogError::BlankIntent { position });
    }

    for language in Language::ALL {
        if entry.reply_for(language).is_none() {
            return Err(CatalogError::MissingReply {
                intent: entry.intent.clone(),
                language,
            });
        }
    }

    if entry.keywords.is_empty() {
        warnings.push(format!(
            "intent `{}` has no keywords and can never match",
            entry.intent
        ));
    } else if entry.keywords.iter().any(|keyword| keyword.trim().is_empty()) {
        warnings.push(format!("intent `{}` has a blank keyword", entry.intent));
    }

    Ok(())
}

pub fn read_catalog_file(
    path: impl AsRef<Path>,
) -> Result<(Vec<IntentCatalogEntry>, CatalogReport)> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading catalog file {}", path.display()))?;
    let entries: Vec<IntentCatalogEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing catalog file {}", path.display()))?;

    let report = validate_catalog(&entries)
        .with_context(|| format!("invalid catalog in {}", path.display()))?;
    Ok((entries, report))
}

pub fn load_catalog_file(path: impl AsRef<Path>) -> Result<Vec<IntentCatalogEntry>> {
    let path = path.as_ref();
    let (entries, report) = read_catalog_file(path)?;
    for warning in &report.warnings {
        tracing::warn!(path = %path.display(), "{warning}");
    }

    Ok(entries)
}

pub fn default_catalog() -> Vec<IntentCatalogEntry> {
    vec![
        IntentCatalogEntry::new("balance_inquiry", Category::Balance)
            .with_keywords(["balance", "solde", "crédit restant", "رصيد", "رصيدي", "الرصيد"])
            .with_response(
                Language::Ar,
                "يمكنك الاطلاع على رصيدك بطلب *100# أو من خلال تطبيق الزبائن.",
            )
            .with_response(
                Language::Fr,
                "Vous pouvez consulter votre solde en composant *100# ou depuis l'application client.",
            ),
        IntentCatalogEntry::new("recharge", Category::Recharge)
            .with_keywords(["recharge", "recharger", "top up", "شحن", "تعبئة", "تعبئة الرصيد"])
            .with_response(
                Language::Ar,
                "لشحن رصيدك، اطلب *110* متبوعاً برمز بطاقة التعبئة ثم # أو اشحن عبر التطبيق.",
            )
            .with_response(
                Language::Fr,
                "Pour recharger, composez *110* suivi du code de votre carte puis # ou rechargez depuis l'application.",
            ),
        IntentCatalogEntry::new("plans_info", Category::Plans)
            .with_keywords(["forfait", "offre", "abonnement", "internet", "عرض", "عروض", "باقة", "اشتراك"])
            .with_response(
                Language::Ar,
                "نقدم باقات مكالمات وإنترنت تناسب كل الاحتياجات. اطلب *600# لاكتشاف العروض الحالية.",
            )
            .with_response(
                Language::Fr,
                "Nous proposons des forfaits appels et internet adaptés à chaque besoin. Composez *600# pour découvrir les offres du moment.",
            ),
        IntentCatalogEntry::new("technical_support", Category::Support)
            .with_keywords([
                "problème",
                "panne",
                "réseau",
                "ne marche pas",
                "ne fonctionne pas",
                "مشكل",
                "مشكلة",
                "عطل",
                "شبكة",
                "لا يعمل",
            ])
            .with_response(
                Language::Ar,
                "نأسف للإزعاج. أعد تشغيل هاتفك وتحقق من إعدادات الشبكة، وإذا استمر المشكل اتصل بالرقم 888.",
            )
            .with_response(
                Language::Fr,
                "Nous sommes désolés pour ce désagrément. Redémarrez votre téléphone et vérifiez les réglages réseau; si le problème persiste, appelez le 888.",
            ),
        IntentCatalogEntry::new("greeting", Category::General)
            .with_keywords(["bonjour", "bonsoir", "salut", "hello", "مرحبا", "السلام عليكم", "سلام"])
            .with_response(Language::Ar, "مرحباً بك! كيف يمكنني مساعدتك اليوم؟")
            .with_response(Language::Fr, "Bonjour et bienvenue ! Comment puis-je vous aider aujourd'hui ?"),
    ]
}

use std::sync::Arc;

use crate::{
    domain::{Service, TargetLanguage, TranslationDecision},
    errors::Error,
    language::LanguageDetector,
    ports::TranslationPort,
    retry::RetryPolicy,
};

/// Text after the translator gateway, with what it decided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Translation {
    pub text: String,
    pub decision: TranslationDecision,
}

/// Conditional translation in front of a [`TranslationPort`].
///
/// Translation is a quality enhancement: this never fails. Text already in the
/// target language skips the network entirely; any failure to translate falls
/// back to the original text.
pub struct Translator {
    port: Arc<dyn TranslationPort>,
    detector: LanguageDetector,
    retry: RetryPolicy,
}

impl Translator {
    pub fn new(port: Arc<dyn TranslationPort>, detector: LanguageDetector, retry: RetryPolicy) -> Self {
        Self {
            port,
            detector,
            retry,
        }
    }

    pub fn target(&self) -> TargetLanguage {
        self.detector.target
    }

    pub fn needs_translation(&self, text: &str) -> bool {
        !self.detector.is_target_language(text)
    }

    pub async fn maybe_translate(&self, text: &str) -> Translation {
        if !self.needs_translation(text) {
            return Translation {
                text: text.to_string(),
                decision: TranslationDecision::Keep,
            };
        }

        let target = self.detector.target;
        let outcome = self
            .retry
            .run(Service::Translation, "translate", || async move {
                let out = self.port.translate(text, target).await?;
                if out.trim().is_empty() {
                    return Err(Error::terminal(
                        Service::Translation,
                        "translation came back empty",
                    ));
                }
                Ok(out)
            })
            .await;

        match outcome {
            Ok(translated) => {
                tracing::debug!(
                    target_language = target.code(),
                    chars_in = text.chars().count(),
                    chars_out = translated.chars().count(),
                    "translated"
                );
                Translation {
                    text: translated.trim().to_string(),
                    decision: TranslationDecision::Translated,
                }
            }
            Err(e) => {
                tracing::warn!(
                    target_language = target.code(),
                    error = %e,
                    "translation failed, publishing original text (degraded mode)"
                );
                Translation {
                    text: text.to_string(),
                    decision: TranslationDecision::Fallback,
                }
            }
        }
    }
}

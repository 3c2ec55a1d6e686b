//! Script-based language heuristic.

use crate::domain::TargetLanguage;

/// Decides whether text is already in the target language.
#[derive(Clone, Copy, Debug)]
pub struct LanguageDetector {
    pub target: TargetLanguage,
    /// Minimum share of target-script letters among all letters.
    pub threshold: f64,
}

impl LanguageDetector {
    pub fn new(target: TargetLanguage, threshold: f64) -> Self {
        Self { target, threshold }
    }

    /// Text without any letters (links, numbers, emoji) needs no translation.
    pub fn is_target_language(&self, text: &str) -> bool {
        let mut letters = 0usize;
        let mut target = 0usize;
        for c in text.chars().filter(|c| c.is_alphabetic()) {
            letters += 1;
            if self.is_target_script(c) {
                target += 1;
            }
        }
        if letters == 0 {
            return true;
        }
        target as f64 / letters as f64 >= self.threshold
    }

    fn is_target_script(&self, c: char) -> bool {
        match self.target {
            TargetLanguage::Russian => is_cyrillic(c),
        }
    }
}

fn is_cyrillic(c: char) -> bool {
    matches!(c, '\u{0400}'..='\u{04FF}' | '\u{0500}'..='\u{052F}')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ru() -> LanguageDetector {
        LanguageDetector::new(TargetLanguage::Russian, 0.5)
    }

    #[test]
    fn detects_russian() {
        assert!(ru().is_target_language("Тестовое сообщение"));
        assert!(ru().is_target_language("Новая листинг"));
        assert!(ru().is_target_language("Binance запускает листинг токена XYZ"));
    }

    #[test]
    fn english_needs_translation() {
        assert!(!ru().is_target_language("Binance listing soon"));
        assert!(!ru().is_target_language("Binance Lists XYZ"));
    }

    #[test]
    fn mostly_english_with_a_russian_word_needs_translation() {
        assert!(!ru().is_target_language(
            "Binance will list XYZ on the spot market (листинг) today"
        ));
    }

    #[test]
    fn letterless_text_is_kept() {
        assert!(ru().is_target_language("🚀 100 / 200"));
        assert!(ru().is_target_language("   "));
    }
}

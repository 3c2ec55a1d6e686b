//! Formatting rules (channel text → thread segments).
//!
//! Everything here is pure: the same inputs always produce byte-identical
//! segments, which is what makes a retried message look exactly like the
//! first attempt.

use regex::Regex;

use crate::{
    domain::{FormattedPost, Segment, TranslationDecision},
    errors::{Error, FormatError},
    Result,
};

/// Smallest post limit we accept; below this the decoration crowds out the body.
pub const MIN_POST_CHARS: usize = 140;

/// Emoji/hashtag decoration placed at the top of the first segment.
#[derive(Clone, Debug)]
pub struct Decoration {
    /// `(keyword, emoji)`; every keyword found in the text contributes its emoji.
    pub keyword_emojis: Vec<(String, String)>,
    /// Used when no keyword matches.
    pub fallback_emoji: String,
    /// Always included, before generated tags.
    pub fixed_hashtags: Vec<String>,
    /// How many hashtags to derive from the text.
    pub hashtag_limit: usize,
}

impl Default for Decoration {
    fn default() -> Self {
        let keyword_emojis = [
            ("листинг", "🆕"),
            ("listing", "🆕"),
            ("launchpool", "🚀"),
            ("maintenance", "🛠️"),
            ("upgrade", "🔧"),
            ("update", "🔄"),
            ("airdrop", "🎁"),
            ("bonus", "💰"),
            ("binance", "🟡"),
        ]
        .into_iter()
        .map(|(k, e)| (k.to_string(), e.to_string()))
        .collect();

        Self {
            keyword_emojis,
            fallback_emoji: "📢".to_string(),
            fixed_hashtags: Vec::new(),
            hashtag_limit: 2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FormatterConfig {
    /// Hard per-post limit, in Unicode scalar values.
    pub max_chars: usize,
    pub decoration: Decoration,
    /// Label before the origin link.
    pub source_label: String,
    /// Label before the origin link when the body was machine-translated.
    pub translated_source_label: String,
}

impl Default for FormatterConfig {
    fn default() -> Self {
        Self {
            max_chars: 270,
            decoration: Decoration::default(),
            source_label: "Источник:".to_string(),
            translated_source_label: "Оригинал:".to_string(),
        }
    }
}

impl FormatterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_chars < MIN_POST_CHARS {
            return Err(Error::Config(format!(
                "post limit must be at least {MIN_POST_CHARS} characters (got {})",
                self.max_chars
            )));
        }
        let label_len = char_len(&self.source_label).max(char_len(&self.translated_source_label));
        if label_len > self.max_chars / 4 {
            return Err(Error::Config(
                "source label takes more than a quarter of a post".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where a token sits relative to the previous one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Break {
    Space,
    Line,
    Paragraph,
}

impl Break {
    fn as_str(self) -> &'static str {
        match self {
            Break::Space => " ",
            Break::Line => "\n",
            Break::Paragraph => "\n\n",
        }
    }
}

#[derive(Clone, Debug)]
struct Token {
    before: Break,
    word: String,
}

pub struct Formatter {
    cfg: FormatterConfig,
    md_link: Regex,
    html_tag: Regex,
    hashtag_word: Regex,
}

impl Formatter {
    pub fn new(cfg: FormatterConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            md_link: Regex::new(r"\[([^\]\n]+)\]\((https?://[^)\s]+)\)").expect("valid regex"),
            html_tag: Regex::new(r"</?[A-Za-z][A-Za-z0-9]*(?:\s[^<>]*)?/?>").expect("valid regex"),
            hashtag_word: Regex::new(r"^[A-Za-z0-9]{3,}$").expect("valid regex"),
        })
    }

    pub fn config(&self) -> &FormatterConfig {
        &self.cfg
    }

    /// Turn message text into thread segments.
    ///
    /// `link_block` is appended after the body; the origin link always lives in
    /// the first segment.
    pub fn format(
        &self,
        text: &str,
        origin_url: &str,
        link_block: &str,
        decision: TranslationDecision,
    ) -> std::result::Result<FormattedPost, FormatError> {
        let body = self.normalize(text);
        if body.is_empty() {
            return Err(FormatError::Empty);
        }

        let limit = self.cfg.max_chars;
        let label = match decision {
            TranslationDecision::Translated => &self.cfg.translated_source_label,
            TranslationDecision::Keep | TranslationDecision::Fallback => &self.cfg.source_label,
        };
        let source_line = format!("{label} {}", origin_url.trim());
        if char_len(&source_line) + 2 >= limit {
            return Err(FormatError::SourceLinkTooLong);
        }

        let mut header = self.header(&body);
        let mut first_cap = first_capacity(limit, &header, &source_line);
        if first_cap == 0 {
            header.clear();
            first_cap = first_capacity(limit, &header, &source_line);
        }

        let mut tokens = tokenize(&body);
        let links = tokenize(&collapse_whitespace(link_block));
        if let Some((first, rest)) = links.split_first() {
            tokens.push(Token {
                before: Break::Paragraph,
                word: first.word.clone(),
            });
            tokens.extend(rest.iter().cloned());
        }

        let mut digits = 1usize;
        let bodies = loop {
            let cont_cap = limit.saturating_sub(3 + 2 * digits);
            let packed = pack(&tokens, |idx| if idx == 0 { first_cap } else { cont_cap });
            let needed = count_digits(packed.len());
            if packed.len() == 1 || needed <= digits {
                break packed;
            }
            digits = needed;
        };

        let total = bodies.len();
        let segments = bodies
            .into_iter()
            .enumerate()
            .map(|(idx, part)| {
                let position = idx + 1;
                let text = if idx == 0 {
                    let lead = join_non_empty(&[header.as_str(), part.as_str()], "\n");
                    join_non_empty(&[lead.as_str(), source_line.as_str()], "\n\n")
                } else {
                    format!("{part}\n\n{position}/{total}")
                };
                Segment {
                    position,
                    total,
                    text,
                }
            })
            .collect();

        Ok(FormattedPost { segments })
    }

    /// Plain text with markup decoded and whitespace normalized.
    pub fn normalize(&self, text: &str) -> String {
        let text = text.replace("\r\n", "\n").replace('\r', "\n");
        let text = self.md_link.replace_all(&text, "$1 ($2)");
        let text = self.html_tag.replace_all(&text, "");
        let text = text.replace("**", "").replace("__", "").replace("~~", "");
        let text = decode_entities(&text);
        collapse_whitespace(&text)
    }

    fn header(&self, body: &str) -> String {
        let deco = &self.cfg.decoration;
        let lowered = body.to_lowercase();

        let mut emojis: Vec<&str> = Vec::new();
        for (keyword, emoji) in &deco.keyword_emojis {
            if lowered.contains(&keyword.to_lowercase()) && !emojis.contains(&emoji.as_str()) {
                emojis.push(emoji);
            }
        }
        if emojis.is_empty() && !deco.fallback_emoji.is_empty() {
            emojis.push(&deco.fallback_emoji);
        }

        let budget = self.cfg.max_chars / 4;
        let mut header = emojis.join(" ");
        for tag in self.hashtags(body) {
            let candidate = join_non_empty(&[header.as_str(), tag.as_str()], " ");
            if char_len(&candidate) > budget {
                break;
            }
            header = candidate;
        }
        header
    }

    /// Fixed tags, then up to `hashtag_limit` tags from ASCII words of the text.
    pub fn hashtags(&self, body: &str) -> Vec<String> {
        let deco = &self.cfg.decoration;
        let mut tags: Vec<String> = deco
            .fixed_hashtags
            .iter()
            .map(|t| t.trim().trim_start_matches('#').to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        tags.dedup();

        let mut generated = 0usize;
        for word in body.split_whitespace() {
            if generated >= deco.hashtag_limit {
                break;
            }
            if is_url(word) {
                continue;
            }
            for part in word.split(|c: char| !c.is_ascii_alphanumeric()) {
                if generated >= deco.hashtag_limit {
                    break;
                }
                if !self.hashtag_word.is_match(part) || part.chars().all(|c| c.is_ascii_digit()) {
                    continue;
                }
                let tag = part.to_lowercase();
                if !tags.contains(&tag) {
                    tags.push(tag);
                    generated += 1;
                }
            }
        }

        tags.into_iter().map(|t| format!("#{t}")).collect()
    }
}

fn first_capacity(limit: usize, header: &str, source_line: &str) -> usize {
    let header_len = if header.is_empty() {
        0
    } else {
        char_len(header) + 1
    };
    limit.saturating_sub(header_len + 2 + char_len(source_line))
}

/// Greedy word packing; optimal for an ordered sequence with fixed capacities.
fn pack(tokens: &[Token], capacity: impl Fn(usize) -> usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut cur = String::new();
    let mut cur_len = 0usize;

    for tok in tokens {
        let word_len = char_len(&tok.word);
        if !cur.is_empty() {
            let sep = tok.before.as_str();
            if cur_len + sep.len() + word_len <= capacity(out.len()) {
                cur.push_str(sep);
                cur.push_str(&tok.word);
                cur_len += sep.len() + word_len;
                continue;
            }
            out.push(std::mem::take(&mut cur));
        }

        // Start of a segment. Only a token longer than a continuation is cut.
        let mut rest: &str = &tok.word;
        loop {
            let cap = capacity(out.len());
            if cap == 0 {
                out.push(String::new());
                continue;
            }
            let rest_len = char_len(rest);
            if rest_len <= cap {
                cur.push_str(rest);
                cur_len = rest_len;
                break;
            }
            // A leading token that only fits a continuation leaves the
            // first post with the header and source line alone.
            if out.is_empty() && rest_len <= capacity(1) {
                out.push(String::new());
                continue;
            }
            let cut = rest
                .char_indices()
                .nth(cap)
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
            out.push(rest[..cut].to_string());
            rest = &rest[cut..];
        }
    }

    if !cur.is_empty() || out.is_empty() {
        out.push(cur);
    }
    out
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut pending = Break::Space;
    for line in text.split('\n') {
        if line.is_empty() {
            pending = Break::Paragraph;
            continue;
        }
        for (i, word) in line.split(' ').filter(|w| !w.is_empty()).enumerate() {
            let before = if i == 0 { pending } else { Break::Space };
            tokens.push(Token {
                before,
                word: word.to_string(),
            });
        }
        pending = Break::Line;
    }
    tokens
}

/// Trim lines, squeeze inner whitespace and keep at most one blank line.
fn collapse_whitespace(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.split('\n') {
        let line = raw
            .split(|c: char| c.is_whitespace())
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if line.is_empty() && lines.last().map_or(true, |l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

fn is_url(word: &str) -> bool {
    let lower = word.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("www.")
}

fn join_non_empty(parts: &[&str], sep: &str) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(sep)
}

fn count_digits(n: usize) -> usize {
    n.to_string().len()
}

pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::{
    errors::Error,
    formatting::{Decoration, FormatterConfig},
    retry::RetryPolicy,
    Result,
};

pub const DEFAULT_LINK_BLOCK: &str = "Полезные ссылки Binance:\n\
• Биржа: https://www.binance.com\n\
• Поддержка: https://www.binance.com/support\n\
• Академия: https://academy.binance.com";

/// A credential. `Debug` and `Display` never print the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(Clone, Debug)]
pub struct TelegramConfig {
    pub bot_token: Secret,
    /// Public channel username, without `@`.
    pub channel: String,
    pub fetch_limit: u8,
}

#[derive(Clone, Debug)]
pub struct DeepSeekConfig {
    pub api_key: Secret,
    pub base_url: String,
    pub model: String,
}

#[derive(Clone, Debug)]
pub struct TwitterConfig {
    pub client_id: String,
    pub refresh_token: Secret,
    pub redirect_uri: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?} (expected text or json)")),
        }
    }
}

/// Command-line values that take precedence over the environment.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub dry_run: bool,
    pub state_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

/// Typed, validated configuration for one run.
#[derive(Clone, Debug)]
pub struct Config {
    pub dry_run: bool,

    // Adapters
    pub telegram: TelegramConfig,
    pub deepseek: DeepSeekConfig,
    /// Absent only in dry-run mode without credentials.
    pub twitter: Option<TwitterConfig>,

    // State
    pub state_dir: PathBuf,

    // Pipeline
    pub formatter: FormatterConfig,
    pub link_block: String,
    pub language_threshold: f64,
    pub stuck_threshold: u32,
    pub retry: RetryPolicy,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Read `.env` (if present) and the process environment.
    pub fn load(overrides: &Overrides) -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok(), overrides)
    }

    /// Build from an arbitrary key lookup. Every missing or malformed variable
    /// is reported in a single `Error::Config`.
    pub fn from_lookup<F>(lookup: F, overrides: &Overrides) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut vars = Vars {
            lookup,
            missing: Vec::new(),
            invalid: Vec::new(),
        };
        let dry_run = overrides.dry_run;

        let bot_token = vars.required(&["TELEGRAM_BOT_TOKEN"]);
        let channel = vars.required(&["SOURCE_CHANNEL", "TELEGRAMCANALISTOCHNIK"]);
        let fetch_limit = vars.parsed("SOURCE_FETCH_LIMIT", 100u8);

        let api_key = vars.required(&["DEEPSEEK_API_KEY"]);
        let base_url = vars
            .optional(&["DEEPSEEK_BASE_URL"])
            .unwrap_or_else(|| "https://api.deepseek.com".to_string());
        let model = vars
            .optional(&["DEEPSEEK_MODEL"])
            .unwrap_or_else(|| "deepseek-chat".to_string());

        let (client_id, refresh_token) = if dry_run {
            (
                vars.optional(&["TWITTER_CLIENT_ID", "TWITTER_API_KEY"]),
                vars.optional(&["TWITTER_REFRESH_TOKEN", "TWITTER_ACCESS_TOKEN"]),
            )
        } else {
            (
                vars.required(&["TWITTER_CLIENT_ID", "TWITTER_API_KEY"]),
                vars.required(&["TWITTER_REFRESH_TOKEN", "TWITTER_ACCESS_TOKEN"]),
            )
        };
        let redirect_uri = vars
            .optional(&["TWITTER_REDIRECT_URI"])
            .unwrap_or_else(|| "https://localhost".to_string());

        let state_dir = overrides.state_dir.clone().unwrap_or_else(|| {
            PathBuf::from(vars.optional(&["STATE_DIR"]).unwrap_or_else(|| "state".to_string()))
        });

        let max_chars = vars.parsed("POST_MAX_CHARS", 270usize);
        let link_block = vars
            .optional(&["LINK_BLOCK"])
            .map(|v| v.replace("\\n", "\n"))
            .unwrap_or_else(|| DEFAULT_LINK_BLOCK.to_string());
        let fixed_hashtags = parse_csv(vars.optional(&["FIXED_HASHTAGS"]));
        let language_threshold = vars.parsed("LANGUAGE_THRESHOLD", 0.5f64);
        let stuck_threshold = vars.parsed("STUCK_MESSAGE_THRESHOLD", 3u32);

        let timeout_ms = vars.parsed("REQUEST_TIMEOUT_MS", 20_000u64);
        let max_attempts = vars.parsed("RETRY_MAX_ATTEMPTS", 4u32);
        let base_delay_ms = vars.parsed("RETRY_BASE_DELAY_MS", 1_000u64);
        let max_delay_ms = vars.parsed("RETRY_MAX_DELAY_MS", 30_000u64);

        let log_level = overrides
            .log_level
            .clone()
            .or_else(|| vars.optional(&["LOG_LEVEL"]))
            .unwrap_or_else(|| "info".to_string())
            .to_lowercase();
        let log_format = vars.parsed("LOG_FORMAT", LogFormat::Text);

        if !(0.0..=1.0).contains(&language_threshold) {
            vars.invalid
                .push(format!("LANGUAGE_THRESHOLD must be within 0..=1 (got {language_threshold})"));
        }
        if stuck_threshold == 0 {
            vars.invalid
                .push("STUCK_MESSAGE_THRESHOLD must be at least 1".to_string());
        }
        if max_attempts == 0 {
            vars.invalid.push("RETRY_MAX_ATTEMPTS must be at least 1".to_string());
        }
        if fetch_limit == 0 || fetch_limit > 100 {
            vars.invalid
                .push(format!("SOURCE_FETCH_LIMIT must be within 1..=100 (got {fetch_limit})"));
        }

        vars.finish()?;

        let formatter = FormatterConfig {
            max_chars,
            decoration: Decoration {
                fixed_hashtags,
                ..Decoration::default()
            },
            ..FormatterConfig::default()
        };
        formatter.validate()?;

        let twitter = match (client_id, refresh_token) {
            (Some(client_id), Some(refresh_token)) => Some(TwitterConfig {
                client_id,
                refresh_token: Secret::new(refresh_token),
                redirect_uri,
            }),
            _ => None,
        };

        Ok(Self {
            dry_run,
            telegram: TelegramConfig {
                bot_token: Secret::new(bot_token.unwrap_or_default()),
                channel: normalize_channel(&channel.unwrap_or_default()),
                fetch_limit,
            },
            deepseek: DeepSeekConfig {
                api_key: Secret::new(api_key.unwrap_or_default()),
                base_url: base_url.trim_end_matches('/').to_string(),
                model,
            },
            twitter,
            state_dir,
            formatter,
            link_block,
            language_threshold,
            stuck_threshold,
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(base_delay_ms),
                max_delay: Duration::from_millis(max_delay_ms),
                jitter: true,
                attempt_timeout: Duration::from_millis(timeout_ms),
            },
            log_level,
            log_format,
        })
    }
}

/// Collects problems instead of stopping at the first one.
struct Vars<F> {
    lookup: F,
    missing: Vec<String>,
    invalid: Vec<String>,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// First non-empty value among `names` (primary name, then aliases).
    fn optional(&self, names: &[&str]) -> Option<String> {
        names
            .iter()
            .filter_map(|name| (self.lookup)(name))
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    }

    fn required(&mut self, names: &[&str]) -> Option<String> {
        let value = self.optional(names);
        if value.is_none() {
            self.missing.push(names.join(" | "));
        }
        value
    }

    fn parsed<T>(&mut self, name: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.optional(&[name]) {
            None => default,
            Some(raw) => match raw.parse::<T>() {
                Ok(v) => v,
                Err(e) => {
                    self.invalid.push(format!("{name}={raw:?}: {e}"));
                    default
                }
            },
        }
    }

    fn finish(&self) -> Result<()> {
        let mut problems = Vec::new();
        if !self.missing.is_empty() {
            problems.push(format!(
                "missing required environment variables: {}",
                self.missing.join(", ")
            ));
        }
        if !self.invalid.is_empty() {
            problems.push(format!("invalid values: {}", self.invalid.join("; ")));
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }
}

/// Accepts `name`, `@name` or a `t.me` link.
fn normalize_channel(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    let name = trimmed
        .strip_prefix("https://t.me/")
        .or_else(|| trimmed.strip_prefix("http://t.me/"))
        .or_else(|| trimmed.strip_prefix("t.me/"))
        .unwrap_or(trimmed);
    name.trim_start_matches('@').to_string()
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().trim_start_matches('#').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // real environment wins
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const FULL: &[(&str, &str)] = &[
        ("TELEGRAM_BOT_TOKEN", "123:abc"),
        ("SOURCE_CHANNEL", "@binance_announcements"),
        ("DEEPSEEK_API_KEY", "sk-test"),
        ("TWITTER_CLIENT_ID", "client"),
        ("TWITTER_REFRESH_TOKEN", "refresh"),
    ];

    #[test]
    fn defaults_apply() {
        let cfg = Config::from_lookup(lookup(FULL), &Overrides::default()).unwrap();
        assert_eq!(cfg.telegram.channel, "binance_announcements");
        assert_eq!(cfg.telegram.fetch_limit, 100);
        assert_eq!(cfg.deepseek.base_url, "https://api.deepseek.com");
        assert_eq!(cfg.deepseek.model, "deepseek-chat");
        assert_eq!(cfg.state_dir, PathBuf::from("state"));
        assert_eq!(cfg.formatter.max_chars, 270);
        assert_eq!(cfg.stuck_threshold, 3);
        assert_eq!(cfg.retry.max_attempts, 4);
        assert_eq!(cfg.retry.attempt_timeout, Duration::from_secs(20));
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert!(cfg.link_block.contains("https://academy.binance.com"));
        let tw = cfg.twitter.unwrap();
        assert_eq!(tw.redirect_uri, "https://localhost");
        assert_eq!(tw.refresh_token.expose(), "refresh");
    }

    #[test]
    fn reports_every_missing_variable() {
        let err = Config::from_lookup(lookup(&[]), &Overrides::default()).unwrap_err();
        let msg = err.to_string();
        for name in [
            "TELEGRAM_BOT_TOKEN",
            "SOURCE_CHANNEL | TELEGRAMCANALISTOCHNIK",
            "DEEPSEEK_API_KEY",
            "TWITTER_CLIENT_ID | TWITTER_API_KEY",
            "TWITTER_REFRESH_TOKEN | TWITTER_ACCESS_TOKEN",
        ] {
            assert!(msg.contains(name), "{name} not in {msg}");
        }
    }

    #[test]
    fn dry_run_does_not_need_twitter() {
        let overrides = Overrides {
            dry_run: true,
            ..Overrides::default()
        };
        let cfg = Config::from_lookup(lookup(&FULL[..3]), &overrides).unwrap();
        assert!(cfg.dry_run);
        assert!(cfg.twitter.is_none());
    }

    #[test]
    fn aliases_are_accepted() {
        let cfg = Config::from_lookup(
            lookup(&[
                ("TELEGRAM_BOT_TOKEN", "t"),
                ("TELEGRAMCANALISTOCHNIK", "https://t.me/binance_ru/"),
                ("DEEPSEEK_API_KEY", "k"),
                ("TWITTER_API_KEY", "c"),
                ("TWITTER_ACCESS_TOKEN", "r"),
            ]),
            &Overrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.telegram.channel, "binance_ru");
        assert_eq!(cfg.twitter.unwrap().client_id, "c");
    }

    #[test]
    fn malformed_numbers_are_reported() {
        let mut pairs = FULL.to_vec();
        pairs.push(("POST_MAX_CHARS", "lots"));
        pairs.push(("RETRY_MAX_ATTEMPTS", "0"));
        let err = Config::from_lookup(lookup(&pairs), &Overrides::default()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("POST_MAX_CHARS"));
        assert!(msg.contains("RETRY_MAX_ATTEMPTS"));
    }

    #[test]
    fn tiny_post_limit_is_rejected() {
        let mut pairs = FULL.to_vec();
        pairs.push(("POST_MAX_CHARS", "40"));
        let err = Config::from_lookup(lookup(&pairs), &Overrides::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn overrides_win_over_environment() {
        let mut pairs = FULL.to_vec();
        pairs.push(("STATE_DIR", "/var/lib/relay"));
        pairs.push(("LOG_LEVEL", "warn"));
        let overrides = Overrides {
            dry_run: false,
            state_dir: Some(PathBuf::from("/tmp/relay")),
            log_level: Some("DEBUG".to_string()),
        };
        let cfg = Config::from_lookup(lookup(&pairs), &overrides).unwrap();
        assert_eq!(cfg.state_dir, PathBuf::from("/tmp/relay"));
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn secrets_are_masked_in_debug() {
        let cfg = Config::from_lookup(lookup(FULL), &Overrides::default()).unwrap();
        let dump = format!("{cfg:?}");
        assert!(!dump.contains("sk-test"));
        assert!(!dump.contains("123:abc"));
        assert!(dump.contains("***"));
    }

    #[test]
    fn fixed_hashtags_and_link_block_are_configurable() {
        let mut pairs = FULL.to_vec();
        pairs.push(("FIXED_HASHTAGS", "#Binance, crypto"));
        pairs.push(("LINK_BLOCK", "Links:\\nhttps://example.com"));
        let cfg = Config::from_lookup(lookup(&pairs), &Overrides::default()).unwrap();
        assert_eq!(cfg.formatter.decoration.fixed_hashtags, vec!["Binance", "crypto"]);
        assert_eq!(cfg.link_block, "Links:\nhttps://example.com");
    }
}

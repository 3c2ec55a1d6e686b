use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use teloxide::Bot;
use tokio_util::sync::CancellationToken;

use relay_core::{
    config::{Config, LogFormat, Overrides},
    domain::TargetLanguage,
    formatting::Formatter,
    language::LanguageDetector,
    logging,
    pipeline::{Pipeline, PipelineOptions},
    ports::DurableStorage,
    publisher::Publisher,
    state::{CheckpointStore, FileStorage},
    translator::Translator,
};
use relay_deepseek::DeepSeekClient;
use relay_telegram::TelegramSource;
use relay_twitter::{TwitterClient, TwitterCredentials};

#[derive(Parser)]
#[command(
    name = "relay",
    version,
    about = "Relays Telegram channel announcements to X as threads"
)]
struct Cli {
    /// Translate and format only: nothing is published and no state is written
    #[arg(long)]
    dry_run: bool,

    /// Directory holding the checkpoint, backlog and token files (overrides STATE_DIR)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); overrides LOG_LEVEL
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let overrides = Overrides {
        dry_run: cli.dry_run,
        state_dir: cli.state_dir,
        log_level: cli.log_level,
    };

    let cfg = match Config::load(&overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            let level = overrides.log_level.as_deref().unwrap_or("info");
            let _ = logging::init("relay", level, LogFormat::Text);
            tracing::error!(error = %e, "invalid configuration");
            return Err(e).context("configuration");
        }
    };
    logging::init("relay", &cfg.log_level, cfg.log_format)?;

    let storage: Arc<dyn DurableStorage> = Arc::new(FileStorage::new(&cfg.state_dir));
    let mut store = CheckpointStore::load(storage.clone());

    let source = TelegramSource::new(
        Bot::new(cfg.telegram.bot_token.expose()),
        cfg.telegram.channel.clone(),
        cfg.telegram.fetch_limit,
        cfg.retry,
    );
    let source = Arc::new(if cfg.dry_run {
        source.with_read_only_backlog(storage.clone())
    } else {
        source.with_backlog(storage.clone())
    });

    let deepseek = DeepSeekClient::new(cfg.deepseek.api_key.expose(), cfg.retry.attempt_timeout)?
        .with_base_url(&cfg.deepseek.base_url)
        .with_model(&cfg.deepseek.model);
    let translator = Translator::new(
        Arc::new(deepseek),
        LanguageDetector::new(TargetLanguage::Russian, cfg.language_threshold),
        cfg.retry,
    );

    let formatter = Formatter::new(cfg.formatter.clone())?;

    let publisher = match (&cfg.twitter, cfg.dry_run) {
        (Some(tw), false) => {
            let client = TwitterClient::new(
                TwitterCredentials {
                    client_id: tw.client_id.clone(),
                    refresh_token: tw.refresh_token.expose().to_string(),
                    redirect_uri: tw.redirect_uri.clone(),
                },
                cfg.retry.attempt_timeout,
            )?
            .with_token_store(storage.clone());
            Some(Publisher::new(Arc::new(client), cfg.retry))
        }
        _ => None,
    };

    let pipeline = Pipeline::new(
        source,
        translator,
        formatter,
        publisher,
        PipelineOptions {
            dry_run: cfg.dry_run,
            link_block: cfg.link_block.clone(),
            stuck_threshold: cfg.stuck_threshold,
        },
    )?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, finishing the current message");
                cancel.cancel();
            }
        });
    }

    tracing::info!(
        channel = %cfg.telegram.channel,
        state_dir = %cfg.state_dir.display(),
        dry_run = cfg.dry_run,
        "relay starting"
    );

    let summary = pipeline
        .run(&mut store, &cancel)
        .await
        .context("relay run failed")?;

    if !summary.stuck.is_empty() {
        tracing::warn!(stuck = summary.stuck.len(), "some messages keep failing");
    }

    Ok(())
}

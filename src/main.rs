use dotenvy::dotenv;
use oxide_wasabi::app::AppContext;
use oxide_wasabi::bot::handlers::{get_user_id_safe, Command};
use oxide_wasabi::bot::upload::{clear_work_dir, incoming_file};
use oxide_wasabi::bot::{self, UnauthorizedCache};
use oxide_wasabi::config::Settings;
use oxide_wasabi::storage::{StorageProvider, WasabiStorage};
use oxide_wasabi::web;
use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::SystemTime;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Regex patterns for redacting sensitive data
struct RedactionPatterns {
    token1: Regex,
    token2: Regex,
    token3: Regex,
    wasabi_access: Regex,
    wasabi_secret: Regex,
    amz_signature: Regex,
    amz_credential: Regex,
}

impl RedactionPatterns {
    /// Initialize all regex patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            token1: Regex::new(r"(https?://[^/]+/(?:file/)?bot)([0-9]+:[A-Za-z0-9_-]+)(/['\s]*)")?,
            token2: Regex::new(r"([0-9]{8,10}:[A-Za-z0-9_-]{35})")?,
            token3: Regex::new(r"(bot[0-9]{8,10}:)[A-Za-z0-9_-]+")?,
            wasabi_access: Regex::new(r"WASABI_ACCESS_KEY=[^\s&]+")?,
            wasabi_secret: Regex::new(r"WASABI_SECRET_KEY=[^\s&]+")?,
            amz_signature: Regex::new(r"(X-Amz-Signature=)[^&\s]+")?,
            amz_credential: Regex::new(r"(X-Amz-Credential=)[^&\s]+")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        output = self
            .token1
            .replace_all(&output, "$1[TELEGRAM_TOKEN]$3")
            .to_string();
        output = self
            .token2
            .replace_all(&output, "[TELEGRAM_TOKEN]")
            .to_string();
        output = self
            .token3
            .replace_all(&output, "$1[TELEGRAM_TOKEN]")
            .to_string();
        output = self
            .wasabi_access
            .replace_all(&output, "WASABI_ACCESS_KEY=[MASKED]")
            .to_string();
        output = self
            .wasabi_secret
            .replace_all(&output, "WASABI_SECRET_KEY=[MASKED]")
            .to_string();
        output = self
            .amz_signature
            .replace_all(&output, "$1[MASKED]")
            .to_string();
        output = self
            .amz_credential
            .replace_all(&output, "$1[MASKED]")
            .to_string();
        output
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> RedactingWriter<W> {
    const fn new(inner: W, patterns: Arc<RedactionPatterns>) -> Self {
        Self { inner, patterns }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // Report the original length; the redacted text may differ in size
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<F> RedactingMakeWriter<F> {
    const fn new(make_inner: F, patterns: Arc<RedactionPatterns>) -> Self {
        Self {
            make_inner,
            patterns,
        }
    }
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new((self.make_inner)(), self.patterns.clone())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Patterns must exist before the first log line
    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile regex patterns: {e}");
        e
    })?);
    init_logging(patterns);

    info!("Starting Wasabi file bot...");

    let settings = init_settings();
    let started = SystemTime::now();
    clean_work_dir(&settings, "startup").await;
    let storage = init_storage(&settings, started).await;
    let ctx = Arc::new(AppContext::new(Arc::clone(&settings), storage));

    let web_ctx = Arc::clone(&ctx);
    let port = settings.port;
    tokio::spawn(async move {
        if let Err(e) = web::start_web_server(port, web_ctx).await {
            error!("Web server stopped: {e}");
        }
    });

    let bot = init_bot(&settings);
    let unauthorized_cache = init_unauthorized_cache();
    let handler = setup_handler();

    info!("Bot is running...");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![Arc::clone(&ctx), unauthorized_cache])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    let running = ctx.running_transfers();
    if running > 0 {
        info!(running = running, "Waiting for transfers to finish...");
    }
    if !ctx.drain_transfers(settings.shutdown_grace()).await {
        warn!(
            running = ctx.running_transfers(),
            "Shutdown grace period elapsed with transfers still running"
        );
    }
    clean_work_dir(&settings, "shutdown").await;
    info!("Bot stopped.");

    Ok(())
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter::new(io::stderr, patterns);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

fn init_settings() -> Arc<Settings> {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

/// Removes staged files left behind by an earlier run or a cut-off transfer.
async fn clean_work_dir(settings: &Settings, phase: &str) {
    let dir = settings.work_dir();
    match clear_work_dir(&dir).await {
        Ok(0) => {}
        Ok(removed) => info!(phase = phase, removed = removed, dir = %dir.display(), "Removed staged files"),
        Err(e) => warn!(phase = phase, dir = %dir.display(), "Failed to clean work dir: {e}"),
    }
}

async fn init_storage(settings: &Settings, started: SystemTime) -> Arc<dyn StorageProvider> {
    match WasabiStorage::new(settings).await {
        Ok(s) => {
            info!(
                bucket = %s.bucket(),
                endpoint = %settings.endpoint_url(),
                "Wasabi storage initialized."
            );
            match s.check_connection().await {
                Ok(()) => {
                    info!("Wasabi connection check passed.");
                    match s.abort_stale_uploads(started).await {
                        Ok(0) => {}
                        Ok(aborted) => info!(aborted = aborted, "Aborted unfinished multipart uploads"),
                        Err(e) => warn!("Could not list unfinished multipart uploads: {e}"),
                    }
                }
                Err(e) => error!("Wasabi connection check failed: {e}"),
            }
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to initialize Wasabi storage: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_bot(settings: &Settings) -> Bot {
    let bot = Bot::new(settings.bot_token.clone());
    let Some(api_url) = settings.telegram_api_url.as_deref() else {
        return bot;
    };
    match url::Url::parse(api_url) {
        Ok(url) => {
            info!("Using Bot API server at {url}");
            bot.set_api_url(url)
        }
        Err(e) => {
            warn!("Ignoring invalid TELEGRAM_API_URL: {e}");
            bot
        }
    }
}

fn init_unauthorized_cache() -> Arc<UnauthorizedCache> {
    let cache = UnauthorizedCache::from_env();
    info!(
        "Initializing UnauthorizedCache (cooldown: {}s)",
        cache.cooldown().as_secs()
    );
    Arc::new(cache)
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry()
        .branch(
            Update::filter_message().branch(
                dptree::filter(|msg: Message, ctx: Arc<AppContext>| {
                    ctx.access.is_authorized(get_user_id_safe(&msg))
                })
                .branch(
                    dptree::entry()
                        .filter_command::<Command>()
                        .endpoint(handle_command),
                )
                .branch(
                    dptree::filter(|msg: Message| incoming_file(&msg).is_some())
                        .endpoint(handle_media),
                )
                .branch(dptree::filter(|msg: Message| msg.text().is_some()).endpoint(handle_text)),
            ),
        )
        .branch(
            Update::filter_message()
                .filter(|msg: Message, ctx: Arc<AppContext>| {
                    !ctx.access.is_authorized(get_user_id_safe(&msg))
                })
                .endpoint(handle_unauthorized),
        )
}

async fn handle_unauthorized(
    bot: Bot,
    msg: Message,
    cache: Arc<UnauthorizedCache>,
) -> Result<(), teloxide::RequestError> {
    let user_id = get_user_id_safe(&msg);
    let user_name = msg
        .from
        .as_ref()
        .map(|u| u.first_name.clone())
        .unwrap_or_else(|| "Unknown".to_string());

    if cache.should_send(user_id, &user_name).await {
        info!(
            "⛔️ Unauthorized access from user {} ({}). Sending denial message.",
            user_id, user_name
        );

        if let Err(e) = bot.send_message(msg.chat.id, "⛔ Unauthorized access.").await {
            error!("Failed to send access denied message to {}: {}", user_id, e);
        } else {
            cache.mark_sent(user_id).await;
        }
    }

    respond(())
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    ctx: Arc<AppContext>,
) -> Result<(), teloxide::RequestError> {
    let res = match cmd {
        Command::Start => bot::handlers::start(bot, msg, ctx).await,
        Command::Help => bot::handlers::help(bot, msg).await,
        Command::List => bot::handlers::list(bot, msg, ctx).await,
        Command::Download(name) => {
            // Transfers run detached so the chat stays responsive
            let transfers = Arc::clone(&ctx);
            transfers.spawn_transfer(async move {
                if let Err(e) = bot::download::download(bot, msg, ctx, name).await {
                    error!("Download handler error: {}", e);
                }
            });
            Ok(())
        }
        Command::Stream(name) | Command::Play(name) => {
            bot::download::stream(bot, msg, ctx, name).await
        }
        Command::Delete(name) => bot::handlers::delete(bot, msg, ctx, name).await,
        Command::Test => bot::handlers::test(bot, msg, ctx).await,
        Command::Status => bot::handlers::status(bot, msg, ctx).await,
        Command::AddUser(arg) => bot::handlers::add_user(bot, msg, ctx, arg).await,
        Command::RemoveUser(arg) => bot::handlers::remove_user(bot, msg, ctx, arg).await,
        Command::ListUsers => bot::handlers::list_users(bot, msg, ctx).await,
    };
    if let Err(e) = res {
        error!("Command error: {}", e);
    }
    respond(())
}

async fn handle_media(
    bot: Bot,
    msg: Message,
    ctx: Arc<AppContext>,
) -> Result<(), teloxide::RequestError> {
    let transfers = Arc::clone(&ctx);
    transfers.spawn_transfer(async move {
        if let Err(e) = bot::upload::handle_upload(bot, msg, ctx).await {
            error!("Upload handler error: {}", e);
        }
    });
    respond(())
}

async fn handle_text(bot: Bot, msg: Message) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot::handlers::hint(bot, msg).await {
        error!("Text handler error: {}", e);
    }
    respond(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_tokens_and_presigned_secrets() -> Result<(), regex::Error> {
        let patterns = RedactionPatterns::new()?;

        let line = "GET https://api.telegram.org/bot123456789:AAbbCCddEEffGGhhIIjjKKllMMnnOOppQQr/getMe ";
        let redacted = patterns.redact(line);
        assert!(!redacted.contains("AAbbCC"));
        assert!(redacted.contains("[TELEGRAM_TOKEN]"));

        let url = "https://s3.wasabisys.com/b/k?X-Amz-Credential=AKID%2F2024&X-Amz-Signature=deadbeef&x=1";
        let redacted = patterns.redact(url);
        assert!(redacted.contains("X-Amz-Credential=[MASKED]&"));
        assert!(redacted.contains("X-Amz-Signature=[MASKED]&x=1"));
        assert!(!redacted.contains("deadbeef"));

        let env = "WASABI_ACCESS_KEY=AKID WASABI_SECRET_KEY=shh";
        assert_eq!(
            patterns.redact(env),
            "WASABI_ACCESS_KEY=[MASKED] WASABI_SECRET_KEY=[MASKED]"
        );
        Ok(())
    }
}

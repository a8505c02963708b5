use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use mail_assist::config::Settings;
use mail_assist::email::compose::ReplyComposer;
use mail_assist::email::transport::{
    RelayFactory, SmtpRelays, Stdout, TransportConfig, create_transport,
};
use mail_assist::llm::{AiClient, create_provider};
use mail_assist::pipeline::{
    EventSink, FanoutSink, Pipeline, PipelineOutcome, TracingSink, WebhookSink,
};
use mail_assist::prompt::PromptBuilder;

#[derive(Parser)]
#[command(name = "mail-assist", version, about)]
struct Cli {
    /// Raw email to answer. Reads stdin when omitted.
    #[arg(long, value_name = "FILE", env = "MAIL_ASSIST_INPUT")]
    input: Option<PathBuf>,

    /// Print the reply to stdout instead of sending it
    #[arg(long)]
    dry_run: bool,

    /// Assistants file (overrides MAIL_ASSIST_ASSISTANTS)
    #[arg(long, value_name = "FILE")]
    assistants: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = Cli::parse();

    let mut settings = Settings::from_env().context("invalid configuration")?;
    if let Some(path) = cli.assistants {
        settings.assistants_path = path;
    }
    if cli.dry_run {
        settings.transport = TransportConfig::Stdout;
    }

    let _log_guard = setup_logging(&settings);

    let raw = read_input(cli.input.as_ref()).await?;

    let registry = Arc::new(settings.load_registry()?);
    let backend = create_provider(&settings.llm)?;
    let ai = AiClient::new(backend, settings.llm.timeout);
    let transport = create_transport(&settings.transport)?;
    let relays: Arc<dyn RelayFactory> = if cli.dry_run {
        Arc::new(Stdout)
    } else {
        Arc::new(SmtpRelays)
    };

    let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TracingSink)];
    if let Some(url) = &settings.webhook_url {
        match WebhookSink::new(url.clone(), settings.webhook_timeout) {
            Ok(sink) => sinks.push(Arc::new(sink)),
            Err(e) => warn!(error = %e, "Webhook sink disabled"),
        }
    }

    let pipeline = Pipeline::new(registry, ai, transport, Arc::new(FanoutSink::new(sinks)))
        .with_rules(settings.sender_rules()?)
        .with_prompt_builder(PromptBuilder::new(settings.min_preserved_chars))
        .with_composer(ReplyComposer::new(settings.quote_policy))
        .with_parser_options(settings.parser_options())
        .with_relays(relays);

    match pipeline.run(&raw).await {
        Ok(PipelineOutcome::Replied(outbound)) => {
            info!(to = %outbound.to.address, subject = %outbound.subject, "Done");
            Ok(ExitCode::SUCCESS)
        }
        Ok(PipelineOutcome::Skipped(_)) => Ok(ExitCode::SUCCESS),
        Err(failure) => {
            eprintln!("mail-assist: {failure}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn read_input(path: Option<&PathBuf>) -> anyhow::Result<Vec<u8>> {
    match path {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read {}", path.display())),
        None => {
            let mut raw = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut raw)
                .await
                .context("cannot read message from stdin")?;
            Ok(raw)
        }
    }
}

/// Stderr logging, plus a daily-rotated file when `MAIL_ASSIST_LOG_DIR` is
/// set. Stdout stays clean for the dry-run transport.
fn setup_logging(settings: &Settings) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    if let Some(dir) = &settings.log_dir
        && std::fs::create_dir_all(dir).is_ok()
    {
        let appender = tracing_appender::rolling::daily(dir, "mail-assist.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(writer);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
        return Some(guard);
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .init();
    None
}

//! Shipmate daemon and console.
//!
//! Wires the kernel to the console transport and the real adapters, runs
//! the scheduler loop, and serializes message handling per chat. Exits 0
//! on graceful shutdown (scheduler drained, every skill shut down);
//! a store that cannot initialize exits non-zero before any message is
//! accepted.

mod console;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use console::{ConsoleMessenger, CONSOLE_CHAT_ID};
use shipmate_core::adapters::{
    GitHubAdapter, GroqTranscriber, LocalProcessAdapter, MessagingAdapter, OpenAiCompatProvider,
    ProviderAdapter, SimulatedProcessAdapter, SourceControlAdapter, SubprocessAdapter,
    TranscriberAdapter,
};
use shipmate_core::audit::AuditLog;
use shipmate_core::config::{load_config, ShipmateConfig};
use shipmate_core::confirm::ConfirmationBroker;
use shipmate_core::cost::CostTracker;
use shipmate_core::orchestrator::{HttpHealthChecker, Orchestrator};
use shipmate_core::registry::ChatRegistry;
use shipmate_core::router::NLRouter;
use shipmate_core::scheduler::Scheduler;
use shipmate_core::secrets::{SecretCipher, SecretVault};
use shipmate_core::skills::dispatch::MessagePump;
use shipmate_core::skills::{SkillContext, SkillRuntime};
use shipmate_core::store::Store;
use shipmate_core::types::InboundMessage;
use shipmate_core::webhook::{DigestFlushHandler, DigestQueue, SourceEvent, WebhookFanout};

/// Shipmate: your repos and services, operated from chat.
#[derive(Parser, Debug)]
#[command(name = "shipmate", version, about, long_about = None)]
struct Cli {
    /// Workspace directory holding `.shipmate/config.toml`
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Force simulated subprocess execution (dev mode)
    #[arg(long)]
    dev: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("SHIPMATE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn classifier_from_env() -> Option<Arc<dyn ProviderAdapter>> {
    let key = std::env::var("GROQ_API_KEY").ok()?;
    Some(Arc::new(OpenAiCompatProvider::new(
        "https://api.groq.com/openai/v1",
        key,
        "groq",
        "llama-3.3-70b-versatile",
    )))
}

fn source_control_from_env() -> Option<Arc<dyn SourceControlAdapter>> {
    let token = std::env::var("GITHUB_TOKEN").ok()?;
    let owner = std::env::var("GITHUB_OWNER").ok()?;
    Some(Arc::new(GitHubAdapter::new(owner, token)))
}

/// Secret custody needs a base64 32-byte key in `SHIPMATE_SECRET_KEY`.
fn secret_vault_from_env(store: &Arc<Store>) -> Option<Arc<SecretVault>> {
    let key = std::env::var("SHIPMATE_SECRET_KEY").ok()?;
    match SecretCipher::from_base64(&key, "env-v1") {
        Ok(cipher) => Some(Arc::new(SecretVault::new(Arc::clone(store), cipher))),
        Err(e) => {
            warn!(error = %e, "SHIPMATE_SECRET_KEY unusable; secret custody disabled");
            None
        }
    }
}

fn transcriber_from_env() -> Option<Arc<dyn TranscriberAdapter>> {
    let key = std::env::var("GROQ_API_KEY").ok()?;
    Some(Arc::new(GroqTranscriber::new(
        "https://api.groq.com/openai/v1",
        key,
        "whisper-large-v3",
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config: ShipmateConfig =
        load_config(Some(&cli.workspace)).map_err(|e| anyhow::anyhow!("config: {e}"))?;
    let data_dir = config.resolved_data_dir();

    // An unusable store is fatal before the first message.
    let store = Arc::new(
        Store::open(&config.store_path())
            .with_context(|| format!("opening store at {}", config.store_path().display()))?,
    );
    std::fs::create_dir_all(config.audio_dir()).ok();

    let audit = Arc::new(AuditLog::default());
    let registry = Arc::new(ChatRegistry::new(Arc::clone(&store)));
    let cost = Arc::new(CostTracker::new(&config.cost));
    let confirm = Arc::new(ConfirmationBroker::new());
    let messenger: Arc<dyn MessagingAdapter> = Arc::new(ConsoleMessenger);

    let dev_mode = cli.dev || !LocalProcessAdapter::on_deploy_host();
    let subprocess: Arc<dyn SubprocessAdapter> = if dev_mode {
        info!("dev mode: subprocess execution is simulated");
        Arc::new(SimulatedProcessAdapter::new())
    } else {
        Arc::new(LocalProcessAdapter::new())
    };

    let orchestrator = Arc::new(Orchestrator::new(
        config.orchestrator.clone(),
        subprocess,
        Arc::clone(&confirm),
        Arc::clone(&audit),
        Arc::new(HttpHealthChecker::default()),
    ));

    let router = Arc::new(
        NLRouter::new(&config.router, classifier_from_env())
            .with_corrections_path(data_dir.join("corrections.json")),
    );

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&messenger),
        Arc::clone(&audit),
        config.scheduler.pool_size,
        Duration::from_secs(config.scheduler.tick_secs),
    );

    let digest = Arc::new(DigestQueue::new(Some(data_dir.join("digest.json"))));
    scheduler.register_handler(
        "digest_flush",
        Arc::new(DigestFlushHandler::new(Arc::clone(&messenger), Arc::clone(&digest))),
    );
    let fanout = Arc::new(WebhookFanout::new(
        Arc::clone(&registry),
        Arc::clone(&messenger),
        Arc::clone(&digest),
        Arc::clone(&audit),
    ));

    let services_store = Arc::clone(&store);
    let services = Arc::new(SkillContext {
        store,
        registry,
        cost,
        router,
        scheduler: Arc::clone(&scheduler),
        orchestrator,
        confirm: Arc::clone(&confirm),
        messenger: Arc::clone(&messenger),
        audit: Arc::clone(&audit),
        source_control: source_control_from_env(),
        secrets: secret_vault_from_env(&services_store),
    });

    let runtime = Arc::new(SkillRuntime::new(Arc::clone(&audit)));
    load_skills(&config, &runtime).await?;
    runtime.initialize(&services).await;

    // Evening digest flush, replaced on every boot so config changes take.
    if let Err(e) = scheduler.schedule(
        "digest-flush",
        shipmate_core::store::JobSpec::cron("0 0 18 * * *")
            .map_err(|e| anyhow::anyhow!("digest cron: {e}"))?,
        "digest_flush",
        serde_json::json!({}),
        None,
        true,
    ) {
        warn!(error = %e, "could not schedule digest flush");
    }

    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run(shutdown.clone()));

    // Sweep expired confirmation tokens in the background.
    let sweep_confirm = Arc::clone(&confirm);
    let sweep_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => { sweep_confirm.sweep(); }
                _ = sweep_shutdown.cancelled() => return,
            }
        }
    });

    let pump = MessagePump::new(Arc::clone(&runtime), Arc::clone(&services), transcriber_from_env());

    info!(skills = ?runtime.skill_names(), "shipmate ready; type a command, or 'quit'");
    run_console(&pump, &fanout).await;

    // Graceful shutdown: drain the scheduler, close mailboxes, shut
    // skills down. Reaching the end of main is exit code 0.
    shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        warn!(error = %e, "scheduler task join failed");
    }
    pump.shutdown().await;
    runtime.shutdown().await;
    info!("goodbye");
    Ok(())
}

/// Register skills: through the directory loader when configured, else
/// all built-ins directly.
async fn load_skills(config: &ShipmateConfig, runtime: &SkillRuntime) -> anyhow::Result<()> {
    match (&config.skills.dir, &config.skills.config_file) {
        (Some(dir), config_file) => {
            let config_path = config_file
                .clone()
                .unwrap_or_else(|| dir.join("skills.json"));
            let mut loader =
                shipmate_core::skills::loader::SkillLoader::new(dir.clone(), config_path);
            shipmate_skills::provide_builtins(&mut loader);
            let loaded = loader
                .load_into(runtime)
                .await
                .map_err(|e| anyhow::anyhow!("skill load: {e}"))?;
            info!(?loaded, "skills loaded from directory");
        }
        (None, _) => {
            shipmate_skills::register_builtin_skills(runtime).await;
        }
    }
    Ok(())
}

/// Read owner messages from stdin until EOF or `quit`. Lines of the form
/// `webhook <event_type> <json>` inject a parsed source-control event,
/// which is how the transport-side webhook receiver hands events in.
async fn run_console(pump: &Arc<MessagePump>, fanout: &Arc<WebhookFanout>) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if line == "quit" || line == "exit" {
                    return;
                }
                if let Some(rest) = line.strip_prefix("webhook ") {
                    inject_webhook(fanout, rest).await;
                    continue;
                }
                let result = pump
                    .process_one(InboundMessage::text(CONSOLE_CHAT_ID, "owner", line, "console"))
                    .await;
                println!("{}", result.message);
                if let Some(suggestion) = result.suggestion {
                    println!("  ({suggestion})");
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                return;
            }
        }
    }
}

async fn inject_webhook(fanout: &Arc<WebhookFanout>, rest: &str) {
    let Some((event_type, json)) = rest.split_once(' ') else {
        println!("usage: webhook <event_type> <json>");
        return;
    };
    match serde_json::from_str(json) {
        Ok(payload) => {
            let event = SourceEvent {
                event_type: event_type.to_string(),
                payload,
            };
            match fanout.ingest(&event).await {
                Ok(delivered) => println!("routed to {delivered} chat(s)"),
                Err(e) => println!("webhook failed: {e}"),
            }
        }
        Err(e) => println!("bad payload: {e}"),
    }
}

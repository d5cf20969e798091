//! Example: create a mailbox and watch it for verification codes.
//!
//! Starts a hub over the live providers, creates one account and prints every
//! event the background poller reports until Ctrl-C.
//!
//! # Usage
//!
//! ```bash
//! # Optional: wanted local-part and Snapmail key
//! export TEMPMAIL_PREFIX="shop007"
//! export SNAPMAIL_API_KEY="your-key"
//! # Set log level (trace, debug, info, warn, error)
//! export RUST_LOG=tempmail_hub=debug
//!
//! cargo run --example watch_codes
//! ```

use std::env;
use std::sync::Arc;
use std::time::Duration;
use tempmail_hub::providers::{default_adapters, DEFAULT_PRIORITY};
use tempmail_hub::{
    CreateAccount, Event, HubConfig, JsonFileBackend, MailHub, MemoryBackend, ProviderRegistry,
    SnapshotBackend,
};
use tokio::sync::mpsc;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> tempmail_hub::Result<()> {
    // Use RUST_LOG to control log levels, e.g. RUST_LOG=tempmail_hub=debug,info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tempmail_hub=info")),
        )
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    let mut builder = HubConfig::builder()
        .tick_interval(Duration::from_secs(10))
        .storage_dir("./tempmail-data");
    if let Ok(key) = env::var("SNAPMAIL_API_KEY") {
        builder = builder.snapmail_api_key(key);
    }
    let config = builder.build()?;

    let registry = ProviderRegistry::builder()
        .register_many(default_adapters(&config)?)
        .priority(DEFAULT_PRIORITY)
        .liveness_timeout(config.timeouts.liveness)
        .build()?;
    let backend: Arc<dyn SnapshotBackend> = match config.accounts_path() {
        Some(path) => Arc::new(JsonFileBackend::new(path)),
        None => Arc::new(MemoryBackend::new()),
    };

    let (events, mut rx) = mpsc::unbounded_channel();
    let hub = MailHub::open(config, registry, backend, Arc::new(events)).await?;

    // Populates list_domains and emits the first status changes
    hub.check_services().await;
    for entry in hub.list_domains() {
        tracing::info!(domain = %entry.domain, provider = %entry.provider_key, "Domain available");
    }

    let mut request = CreateAccount::new();
    if let Ok(prefix) = env::var("TEMPMAIL_PREFIX") {
        request = request.prefix(prefix);
    }
    let account = hub.create_account(request).await?;
    println!("\nSend mail to: {}\n", account.address());

    let poller = hub.spawn_poller();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => match event {
                Some(Event::VerificationCode { address, code, .. }) => {
                    println!("{address}: code {code}");
                }
                Some(Event::NewMessages { address, count, .. }) => {
                    println!("{address}: {count} new message(s)");
                }
                Some(Event::Backoff { delay, .. }) => {
                    tracing::warn!(delay_ms = delay.as_millis() as u64, "Provider asked us to slow down");
                }
                Some(other) => tracing::debug!(?other, "Event"),
                None => break,
            },
        }
    }

    poller.stop().await;
    tracing::info!("Example completed successfully");

    Ok(())
}

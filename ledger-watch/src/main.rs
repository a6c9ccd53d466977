//! ledger-watch: terminal follower for one live resource collection.
//!
//! Loads a collection over REST, keeps it current from the push channel,
//! and prints every change plus the alerts projected from pushed events.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{info, warn};

use ledger_sync::{
    CacheConfig, ChannelKey, ConnectionRegistry, FetchParams, HttpConfig, HttpResourceApi,
    Notification, NotificationProjector, ReconnectPolicy, RegistryConfig, ResourceCache,
    ResourceId, Severity,
};

/// Follow a ledger resource collection in real time
#[derive(Parser, Debug)]
#[command(name = "ledger-watch")]
#[command(version)]
#[command(about = "Follow a ledger resource collection in real time", long_about = None)]
struct Cli {
    /// Push channel base URL (e.g., ws://localhost:8000/ws)
    #[arg(long = "ws-url", env = "LEDGER_WS_URL", default_value = "ws://127.0.0.1:8000/ws")]
    ws_url: String,

    /// REST API base URL (e.g., http://localhost:8000/api)
    #[arg(long = "api-url", env = "LEDGER_API_URL", default_value = "http://127.0.0.1:8000/api")]
    api_url: String,

    /// Endpoint to load, relative to the API base
    #[arg(short = 'e', long = "endpoint")]
    endpoint: String,

    /// Channel resource type (defaults to the endpoint)
    #[arg(short = 't', long = "resource-type")]
    resource_type: Option<String>,

    /// Channel resource id
    #[arg(short = 'i', long = "resource-id", default_value = ChannelKey::ALL)]
    resource_id: String,

    #[arg(long = "page")]
    page: Option<u64>,

    #[arg(long = "per-page")]
    per_page: Option<u64>,

    /// Seconds between reconnect attempts
    #[arg(long = "retry-interval", default_value = "3")]
    retry_interval: u64,

    /// Reconnect attempts before giving up
    #[arg(long = "max-retries", default_value = "5")]
    max_retries: u32,

    /// HTTP request timeout in seconds
    #[arg(long = "timeout", default_value = "30")]
    timeout: u64,

    /// Print every item on each change instead of a summary
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

impl Cli {
    fn channel(&self) -> ChannelKey {
        let resource_type = self
            .resource_type
            .clone()
            .unwrap_or_else(|| self.endpoint.trim_matches('/').to_string());
        let resource_id = match self.resource_id.parse::<i64>() {
            Ok(id) => ResourceId::Int(id),
            Err(_) => ResourceId::Str(self.resource_id.clone()),
        };
        ChannelKey::new(resource_type, resource_id)
    }

    fn params(&self) -> FetchParams {
        let mut params = FetchParams::new();
        if let Some(page) = self.page {
            params = params.page(page);
        }
        if let Some(per_page) = self.per_page {
            params = params.per_page(per_page);
        }
        params
    }
}

fn print_notification(note: &Notification) {
    let marker = match note.severity {
        Severity::Info => "i",
        Severity::Success => "+",
        Severity::Warning => "!",
        Severity::Error => "x",
    };
    println!("[{marker}] {}: {}", note.title, note.message);
}

fn print_collection(cache: &ResourceCache, verbose: bool) {
    let snapshot = cache.snapshot();
    if snapshot.loading {
        println!("loading {}...", cache.endpoint());
        return;
    }
    if let Some(error) = &snapshot.error {
        println!("error: {error}");
    }
    let total = snapshot
        .pagination
        .as_ref()
        .and_then(|p| p.total)
        .map(|t| format!(" of {t}"))
        .unwrap_or_default();
    println!("{}: {} item(s){total}", cache.endpoint(), snapshot.items.len());
    if verbose {
        for item in &snapshot.items {
            println!("  {item}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let channel = cli.channel();
    info!("Watching {} on channel {channel}", cli.endpoint);

    let registry = ConnectionRegistry::with_websockets(RegistryConfig {
        ws_base_url: cli.ws_url.clone(),
        reconnect: ReconnectPolicy::new(Duration::from_secs(cli.retry_interval), cli.max_retries),
    });
    let api = Arc::new(HttpResourceApi::new(HttpConfig {
        base_url: cli.api_url.clone(),
        timeout_secs: cli.timeout,
    })?);

    let cache = ResourceCache::open(
        CacheConfig::new(cli.endpoint.clone())
            .channel(channel.clone())
            .params(cli.params()),
        api,
        Some(registry.clone()),
    )
    .await;

    let session = registry.get_or_create(&channel).await;
    let (alerts, mut notes) = NotificationProjector::default().attach(&session);
    let mut changes = cache.changes();
    print_collection(&cache, cli.verbose);

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                print_collection(&cache, cli.verbose);
            }
            note = notes.recv() => match note {
                Some(note) => print_notification(&note),
                None => {
                    warn!("Notification stream ended");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    alerts.unsubscribe();
    cache.dispose().await;
    registry.close_all().await;
    Ok(())
}

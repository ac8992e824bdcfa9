mod api;
mod config;
mod engine;
mod events;
mod format;
mod http;
mod liveness;
mod metrics;
mod model;
mod poll;
mod push;
mod render;
mod roster;
mod store;

use api::{ApiError, DashboardApi, DEFAULT_REQUEST_TIMEOUT};
use axum::serve;
use clap::{Parser, Subcommand};
use config::Config;
use engine::{EngineSettings, SyncEngine};
use events::SyncEvent;
use format::{format_bytes, format_percentage};
use metrics::Metrics;
use model::{AlertRuleInput, EntityId, MetricType};
use poll::SampleFetcher;
use push::{PushConnector, WsConnector};
use roster::{Roster, RosterSource};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleetsync")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./fleetsync.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Print the host dashboard on every render tick.
    #[arg(long)]
    watch: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sync engine until Ctrl+C (default).
    Run,
    /// Print the backend roster.
    Hosts,
    /// Print stored samples of one host.
    History {
        id: String,
        #[arg(long)]
        hours: Option<u32>,
    },
    /// Print window statistics of one host.
    Stats {
        id: String,
        #[arg(long)]
        hours: Option<u32>,
    },
    Alerts {
        #[command(subcommand)]
        action: AlertsCommand,
    },
    Settings {
        #[command(subcommand)]
        action: SettingsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsCommand {
    /// Print one setting, or all of them.
    Get { key: Option<String> },
    Set { key: String, value: String },
}

#[derive(Subcommand, Debug)]
enum AlertsCommand {
    List,
    Add {
        #[arg(long)]
        metric: MetricType,
        #[arg(long)]
        threshold: f64,
        #[arg(long)]
        duration_sec: Option<i64>,
        /// Limit the rule to one host; omitted means every host.
        #[arg(long)]
        client: Option<String>,
    },
    Delete {
        id: i64,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let api = match DashboardApi::new(&cfg.server_url, DEFAULT_REQUEST_TIMEOUT) {
        Ok(api) => Arc::new(api),
        Err(err) => {
            error!(error = %err, "failed to build backend client");
            std::process::exit(1);
        }
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(cfg, api, cli.watch).await,
        command => {
            if let Err(err) = run_command(&api, command).await {
                error!(error = %err, "command failed");
                std::process::exit(1);
            }
        }
    }
}

async fn run(cfg: Config, api: Arc<DashboardApi>, watch_mode: bool) {
    info!(
        listen = %cfg.listen,
        server_url = %cfg.server_url,
        push = cfg.push.enabled,
        poll_interval_ms = cfg.poll.interval_ms,
        "starting fleetsync"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    let fetcher: Arc<dyn SampleFetcher> = api.clone();
    let connector: Option<Arc<dyn PushConnector>> = if cfg.push.enabled {
        Some(Arc::new(
            WsConnector::new(cfg.push.url.clone())
                .with_connect_timeout(Duration::from_millis(cfg.push.backoff.interval_ms)),
        ))
    } else {
        None
    };
    let engine = SyncEngine::new(
        EngineSettings::from(&cfg),
        fetcher,
        connector,
        metrics.clone(),
    );
    let roster = Arc::new(Roster::new());
    let events_task = tokio::spawn(log_events(engine.subscribe()));
    let push_state_task = engine.watch_connection().map(|rx| tokio::spawn(log_push_state(rx)));
    engine.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let listen = cfg.listen.clone();
        let app = http::build_router(metrics.clone(), engine.clone(), roster.clone());
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to start HTTP server");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let roster_task = {
        let source: Arc<dyn RosterSource> = api.clone();
        tokio::spawn(roster::run_roster_refresh(
            source,
            engine.clone(),
            roster.clone(),
            Duration::from_secs(cfg.roster.refresh_secs),
            shutdown_rx.clone(),
        ))
    };

    let render_task = watch_mode.then(|| {
        tokio::spawn(render::run_render_loop(
            engine.clone(),
            roster.clone(),
            Duration::from_millis(cfg.render.interval_ms),
            shutdown_rx.clone(),
        ))
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(true);

    let _ = roster_task.await;
    if let Some(task) = render_task {
        let _ = task.await;
    }
    engine.stop();
    events_task.abort();
    if let Some(task) = push_state_task {
        task.abort();
    }
    let _ = http_task.await;
}

async fn log_events(mut events: broadcast::Receiver<SyncEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => debug!(?event, "sync event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn log_push_state(mut state: watch::Receiver<push::ConnectionState>) {
    while state.changed().await.is_ok() {
        let current = *state.borrow_and_update();
        if current.is_degraded() {
            warn!(state = %current, "push channel degraded, polling only");
        } else {
            info!(state = %current, "push channel state changed");
        }
    }
}

async fn run_command(api: &DashboardApi, command: Command) -> Result<(), ApiError> {
    match command {
        Command::Run => {}
        Command::Hosts => {
            for entry in api.list_clients().await? {
                println!(
                    "{:<38} {:<24} {:<10} last seen {}",
                    entry.id,
                    entry.hostname,
                    entry.version.as_deref().unwrap_or("-"),
                    entry.last_seen
                );
            }
        }
        Command::History { id, hours } => {
            for s in api.history(&EntityId::new(id), hours).await? {
                println!(
                    "{}  cpu {:>6} ram {:>6} disk {:>6} inode {:>6} gpu {:>6} docker {}",
                    s.timestamp.to_rfc3339(),
                    format_percentage(Some(s.cpu())),
                    format_percentage(Some(s.ram())),
                    format_percentage(Some(s.disk())),
                    format_percentage(Some(s.inode())),
                    format_percentage(s.gpu()),
                    format_bytes(s.docker_size),
                );
            }
        }
        Command::Stats { id, hours } => {
            for st in api.stats(&EntityId::new(id), hours).await? {
                println!(
                    "{:<6} min {:>6.1} max {:>6.1} avg {:>6.1} p95 {:>6.1} ({} samples)",
                    st.metric_type, st.min, st.max, st.avg, st.p95, st.count
                );
            }
        }
        Command::Alerts { action } => match action {
            AlertsCommand::List => {
                for rule in api.alert_rules().await? {
                    let scope = rule
                        .client_id
                        .as_ref()
                        .map(EntityId::to_string)
                        .unwrap_or_else(|| "*".to_string());
                    println!(
                        "#{:<4} {:<38} {:<6} >= {:.1}% for {}",
                        rule.id,
                        scope,
                        rule.metric_type,
                        rule.threshold,
                        humantime::format_duration(Duration::from_secs(
                            rule.duration_sec.max(0) as u64
                        ))
                    );
                }
            }
            AlertsCommand::Add {
                metric,
                threshold,
                duration_sec,
                client,
            } => {
                let rule = api
                    .create_alert_rule(&AlertRuleInput {
                        client_id: client.map(EntityId::new),
                        metric_type: metric,
                        threshold,
                        duration_sec,
                    })
                    .await?;
                println!("created alert rule #{}", rule.id);
            }
            AlertsCommand::Delete { id } => {
                api.delete_alert_rule(id).await?;
                println!("deleted alert rule #{id}");
            }
        },
        Command::Settings { action } => match action {
            SettingsCommand::Get { key } => {
                let mut settings: Vec<_> = api.settings().await?.into_iter().collect();
                settings.sort();
                for (k, v) in settings {
                    if key.as_ref().map_or(true, |key| *key == k) {
                        println!("{k}={v}");
                    }
                }
            }
            SettingsCommand::Set { key, value } => {
                api.update_settings(&HashMap::from([(key.clone(), value)])).await?;
                println!("updated {key}");
            }
        },
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

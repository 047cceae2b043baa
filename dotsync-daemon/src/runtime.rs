use std::future::IntoFuture;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;

use dotsync_core::{AgentConfig, PushMessage, SyncKind};
use dotsync_sync::{
    BrokerNotifier, CommitSource, GitOracle, JsonStatusStore, NotificationSink, NullSink,
    SyncPipeline, SyncStrategy,
};

use crate::error::{io_err, DaemonError};
use crate::events::{EventLog, EventLogConsumer};
use crate::http::{router, AppState};
use crate::paths::{listen_addr, EVENT_LOG_CAPACITY, SHUTDOWN_GRACE};
use crate::poll::poll_task;
use crate::relay::{relay_task, RelaySettings};
use crate::trigger::TriggerState;

/// Everything a sync needs, wired from configuration.
pub struct Agent {
    pub config: AgentConfig,
    pub client: reqwest::Client,
    pub oracle: Arc<dyn CommitSource>,
    pub sink: Arc<dyn NotificationSink>,
    pub events: EventLog,
    pub pipeline: Arc<SyncPipeline>,
}

impl Agent {
    /// Validate `config` and build the pipeline and its collaborators.
    pub fn assemble(config: AgentConfig) -> Result<Self, DaemonError> {
        config.validate()?;
        let layout = config.layout()?;
        let state_dir = config.state_dir()?;
        let timing = config.timing.clone();

        let client = reqwest::Client::builder()
            .connect_timeout(timing.request_timeout())
            .build()?;

        let oracle = GitOracle::new(
            client.clone(),
            layout.clone(),
            config.api_base_url.clone(),
            config.github_token.clone().unwrap_or_default(),
            timing.request_timeout(),
            timing.command_timeout(),
        )
        .into_shared();

        let sink: Arc<dyn NotificationSink> = match config.broker() {
            Some(broker) => {
                tracing::info!(broker = %broker.url, machine = %broker.machine_id, "broker notifications enabled");
                Arc::new(BrokerNotifier::new(client.clone(), broker, timing.request_timeout()))
            }
            None => Arc::new(NullSink),
        };

        let strategy = SyncStrategy::new(config.strategy, layout, timing.command_timeout());
        let events = EventLog::new(EVENT_LOG_CAPACITY);
        let pipeline = SyncPipeline::new(
            Arc::new(strategy),
            Arc::clone(&oracle),
            Arc::clone(&sink),
            Arc::new(JsonStatusStore::new(&state_dir)),
        )
        .with_default_consumer(Arc::new(EventLogConsumer::new(events.clone())));

        Ok(Self {
            config,
            client,
            oracle,
            sink,
            events,
            pipeline: Arc::new(pipeline),
        })
    }
}

/// Start the agent and block the current thread until it exits.
pub fn start_blocking(config: AgentConfig) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config))
}

/// Run the agent until ctrl-c or until any of its tasks exits.
pub async fn run(config: AgentConfig) -> Result<(), DaemonError> {
    let agent = Agent::assemble(config)?;
    let started_at_unix = unix_seconds_now();
    let timing = agent.config.timing.clone();

    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let (trigger_state, trigger_rx) =
        TriggerState::new(agent.config.branch.clone(), timing.debounce_window());

    {
        let oracle = Arc::clone(&agent.oracle);
        let sink = Arc::clone(&agent.sink);
        tokio::spawn(async move {
            let local = oracle
                .local_head()
                .await
                .map_err(|err| tracing::debug!(error = %err, "no local checkout yet"))
                .ok();
            if let Err(err) = sink.register(local.as_ref()).await {
                tracing::warn!(error = %err, "broker registration failed");
            }
        });
    }

    let server_handle = {
        let shutdown = shutdown_tx.clone();
        let state = AppState::new(Arc::clone(&agent.pipeline), agent.events.clone(), started_at_unix);
        let port = agent.config.port;
        tokio::spawn(async move {
            let result = http_server_task(state, port, shutdown.subscribe(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let relay_handle = {
        let shutdown = shutdown_tx.clone();
        let client = agent.client.clone();
        let pipeline = Arc::clone(&agent.pipeline);
        let webhook_url = agent.config.webhook_url.clone();
        let timing = timing.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            let result = match webhook_url {
                Some(url) => {
                    let settings = RelaySettings {
                        url,
                        subscription_timeout: timing.subscription_timeout(),
                        retry_backoff: timing.retry_backoff(),
                    };
                    let on_fire = move |_: &PushMessage| spawn_automatic_run(&pipeline);
                    relay_task(client, settings, trigger_state, on_fire, shutdown_rx).await
                }
                None => {
                    tracing::info!("no webhook relay configured, relying on polling");
                    let _ = shutdown_rx.recv().await;
                    Ok(())
                }
            };
            let _ = shutdown.send(());
            result
        })
    };

    let poll_handle = {
        let shutdown = shutdown_tx.clone();
        let pipeline = Arc::clone(&agent.pipeline);
        let events = agent.events.clone();
        let poll_interval = timing.poll_interval();
        tokio::spawn(async move {
            let result =
                poll_task(pipeline, events, trigger_rx, poll_interval, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down agent");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Task(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (server_result, relay_result, poll_result, signal_result) =
        tokio::join!(server_handle, relay_handle, poll_handle, signal_handle);

    handle_join("http_server", server_result)?;
    handle_join("relay", relay_result)?;
    handle_join("poll", poll_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

/// Start an automatic run on its own task; the run lock orders it after any
/// run already in flight.
fn spawn_automatic_run(pipeline: &Arc<SyncPipeline>) {
    let pipeline = Arc::clone(pipeline);
    tokio::spawn(async move {
        match pipeline.run(SyncKind::Automatic, Vec::new()).await {
            Ok(outcome) if !outcome.success => {
                tracing::warn!(step = outcome.failed_step.as_deref().unwrap_or_default(), "automatic sync failed");
            }
            Ok(_) => {}
            Err(err) => tracing::error!(error = %err, "automatic sync could not run"),
        }
    });
}

async fn http_server_task(
    state: AppState,
    port: u16,
    mut graceful_rx: broadcast::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let addr = listen_addr(port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| DaemonError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    tracing::info!(%addr, "agent listening");

    let serve = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = graceful_rx.recv().await;
        })
        .into_future();

    // Live streams never end on their own; give them a grace period.
    tokio::select! {
        result = serve => result.map_err(|e| io_err("http-server", e)),
        _ = async {
            let _ = shutdown_rx.recv().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            tracing::warn!("closing open response streams");
            Ok(())
        }
    }
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Task(format!("{task} task join failure: {err}"))),
    }
}

pub fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `RUST_LOG` filters (default `info`); `DOTSYNC_LOG_FORMAT=json` switches to
/// JSON lines.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("DOTSYNC_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let _ = if json {
        fmt().json().with_env_filter(filter).try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotsync_core::{ConfigError, StrategyKind};
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> AgentConfig {
        AgentConfig {
            repository: Some("https://github.com/octo/dotfiles.git".into()),
            github_token: Some("token".into()),
            dotfile_path: Some(tmp.path().join("dotfiles")),
            state_dir: Some(tmp.path().join("state")),
            home_dir: Some(tmp.path().join("home")),
            strategy: StrategyKind::Stow,
            ..AgentConfig::default()
        }
    }

    #[test]
    fn assemble_requires_a_token() {
        let tmp = TempDir::new().unwrap();
        let mut config = config(&tmp);
        config.github_token = None;
        assert!(matches!(
            Agent::assemble(config),
            Err(DaemonError::Config(ConfigError::MissingToken))
        ));
    }

    #[tokio::test]
    async fn assembled_agent_is_idle() {
        let tmp = TempDir::new().unwrap();
        let agent = Agent::assemble(config(&tmp)).unwrap();
        assert!(!agent.pipeline.is_running());
        assert!(agent.events.latest_status().is_none());
    }

    #[tokio::test]
    async fn occupied_port_is_a_bind_error() {
        let tmp = TempDir::new().unwrap();
        let agent = Agent::assemble(config(&tmp)).unwrap();
        let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let state = AppState::new(agent.pipeline, agent.events, 0);
        let err = http_server_task(state, port, shutdown_tx.subscribe(), shutdown_tx.subscribe())
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Bind { .. }));
    }
}
